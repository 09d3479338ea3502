// ─────────────────────────────────────────────────────────────────────
// JointInv — Level-Set Regularization
// ─────────────────────────────────────────────────────────────────────
//! Regularization trait and a Tikhonov reference implementation.
//!
//! The gradient of a regularization is two-part: `Y` pairs with a
//! perturbation `v` of the level set, `X` with its spatial gradient
//! `∇v`, so the directional derivative is `Σ Y·v + Σ X·∇v`
//! (`get_dual_product`).

use jointinv_types::{Discretization, Field, Gradient, InversionError, InversionResult};

use crate::mapping::level_set_shape;

/// Trait for level-set regularizations.
///
/// One replica lives in every subworld; only the owner's value and
/// gradient are counted.
pub trait Regularization: Send + Sync {
    fn num_level_sets(&self) -> usize;

    /// Hook called once per evaluation point.
    fn set_point(&mut self, m: &Field) -> InversionResult<()> {
        let _ = m;
        Ok(())
    }

    fn get_value(&self, m: &Field) -> InversionResult<f64>;

    fn get_gradient(&self, m: &Field) -> InversionResult<Gradient>;

    /// `None` resets every factor to 1.
    fn set_trade_off_factors_for_variation(&mut self, mu: Option<&[f64]>) -> InversionResult<()>;

    /// `None` resets every factor to 1.
    fn set_trade_off_factors_for_cross_gradient(
        &mut self,
        mu_c: Option<&[f64]>,
    ) -> InversionResult<()>;

    /// All factors, variation first then cross-gradient.
    fn set_trade_off_factors(&mut self, factors: &[f64]) -> InversionResult<()>;

    fn get_trade_off_factors(&self) -> Vec<f64>;

    fn num_trade_off_factors(&self) -> usize;

    /// Approximate `H⁻¹ r` for the gradient `r`.
    fn get_inverse_hessian_approximation(
        &mut self,
        m: &Field,
        r: &Gradient,
    ) -> InversionResult<Field>;

    fn update_hessian(&mut self) -> InversionResult<()>;

    /// `<r, x>` for a level-set perturbation `x`.
    fn get_dual_product(&self, x: &Field, r: &Gradient) -> InversionResult<f64>;

    fn get_norm(&self, m: &Field) -> InversionResult<f64>;
}

/// Forward difference of component `k`; the last point has no edge.
fn spatial_gradient(m: &Field, k: usize) -> Vec<f64> {
    let n = m.num_points();
    let h = m.domain().spacing;
    (0..n)
        .map(|p| {
            if p + 1 < n {
                (m.at(p + 1)[k] - m.at(p)[k]) / h
            } else {
                0.0
            }
        })
        .collect()
}

/// Adjoint of `spatial_gradient` applied to an edge field.
fn spatial_divergence(x: &[f64], h: f64) -> Vec<f64> {
    let n = x.len();
    (0..n)
        .map(|p| {
            let left = if p >= 1 { x[p - 1] } else { 0.0 };
            let right = if p + 1 < n { x[p] } else { 0.0 };
            (left - right) / h
        })
        .collect()
}

fn component(m: &Field, k: usize) -> Vec<f64> {
    (0..m.num_points()).map(|p| m.at(p)[k]).collect()
}

fn check_factors(what: &str, values: &[f64], expected: usize, allow_zero: bool) -> InversionResult<()> {
    if values.len() != expected {
        return Err(InversionError::InvalidTradeOff(format!(
            "{what}: expected {expected} factor(s), got {}",
            values.len()
        )));
    }
    let bad = values
        .iter()
        .find(|&&v| !v.is_finite() || v < 0.0 || (!allow_zero && v == 0.0));
    if let Some(v) = bad {
        return Err(InversionError::InvalidTradeOff(format!(
            "{what}: factor {v} must be finite and {}",
            if allow_zero { ">= 0" } else { "> 0" }
        )));
    }
    Ok(())
}

/// Zeroth- plus first-order Tikhonov with cross-gradient coupling:
///
/// ```text
/// J = ½ Σ_k mu_k Σ_p (w0 m_k² + w1 |∇m_k|²) h
///   + ¼ Σ_{a<b} mu_c[a,b] Σ_p (∇m_a ∇m_b)² h
/// ```
///
/// On a 1-D grid the cross-gradient of two level sets reduces to the
/// product of their slopes.
#[derive(Debug, Clone)]
pub struct L2Regularization {
    domain: Discretization,
    num_level_sets: usize,
    w0: f64,
    w1: f64,
    mu: Vec<f64>,
    mu_c: Vec<f64>,
    point: Option<Field>,
    hessian_diag: Option<Vec<Vec<f64>>>,
}

impl L2Regularization {
    pub fn new(
        domain: Discretization,
        num_level_sets: usize,
        w0: f64,
        w1: f64,
    ) -> InversionResult<Self> {
        if num_level_sets < 1 {
            return Err(InversionError::Config(
                "regularization needs at least one level set".to_string(),
            ));
        }
        if !(w0.is_finite() && w0 > 0.0) || !(w1.is_finite() && w1 >= 0.0) {
            return Err(InversionError::Config(format!(
                "regularization weights need w0 > 0 and w1 >= 0, got w0={w0}, w1={w1}"
            )));
        }
        let pairs = num_level_sets * (num_level_sets - 1) / 2;
        Ok(Self {
            domain,
            num_level_sets,
            w0,
            w1,
            mu: vec![1.0; num_level_sets],
            mu_c: vec![1.0; pairs],
            point: None,
            hessian_diag: None,
        })
    }

    fn num_pairs(&self) -> usize {
        self.mu_c.len()
    }

    /// Flat index of the unordered pair `(a, b)`, `a < b`.
    fn pair_index(&self, a: usize, b: usize) -> usize {
        let n = self.num_level_sets;
        a * (2 * n - a - 1) / 2 + (b - a - 1)
    }

    fn cross_factor(&self, a: usize, b: usize) -> f64 {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.mu_c[self.pair_index(lo, hi)]
    }

    fn check_model(&self, m: &Field, what: &str) -> InversionResult<()> {
        m.check_domain(&self.domain, what)?;
        let expected = level_set_shape(self.num_level_sets);
        if m.shape() != expected.as_slice() {
            return Err(InversionError::ShapeMismatch(format!(
                "{what}: level set of {} component(s) needs shape {expected:?}, got {:?}",
                self.num_level_sets,
                m.shape()
            )));
        }
        Ok(())
    }

    fn slopes(&self, m: &Field) -> Vec<Vec<f64>> {
        (0..self.num_level_sets)
            .map(|k| spatial_gradient(m, k))
            .collect()
    }

    /// Gauss-Newton diagonal per component and point. Cross-gradient
    /// curvature is evaluated at the last point passed to `set_point`.
    fn build_hessian_diag(&self) -> Vec<Vec<f64>> {
        let n = self.domain.num_points;
        let h = self.domain.spacing;
        let slopes = self.point.as_ref().map(|m| self.slopes(m));
        (0..self.num_level_sets)
            .map(|a| {
                let edge: Vec<f64> = (0..n.saturating_sub(1))
                    .map(|e| {
                        let mut c = self.mu[a] * self.w1;
                        if let Some(g) = &slopes {
                            for b in (0..self.num_level_sets).filter(|&b| b != a) {
                                c += 0.5 * self.cross_factor(a, b) * g[b][e] * g[b][e];
                            }
                        }
                        c
                    })
                    .collect();
                (0..n)
                    .map(|p| {
                        let left = if p >= 1 { edge[p - 1] } else { 0.0 };
                        let right = if p + 1 < n { edge[p] } else { 0.0 };
                        self.mu[a] * self.w0 * h + (left + right) / h
                    })
                    .collect()
            })
            .collect()
    }
}

impl Regularization for L2Regularization {
    fn num_level_sets(&self) -> usize {
        self.num_level_sets
    }

    fn set_point(&mut self, m: &Field) -> InversionResult<()> {
        self.check_model(m, "L2Regularization::set_point")?;
        self.point = Some(m.clone());
        Ok(())
    }

    fn get_value(&self, m: &Field) -> InversionResult<f64> {
        self.check_model(m, "L2Regularization::get_value")?;
        let h = self.domain.spacing;
        let g = self.slopes(m);
        let mut j = 0.0;
        for k in 0..self.num_level_sets {
            let mk = component(m, k);
            let s: f64 = mk
                .iter()
                .zip(&g[k])
                .map(|(v, d)| self.w0 * v * v + self.w1 * d * d)
                .sum();
            j += 0.5 * self.mu[k] * s * h;
        }
        for a in 0..self.num_level_sets {
            for b in a + 1..self.num_level_sets {
                let s: f64 = g[a].iter().zip(&g[b]).map(|(x, y)| (x * y).powi(2)).sum();
                j += 0.25 * self.cross_factor(a, b) * s * h;
            }
        }
        Ok(j)
    }

    fn get_gradient(&self, m: &Field) -> InversionResult<Gradient> {
        self.check_model(m, "L2Regularization::get_gradient")?;
        let n = self.num_level_sets;
        let h = self.domain.spacing;
        let g = self.slopes(m);
        let y = Field::from_fn(self.domain, m.shape(), |p, k| {
            self.mu[k] * self.w0 * m.at(p)[k] * h
        });
        let x = Field::from_fn(self.domain, m.shape(), |p, a| {
            let mut v = self.mu[a] * self.w1 * g[a][p];
            for b in (0..n).filter(|&b| b != a) {
                v += 0.5 * self.cross_factor(a, b) * g[a][p] * g[b][p] * g[b][p];
            }
            v * h
        });
        Gradient::new(y, x)
    }

    fn set_trade_off_factors_for_variation(&mut self, mu: Option<&[f64]>) -> InversionResult<()> {
        let values = match mu {
            Some(v) => v.to_vec(),
            None => vec![1.0; self.num_level_sets],
        };
        check_factors("variation", &values, self.num_level_sets, false)?;
        self.mu = values;
        self.hessian_diag = None;
        Ok(())
    }

    fn set_trade_off_factors_for_cross_gradient(
        &mut self,
        mu_c: Option<&[f64]>,
    ) -> InversionResult<()> {
        let values = match mu_c {
            Some(v) => v.to_vec(),
            None => vec![1.0; self.num_pairs()],
        };
        check_factors("cross-gradient", &values, self.num_pairs(), true)?;
        self.mu_c = values;
        self.hessian_diag = None;
        Ok(())
    }

    fn set_trade_off_factors(&mut self, factors: &[f64]) -> InversionResult<()> {
        let n = self.num_level_sets;
        if factors.len() != self.num_trade_off_factors() {
            return Err(InversionError::InvalidTradeOff(format!(
                "expected {} regularization factor(s), got {}",
                self.num_trade_off_factors(),
                factors.len()
            )));
        }
        check_factors("variation", &factors[..n], n, false)?;
        check_factors("cross-gradient", &factors[n..], self.num_pairs(), true)?;
        self.mu = factors[..n].to_vec();
        self.mu_c = factors[n..].to_vec();
        self.hessian_diag = None;
        Ok(())
    }

    fn get_trade_off_factors(&self) -> Vec<f64> {
        self.mu.iter().chain(&self.mu_c).copied().collect()
    }

    fn num_trade_off_factors(&self) -> usize {
        self.num_level_sets + self.num_pairs()
    }

    fn get_inverse_hessian_approximation(
        &mut self,
        m: &Field,
        r: &Gradient,
    ) -> InversionResult<Field> {
        self.check_model(m, "L2Regularization::get_inverse_hessian_approximation")?;
        r.y.check_compatible(m, "inverse Hessian Y")?;
        r.x.check_compatible(m, "inverse Hessian X")?;
        if self.hessian_diag.is_none() {
            self.hessian_diag = Some(self.build_hessian_diag());
        }
        let diag = match &self.hessian_diag {
            Some(d) => d,
            None => return Err(InversionError::Numerical("Hessian diagonal unavailable".into())),
        };
        let h = self.domain.spacing;
        let div: Vec<Vec<f64>> = (0..self.num_level_sets)
            .map(|k| spatial_divergence(&component(&r.x, k), h))
            .collect();
        let mut out = m.zeros_like();
        for p in 0..m.num_points() {
            for k in 0..self.num_level_sets {
                let d = diag[k][p];
                if !(d.is_finite() && d > 0.0) {
                    return Err(InversionError::Numerical(format!(
                        "non-positive Hessian diagonal {d} at point {p}, component {k}"
                    )));
                }
                out.at_mut(p)[k] = (r.y.at(p)[k] + div[k][p]) / d;
            }
        }
        Ok(out)
    }

    fn update_hessian(&mut self) -> InversionResult<()> {
        self.hessian_diag = Some(self.build_hessian_diag());
        Ok(())
    }

    fn get_dual_product(&self, x: &Field, r: &Gradient) -> InversionResult<f64> {
        self.check_model(x, "L2Regularization::get_dual_product")?;
        r.y.check_compatible(x, "dual product Y")?;
        r.x.check_compatible(x, "dual product X")?;
        let mut s = r.y.dot(x)?;
        for k in 0..self.num_level_sets {
            let dx = spatial_gradient(x, k);
            s += (0..x.num_points())
                .map(|p| r.x.at(p)[k] * dx[p])
                .sum::<f64>();
        }
        Ok(s)
    }

    fn get_norm(&self, m: &Field) -> InversionResult<f64> {
        self.check_model(m, "L2Regularization::get_norm")?;
        let s: f64 = m.values().iter().map(|v| v * v).sum();
        Ok((s * self.domain.spacing).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom() -> Discretization {
        Discretization::new(11, 6, 0.5).unwrap()
    }

    fn model2() -> Field {
        Field::from_fn(dom(), &[2], |p, k| {
            let x = p as f64;
            if k == 0 {
                0.3 * x - 0.1 * x * x
            } else {
                (0.7 * x).sin()
            }
        })
    }

    #[test]
    fn test_constant_model_value() {
        let reg = L2Regularization::new(dom(), 1, 1.0, 5.0).unwrap();
        let m = Field::constant(dom(), &[], 2.0);
        // no slope: ½ · 6 points · 4 · 0.5
        assert!((reg.get_value(&m).unwrap() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_factor_counts() {
        let reg = L2Regularization::new(dom(), 3, 1.0, 1.0).unwrap();
        assert_eq!(reg.num_trade_off_factors(), 6);
        assert_eq!(reg.get_trade_off_factors(), vec![1.0; 6]);
    }

    #[test]
    fn test_pair_index_is_dense() {
        let reg = L2Regularization::new(dom(), 4, 1.0, 1.0).unwrap();
        let mut seen = Vec::new();
        for a in 0..4 {
            for b in a + 1..4 {
                seen.push(reg.pair_index(a, b));
            }
        }
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut reg = L2Regularization::new(dom(), 2, 0.8, 1.3).unwrap();
        reg.set_trade_off_factors(&[2.0, 0.5, 3.0]).unwrap();
        let m = model2();
        let v = Field::from_fn(dom(), &[2], |p, k| ((p + 2 * k) as f64).cos());
        let eps = 1e-6;
        let mut plus = m.clone();
        plus.add_assign(&v.scaled(eps)).unwrap();
        let mut minus = m.clone();
        minus.add_assign(&v.scaled(-eps)).unwrap();
        let fd = (reg.get_value(&plus).unwrap() - reg.get_value(&minus).unwrap()) / (2.0 * eps);
        let grad = reg.get_gradient(&m).unwrap();
        let dual = reg.get_dual_product(&v, &grad).unwrap();
        assert!((fd - dual).abs() < 1e-6, "fd={fd} dual={dual}");
    }

    #[test]
    fn test_variation_factors_validated() {
        let mut reg = L2Regularization::new(dom(), 2, 1.0, 1.0).unwrap();
        assert!(matches!(
            reg.set_trade_off_factors_for_variation(Some(&[1.0, 0.0])),
            Err(InversionError::InvalidTradeOff(_))
        ));
        assert!(reg.set_trade_off_factors_for_variation(Some(&[1.0])).is_err());
        assert_eq!(reg.get_trade_off_factors(), vec![1.0, 1.0, 1.0]);
        reg.set_trade_off_factors_for_variation(Some(&[2.0, 4.0])).unwrap();
        reg.set_trade_off_factors_for_cross_gradient(Some(&[0.0])).unwrap();
        assert_eq!(reg.get_trade_off_factors(), vec![2.0, 4.0, 0.0]);
        reg.set_trade_off_factors_for_variation(None).unwrap();
        assert_eq!(reg.get_trade_off_factors(), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_wrong_model_shape() {
        let reg = L2Regularization::new(dom(), 2, 1.0, 1.0).unwrap();
        assert!(matches!(
            reg.get_value(&Field::zeros(dom(), &[])),
            Err(InversionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_inverse_hessian_inverts_pure_l2() {
        // w1 = 0: H = mu w0 h I, so H⁻¹ (mu w0 h m) = m.
        let mut reg = L2Regularization::new(dom(), 1, 2.0, 0.0).unwrap();
        let m = Field::from_fn(dom(), &[], |p, _| p as f64 - 2.5);
        let grad = reg.get_gradient(&m).unwrap();
        let dm = reg.get_inverse_hessian_approximation(&m, &grad).unwrap();
        for (a, b) in dm.values().iter().zip(m.values()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_update_hessian_uses_point() {
        let mut reg = L2Regularization::new(dom(), 2, 1.0, 1.0).unwrap();
        let m = model2();
        let r = reg.get_gradient(&m).unwrap();
        let before = reg.get_inverse_hessian_approximation(&m, &r).unwrap();
        reg.set_point(&m).unwrap();
        reg.update_hessian().unwrap();
        let after = reg.get_inverse_hessian_approximation(&m, &r).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_norm() {
        let reg = L2Regularization::new(dom(), 1, 1.0, 1.0).unwrap();
        let m = Field::constant(dom(), &[], 2.0);
        // sqrt(6 · 4 · 0.5)
        assert!((reg.get_norm(&m).unwrap() - 12f64.sqrt()).abs() < 1e-12);
    }
}
