// ─────────────────────────────────────────────────────────────────────
// JointInv — Level-Set to Property Mappings
// ─────────────────────────────────────────────────────────────────────
//! Mapping trait, reference mappings, and level-set restriction.
//!
//! A mapping turns the level-set components it reads into one
//! physical property. Mappings are pure; they only check that their
//! input lives on the discretization they were built for.

use jointinv_types::{Discretization, Field, InversionError, InversionResult};

use crate::chain::Jacobian;

/// Trait for level-set → property mappings.
pub trait Mapping: Send + Sync {
    /// Discretization the mapping is defined on.
    fn domain(&self) -> Discretization;

    /// Property value for the (restricted) level set `m`.
    fn value(&self, m: &Field) -> InversionResult<Field>;

    /// `dp/dm`, shaped `property ++ input`.
    fn derivative(&self, m: &Field) -> InversionResult<Jacobian>;

    /// Level-set components producing property `p`.
    fn inverse(&self, p: &Field) -> InversionResult<Field>;
}

/// Identity-shaped Jacobian scaled point-wise: `J[i, k] = d[i] if i == k`.
fn diagonal_jacobian(m: &Field, diag: impl Fn(usize, usize) -> f64) -> InversionResult<Jacobian> {
    let len = m.point_size();
    let shape: Vec<usize> = m.shape().iter().chain(m.shape()).copied().collect();
    let field = Field::from_fn(m.domain(), &shape, |p, c| {
        let (i, k) = (c / len, c % len);
        if i == k {
            diag(p, i)
        } else {
            0.0
        }
    });
    Jacobian::new(field, m.shape(), m.shape())
}

/// `p = offset + scale * m`, component-wise.
#[derive(Debug, Clone)]
pub struct LinearMapping {
    domain: Discretization,
    offset: f64,
    scale: f64,
}

impl LinearMapping {
    pub fn new(domain: Discretization, offset: f64, scale: f64) -> InversionResult<Self> {
        if !(scale.is_finite() && scale != 0.0) || !offset.is_finite() {
            return Err(InversionError::Config(format!(
                "linear mapping needs a finite non-zero scale and finite offset, got scale={scale}, offset={offset}"
            )));
        }
        Ok(Self {
            domain,
            offset,
            scale,
        })
    }
}

impl Mapping for LinearMapping {
    fn domain(&self) -> Discretization {
        self.domain
    }

    fn value(&self, m: &Field) -> InversionResult<Field> {
        m.check_domain(&self.domain, "LinearMapping::value")?;
        Ok(m.map(|v| self.offset + self.scale * v))
    }

    fn derivative(&self, m: &Field) -> InversionResult<Jacobian> {
        m.check_domain(&self.domain, "LinearMapping::derivative")?;
        diagonal_jacobian(m, |_, _| self.scale)
    }

    fn inverse(&self, p: &Field) -> InversionResult<Field> {
        p.check_domain(&self.domain, "LinearMapping::inverse")?;
        Ok(p.map(|v| (v - self.offset) / self.scale))
    }
}

/// `p = p0 * exp(k * m)`, component-wise. Keeps properties positive.
#[derive(Debug, Clone)]
pub struct ExponentialMapping {
    domain: Discretization,
    p0: f64,
    k: f64,
}

impl ExponentialMapping {
    pub fn new(domain: Discretization, p0: f64, k: f64) -> InversionResult<Self> {
        if !(p0.is_finite() && p0 > 0.0) || !(k.is_finite() && k != 0.0) {
            return Err(InversionError::Config(format!(
                "exponential mapping needs p0 > 0 and k != 0, got p0={p0}, k={k}"
            )));
        }
        Ok(Self { domain, p0, k })
    }
}

impl Mapping for ExponentialMapping {
    fn domain(&self) -> Discretization {
        self.domain
    }

    fn value(&self, m: &Field) -> InversionResult<Field> {
        m.check_domain(&self.domain, "ExponentialMapping::value")?;
        Ok(m.map(|v| self.p0 * (self.k * v).exp()))
    }

    fn derivative(&self, m: &Field) -> InversionResult<Jacobian> {
        m.check_domain(&self.domain, "ExponentialMapping::derivative")?;
        diagonal_jacobian(m, |p, i| self.k * self.p0 * (self.k * m.at(p)[i]).exp())
    }

    fn inverse(&self, p: &Field) -> InversionResult<Field> {
        p.check_domain(&self.domain, "ExponentialMapping::inverse")?;
        if p.values().iter().any(|&v| v <= 0.0) {
            return Err(InversionError::Numerical(
                "exponential mapping inverse needs strictly positive properties".to_string(),
            ));
        }
        Ok(p.map(|v| (v / self.p0).ln() / self.k))
    }
}

/// Scalar property from several level-set components:
/// `p = offset + Σ_k w_k * m_k`.
#[derive(Debug, Clone)]
pub struct WeightedSumMapping {
    domain: Discretization,
    weights: Vec<f64>,
    offset: f64,
}

impl WeightedSumMapping {
    pub fn new(domain: Discretization, weights: Vec<f64>, offset: f64) -> InversionResult<Self> {
        let norm: f64 = weights.iter().map(|w| w * w).sum();
        if weights.is_empty() || !norm.is_finite() || norm == 0.0 {
            return Err(InversionError::Config(
                "weighted sum mapping needs at least one finite non-zero weight".to_string(),
            ));
        }
        Ok(Self {
            domain,
            weights,
            offset,
        })
    }

    fn check_input(&self, m: &Field) -> InversionResult<()> {
        let n = self.weights.len();
        let ok = match m.shape() {
            [] => n == 1,
            [len] => *len == n,
            _ => false,
        };
        if !ok {
            return Err(InversionError::ShapeMismatch(format!(
                "weighted sum of {n} components applied to shape {:?}",
                m.shape()
            )));
        }
        Ok(())
    }
}

impl Mapping for WeightedSumMapping {
    fn domain(&self) -> Discretization {
        self.domain
    }

    fn value(&self, m: &Field) -> InversionResult<Field> {
        m.check_domain(&self.domain, "WeightedSumMapping::value")?;
        self.check_input(m)?;
        Ok(Field::from_fn(self.domain, &[], |p, _| {
            self.offset
                + m.at(p)
                    .iter()
                    .zip(&self.weights)
                    .map(|(v, w)| v * w)
                    .sum::<f64>()
        }))
    }

    fn derivative(&self, m: &Field) -> InversionResult<Jacobian> {
        m.check_domain(&self.domain, "WeightedSumMapping::derivative")?;
        self.check_input(m)?;
        let field = Field::from_fn(self.domain, m.shape(), |_, k| self.weights[k]);
        Jacobian::new(field, &[], m.shape())
    }

    /// Minimum-norm preimage.
    fn inverse(&self, p: &Field) -> InversionResult<Field> {
        p.check_domain(&self.domain, "WeightedSumMapping::inverse")?;
        if p.rank() != 0 {
            return Err(InversionError::ShapeMismatch(format!(
                "weighted sum property is scalar, got shape {:?}",
                p.shape()
            )));
        }
        let norm: f64 = self.weights.iter().map(|w| w * w).sum();
        let shape: &[usize] = if self.weights.len() == 1 {
            &[]
        } else {
            &[self.weights.len()]
        };
        let n = self.weights.len();
        Ok(Field::from_fn(self.domain, shape, |pt, k| {
            self.weights[k % n] * (p.at(pt)[0] - self.offset) / norm
        }))
    }
}

/// Per-point shape of a level-set model with `num_level_sets` components.
pub fn level_set_shape(num_level_sets: usize) -> Vec<usize> {
    if num_level_sets == 1 {
        Vec::new()
    } else {
        vec![num_level_sets]
    }
}

fn check_level_set_indices(indices: &[usize], num_level_sets: usize) -> InversionResult<()> {
    if let Some(&bad) = indices.iter().find(|&&k| k >= num_level_sets) {
        return Err(InversionError::IndexOutOfRange(format!(
            "level-set index {bad} >= num_level_sets ({num_level_sets})"
        )));
    }
    Ok(())
}

/// Level-set components a mapping reads.
///
/// Empty `indices` (or a single-component model) → the whole model;
/// one index → that component; several → a vector of those components.
pub fn restrict_level_set(
    m: &Field,
    indices: &[usize],
    num_level_sets: usize,
) -> InversionResult<Field> {
    check_level_set_indices(indices, num_level_sets)?;
    match indices {
        _ if num_level_sets == 1 => Ok(m.clone()),
        [] => Ok(m.clone()),
        [k] => m.component(*k),
        _ => m.select(indices),
    }
}

/// Write restricted components back into a full level set.
pub fn insert_level_set(
    m: &mut Field,
    indices: &[usize],
    value: &Field,
    num_level_sets: usize,
) -> InversionResult<()> {
    check_level_set_indices(indices, num_level_sets)?;
    match indices {
        _ if num_level_sets == 1 => {
            value.check_compatible(m, "insert_level_set")?;
            *m = value.clone();
        }
        [] => {
            value.check_compatible(m, "insert_level_set")?;
            *m = value.clone();
        }
        [k] => m.set_component(*k, value)?,
        _ => {
            for (i, &k) in indices.iter().enumerate() {
                m.set_component(k, &value.component(i)?)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom() -> Discretization {
        Discretization::new(3, 4, 0.25).unwrap()
    }

    #[test]
    fn test_linear_value_and_inverse() {
        let map = LinearMapping::new(dom(), 1.0, 2.0).unwrap();
        let m = Field::from_fn(dom(), &[], |p, _| p as f64);
        let p = map.value(&m).unwrap();
        assert_eq!(p.values(), &[1.0, 3.0, 5.0, 7.0]);
        assert_eq!(map.inverse(&p).unwrap(), m);
    }

    #[test]
    fn test_linear_rejects_zero_scale() {
        assert!(LinearMapping::new(dom(), 0.0, 0.0).is_err());
    }

    #[test]
    fn test_linear_vector_jacobian_is_diagonal() {
        let map = LinearMapping::new(dom(), 0.0, 3.0).unwrap();
        let m = Field::zeros(dom(), &[2]);
        let j = map.derivative(&m).unwrap();
        assert_eq!(j.rank(), 2);
        assert_eq!(j.field().at(0), &[3.0, 0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_domain_mismatch() {
        let map = LinearMapping::new(dom(), 0.0, 1.0).unwrap();
        let other = Field::zeros(Discretization::new(4, 4, 0.25).unwrap(), &[]);
        assert!(matches!(
            map.value(&other),
            Err(InversionError::DomainMismatch(_))
        ));
        assert!(matches!(
            map.derivative(&other),
            Err(InversionError::DomainMismatch(_))
        ));
    }

    #[test]
    fn test_exponential_derivative_matches_difference() {
        let map = ExponentialMapping::new(dom(), 2.0, 0.7).unwrap();
        let m = Field::from_fn(dom(), &[], |p, _| 0.1 * p as f64);
        let h = 1e-6;
        let fd = map
            .value(&m.map(|v| v + h))
            .unwrap()
            .values()
            .iter()
            .zip(map.value(&m.map(|v| v - h)).unwrap().values())
            .map(|(a, b)| (a - b) / (2.0 * h))
            .collect::<Vec<_>>();
        let j = map.derivative(&m).unwrap();
        for (a, b) in j.field().values().iter().zip(&fd) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_exponential_inverse_needs_positive() {
        let map = ExponentialMapping::new(dom(), 1.0, 1.0).unwrap();
        assert!(map.inverse(&Field::zeros(dom(), &[])).is_err());
    }

    #[test]
    fn test_weighted_sum_jacobian() {
        let map = WeightedSumMapping::new(dom(), vec![0.5, -2.0], 1.0).unwrap();
        let m = Field::constant(dom(), &[2], 1.0);
        assert_eq!(map.value(&m).unwrap().values()[0], -0.5);
        let j = map.derivative(&m).unwrap();
        assert_eq!(j.property_shape(), &[] as &[usize]);
        assert_eq!(j.input_shape(), &[2]);
        assert_eq!(j.field().at(0), &[0.5, -2.0]);
    }

    #[test]
    fn test_weighted_sum_inverse_reproduces_property() {
        let map = WeightedSumMapping::new(dom(), vec![1.0, 2.0], 0.5).unwrap();
        let p = Field::constant(dom(), &[], 3.0);
        let m = map.inverse(&p).unwrap();
        let back = map.value(&m).unwrap();
        assert!((back.values()[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_restrict_cases() {
        let m = Field::from_fn(dom(), &[3], |_, c| c as f64);
        assert_eq!(restrict_level_set(&m, &[], 3).unwrap(), m);
        assert_eq!(restrict_level_set(&m, &[2], 3).unwrap().rank(), 0);
        let sel = restrict_level_set(&m, &[2, 1], 3).unwrap();
        assert_eq!(sel.at(0), &[2.0, 1.0]);
        assert!(matches!(
            restrict_level_set(&m, &[3], 3),
            Err(InversionError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_restrict_single_level_set_is_whole_model() {
        let m = Field::constant(dom(), &[], 2.0);
        assert_eq!(restrict_level_set(&m, &[0], 1).unwrap(), m);
    }

    #[test]
    fn test_insert_level_set() {
        let mut m = Field::zeros(dom(), &[3]);
        let v = Field::from_fn(dom(), &[2], |_, c| 1.0 + c as f64);
        insert_level_set(&mut m, &[2, 0], &v, 3).unwrap();
        assert_eq!(m.at(0), &[2.0, 0.0, 1.0]);
    }
}
