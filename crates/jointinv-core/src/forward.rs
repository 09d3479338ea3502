// ─────────────────────────────────────────────────────────────────────
// JointInv — Forward Model Interface
// ─────────────────────────────────────────────────────────────────────
//! Forward model trait and reference implementations.
//!
//! In production a forward model solves a PDE (gravity, magnetics,
//! DC resistivity, ...) behind this trait. The cost function never
//! looks inside; it routes properties in and gradients out.

use jointinv_types::{Field, InversionError, InversionResult};

/// Trait for forward models.
///
/// `props` are the physical properties the model consumes, in the
/// order of its mapping index set. `args` is whatever
/// `get_arguments` returned for the same `props`.
pub trait ForwardModel: Send + Sync {
    /// Pre-computed values shared by `get_defect` and `get_gradient`.
    fn get_arguments(&self, props: &[Field]) -> InversionResult<Vec<Field>> {
        let _ = props;
        Ok(Vec::new())
    }

    /// Data defect `J_f(p)`.
    fn get_defect(&self, props: &[Field], args: &[Field]) -> InversionResult<f64>;

    /// `dJ_f/dp`, the consumed properties' gradients stacked
    /// contiguously. A single property keeps its own shape.
    fn get_gradient(&self, props: &[Field], args: &[Field]) -> InversionResult<Field>;
}

/// Weighted point-wise least-squares misfit against an observed field:
/// `J = ½ w Σ_p |P(p) − d(p)|²`, where `P` stacks the consumed properties.
#[derive(Debug, Clone)]
pub struct LeastSquaresModel {
    observed: Field,
    weight: f64,
}

impl LeastSquaresModel {
    pub fn new(observed: Field, weight: f64) -> InversionResult<Self> {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(InversionError::Config(format!(
                "misfit weight must be finite and > 0, got {weight}"
            )));
        }
        if !observed.is_finite() {
            return Err(InversionError::Numerical(
                "observed data contains NaN/Inf".to_string(),
            ));
        }
        Ok(Self { observed, weight })
    }

    pub fn observed(&self) -> &Field {
        &self.observed
    }

    /// Stacked prediction minus data, in gradient layout.
    fn residual(&self, props: &[Field]) -> InversionResult<Field> {
        if props.is_empty() {
            return Err(InversionError::ShapeMismatch(
                "least-squares model needs at least one property".to_string(),
            ));
        }
        let domain = self.observed.domain();
        for p in props {
            p.check_domain(&domain, "LeastSquaresModel")?;
        }
        let total: usize = props.iter().map(Field::point_size).sum();
        if total != self.observed.point_size() {
            return Err(InversionError::ShapeMismatch(format!(
                "properties stack to {total} values per point, observed data has {}",
                self.observed.point_size()
            )));
        }
        let shape: Vec<usize> = match props {
            [single] => single.shape().to_vec(),
            _ => vec![total],
        };
        let mut stacked = Vec::with_capacity(domain.num_points * total);
        for pt in 0..domain.num_points {
            for p in props {
                stacked.extend_from_slice(p.at(pt));
            }
        }
        let mut residual = Field::from_values(domain, &shape, stacked)?;
        for (r, d) in residual.values_mut().iter_mut().zip(self.observed.values()) {
            *r -= d;
        }
        Ok(residual)
    }

    fn cached_residual(&self, props: &[Field], args: &[Field]) -> InversionResult<Field> {
        match args.first() {
            Some(r) => Ok(r.clone()),
            None => self.residual(props),
        }
    }
}

impl ForwardModel for LeastSquaresModel {
    fn get_arguments(&self, props: &[Field]) -> InversionResult<Vec<Field>> {
        Ok(vec![self.residual(props)?])
    }

    fn get_defect(&self, props: &[Field], args: &[Field]) -> InversionResult<f64> {
        let r = self.cached_residual(props, args)?;
        Ok(0.5 * self.weight * r.values().iter().map(|v| v * v).sum::<f64>())
    }

    fn get_gradient(&self, props: &[Field], args: &[Field]) -> InversionResult<Field> {
        Ok(self.cached_residual(props, args)?.scaled(self.weight))
    }
}

type DefectFn = Box<dyn Fn(&[Field]) -> InversionResult<f64> + Send + Sync>;
type GradientFn = Box<dyn Fn(&[Field]) -> InversionResult<Field> + Send + Sync>;

/// Forward model backed by two function pointers.
///
/// Used by the PyO3 layer to delegate the PDE solve back to Python.
pub struct ExternalForwardModel {
    defect_fn: DefectFn,
    gradient_fn: GradientFn,
}

impl ExternalForwardModel {
    pub fn new(
        defect_fn: impl Fn(&[Field]) -> InversionResult<f64> + Send + Sync + 'static,
        gradient_fn: impl Fn(&[Field]) -> InversionResult<Field> + Send + Sync + 'static,
    ) -> Self {
        Self {
            defect_fn: Box::new(defect_fn),
            gradient_fn: Box::new(gradient_fn),
        }
    }
}

impl ForwardModel for ExternalForwardModel {
    fn get_defect(&self, props: &[Field], _args: &[Field]) -> InversionResult<f64> {
        let j = (self.defect_fn)(props)?;
        if !j.is_finite() {
            return Err(InversionError::Numerical(format!(
                "external forward model returned non-finite defect {j}"
            )));
        }
        Ok(j)
    }

    fn get_gradient(&self, props: &[Field], _args: &[Field]) -> InversionResult<Field> {
        let g = (self.gradient_fn)(props)?;
        if !g.is_finite() {
            return Err(InversionError::Numerical(
                "external forward model returned a non-finite gradient".to_string(),
            ));
        }
        Ok(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jointinv_types::Discretization;

    fn dom() -> Discretization {
        Discretization::new(5, 3, 1.0).unwrap()
    }

    #[test]
    fn test_least_squares_defect() {
        let model = LeastSquaresModel::new(Field::constant(dom(), &[], 1.0), 2.0).unwrap();
        let p = Field::constant(dom(), &[], 3.0);
        // ½ · 2 · 3 · (3 - 1)² = 12
        let j = model.get_defect(&[p], &[]).unwrap();
        assert!((j - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_least_squares_gradient_keeps_property_shape() {
        let model = LeastSquaresModel::new(Field::zeros(dom(), &[2, 2]), 1.0).unwrap();
        let p = Field::constant(dom(), &[2, 2], 1.0);
        let g = model.get_gradient(&[p], &[]).unwrap();
        assert_eq!(g.shape(), &[2, 2]);
    }

    #[test]
    fn test_least_squares_stacks_properties() {
        let model = LeastSquaresModel::new(Field::zeros(dom(), &[3]), 1.0).unwrap();
        let a = Field::constant(dom(), &[], 1.0);
        let b = Field::constant(dom(), &[2], 2.0);
        let g = model.get_gradient(&[a, b], &[]).unwrap();
        assert_eq!(g.shape(), &[3]);
        assert_eq!(g.at(0), &[1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_least_squares_cached_arguments() {
        let model = LeastSquaresModel::new(Field::zeros(dom(), &[]), 1.0).unwrap();
        let p = [Field::constant(dom(), &[], 2.0)];
        let args = model.get_arguments(&p).unwrap();
        assert_eq!(
            model.get_defect(&p, &args).unwrap(),
            model.get_defect(&p, &[]).unwrap()
        );
    }

    #[test]
    fn test_least_squares_size_mismatch() {
        let model = LeastSquaresModel::new(Field::zeros(dom(), &[2]), 1.0).unwrap();
        let p = Field::zeros(dom(), &[]);
        assert!(matches!(
            model.get_defect(&[p], &[]),
            Err(InversionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_least_squares_rejects_bad_weight() {
        assert!(LeastSquaresModel::new(Field::zeros(dom(), &[]), 0.0).is_err());
    }

    #[test]
    fn test_external_model() {
        let model = ExternalForwardModel::new(
            |props| Ok(props[0].sum()),
            |props| Ok(props[0].zeros_like()),
        );
        let p = Field::constant(dom(), &[], 0.5);
        assert!((model.get_defect(&[p.clone()], &[]).unwrap() - 1.5).abs() < 1e-12);
        assert_eq!(model.get_gradient(&[p], &[]).unwrap().sum(), 0.0);
    }

    #[test]
    fn test_external_model_nan_defect() {
        let model = ExternalForwardModel::new(|_| Ok(f64::NAN), |p| Ok(p[0].clone()));
        let p = Field::zeros(dom(), &[]);
        assert!(matches!(
            model.get_defect(&[p], &[]),
            Err(InversionError::Numerical(_))
        ));
    }

    #[test]
    fn test_external_model_nan_gradient() {
        let model = ExternalForwardModel::new(
            |_| Ok(0.0),
            |p| Ok(p[0].map(|v| if v > 0.5 { f64::NAN } else { v })),
        );
        let ok = Field::zeros(dom(), &[]);
        assert!(model.get_gradient(&[ok], &[]).is_ok());
        let bad = Field::from_fn(dom(), &[], |p, _| p as f64);
        assert!(matches!(
            model.get_gradient(&[bad], &[]),
            Err(InversionError::Numerical(_))
        ));
    }
}
