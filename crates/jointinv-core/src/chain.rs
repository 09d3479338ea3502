// ─────────────────────────────────────────────────────────────────────
// JointInv — Chain-Rule Gradient Assembly
// ─────────────────────────────────────────────────────────────────────
//! Level set → mapping → property → forward model.
//!
//! A forward model returns `dJ_f/dp` for the properties it consumes,
//! stacked contiguously per point. Each property carries the Jacobian
//! of its mapping, `dp/dm_sub`, where `m_sub` is the restricted level
//! set the mapping reads. The contribution to level-set component
//! `idx_m[k]` is
//!
//! ```text
//! Y[idx_m[k]] += mu_f * Σ_i Ys[s + i] * J[i, k]
//! ```
//!
//! with `s` the offset of the property's segment in the stacked
//! gradient. Row-major storage makes that one contraction valid for
//! scalar, vector and matrix gradients alike; `GradOp` only decides
//! which layout check the gradient must pass first.

use jointinv_types::{Field, InversionError, InversionResult};

/// Jacobian of a mapping: per-point shape `property_shape ++ input_shape`.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    field: Field,
    property_shape: Vec<usize>,
    input_shape: Vec<usize>,
}

impl Jacobian {
    pub fn new(
        field: Field,
        property_shape: &[usize],
        input_shape: &[usize],
    ) -> InversionResult<Self> {
        let expected: Vec<usize> = property_shape
            .iter()
            .chain(input_shape)
            .copied()
            .collect();
        if field.shape() != expected.as_slice() {
            return Err(InversionError::ShapeMismatch(format!(
                "Jacobian field has shape {:?}, property {property_shape:?} x input {input_shape:?} needs {expected:?}",
                field.shape()
            )));
        }
        Ok(Self {
            field,
            property_shape: property_shape.to_vec(),
            input_shape: input_shape.to_vec(),
        })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn property_shape(&self) -> &[usize] {
        &self.property_shape
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn property_len(&self) -> usize {
        self.property_shape.iter().product()
    }

    pub fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// rank(property) + rank(level-set input).
    pub fn rank(&self) -> usize {
        self.field.rank()
    }
}

/// Layout rule for one forward model's gradient, chosen from `rank(Ys)`.
///
/// All three variants share the contraction in [`accumulate`]; the
/// variant selects the validation applied to the stacked gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradOp {
    /// Scalar gradient of a model consuming a single scalar property.
    Rank0,
    /// Vector gradient: one segment per consumed property, segment
    /// length = property size, inner product against the Jacobian.
    Rank1,
    /// Matrix gradient read row-major, segmented like `Rank1`.
    Rank2,
}

impl GradOp {
    pub fn dispatch(ys: &Field) -> InversionResult<Self> {
        match ys.rank() {
            0 => Ok(GradOp::Rank0),
            1 => Ok(GradOp::Rank1),
            2 => Ok(GradOp::Rank2),
            r => Err(InversionError::ShapeMismatch(format!(
                "forward model gradient must have rank 0, 1 or 2, got rank {r}"
            ))),
        }
    }

    fn check_layout(self, ys: &Field, targets: &[ChainTarget<'_>]) -> InversionResult<()> {
        let total: usize = targets.iter().map(|t| t.jacobian.property_len()).sum();
        match self {
            GradOp::Rank0 => {
                if targets.len() != 1 || total != 1 {
                    return Err(InversionError::ShapeMismatch(format!(
                        "scalar gradient needs exactly one scalar property, got {} properties of total size {total}",
                        targets.len()
                    )));
                }
            }
            GradOp::Rank1 | GradOp::Rank2 => {
                if ys.point_size() != total {
                    return Err(InversionError::ShapeMismatch(format!(
                        "stacked gradient of shape {:?} has {} entries, consumed properties need {total}",
                        ys.shape(),
                        ys.point_size()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One consumed property: its mapping Jacobian and the level-set
/// components the mapping reads (empty = the whole model).
#[derive(Debug, Clone, Copy)]
pub struct ChainTarget<'a> {
    pub jacobian: &'a Jacobian,
    pub level_sets: &'a [usize],
}

/// Add `mu * dJ_f/dm` into the model-space gradient `y`.
///
/// `targets` must list the consumed properties in the order the forward
/// model stacks its gradient.
pub fn accumulate(
    y: &mut Field,
    ys: &Field,
    targets: &[ChainTarget<'_>],
    mu: f64,
) -> InversionResult<GradOp> {
    let op = GradOp::dispatch(ys)?;
    op.check_layout(ys, targets)?;
    ys.check_domain(&y.domain(), "forward model gradient")?;
    if y.rank() > 1 {
        return Err(InversionError::ShapeMismatch(format!(
            "level-set gradient must be scalar or vector valued, got shape {:?}",
            y.shape()
        )));
    }
    let y_size = y.point_size();

    let mut plan: Vec<(usize, &Jacobian, Vec<usize>)> = Vec::with_capacity(targets.len());
    let mut offset = 0;
    for t in targets {
        t.jacobian
            .field()
            .check_domain(&y.domain(), "mapping derivative")?;
        let input_len = t.jacobian.input_len();
        let dest = if t.level_sets.is_empty() {
            if input_len != y_size {
                return Err(InversionError::ShapeMismatch(format!(
                    "unrestricted mapping derivative covers {input_len} level-set components, model has {y_size}"
                )));
            }
            (0..input_len).collect()
        } else {
            if t.level_sets.len() != input_len {
                return Err(InversionError::ShapeMismatch(format!(
                    "mapping reads {} level-set components but its derivative covers {input_len}",
                    t.level_sets.len()
                )));
            }
            if let Some(&bad) = t.level_sets.iter().find(|&&k| k >= y_size) {
                return Err(InversionError::IndexOutOfRange(format!(
                    "level-set index {bad} >= {y_size}"
                )));
            }
            t.level_sets.to_vec()
        };
        plan.push((offset, t.jacobian, dest));
        offset += t.jacobian.property_len();
    }

    for p in 0..y.num_points() {
        let g = ys.at(p);
        for (offset, jac, dest) in &plan {
            let property_len = jac.property_len();
            let input_len = jac.input_len();
            let j = jac.field().at(p);
            for (k, &d) in dest.iter().enumerate() {
                let mut acc = 0.0;
                for i in 0..property_len {
                    acc += g[offset + i] * j[i * input_len + k];
                }
                y.at_mut(p)[d] += acc * mu;
            }
        }
    }
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jointinv_types::Discretization;

    fn dom() -> Discretization {
        Discretization::new(1, 2, 1.0).unwrap()
    }

    fn jac(values: Vec<f64>, property: &[usize], input: &[usize]) -> Jacobian {
        let shape: Vec<usize> = property.iter().chain(input).copied().collect();
        Jacobian::new(Field::from_values(dom(), &shape, values).unwrap(), property, input).unwrap()
    }

    #[test]
    fn test_jacobian_shape_checked() {
        let f = Field::zeros(dom(), &[2]);
        assert!(Jacobian::new(f.clone(), &[2], &[]).is_ok());
        assert!(Jacobian::new(f, &[2], &[2]).is_err());
    }

    #[test]
    fn test_rank_variants_agree_for_scalar_property() {
        let mu = 1.5;
        let ys_vals = vec![2.0, -1.0];
        let j_vals = vec![3.0, 0.5];

        let mut y0 = Field::zeros(dom(), &[]);
        let ys0 = Field::from_values(dom(), &[], ys_vals.clone()).unwrap();
        let j0 = jac(j_vals.clone(), &[], &[]);
        let op0 = accumulate(&mut y0, &ys0, &[ChainTarget { jacobian: &j0, level_sets: &[0] }], mu).unwrap();

        let mut y1 = Field::zeros(dom(), &[]);
        let ys1 = Field::from_values(dom(), &[1], ys_vals.clone()).unwrap();
        let j1 = jac(j_vals.clone(), &[1], &[]);
        let op1 = accumulate(&mut y1, &ys1, &[ChainTarget { jacobian: &j1, level_sets: &[0] }], mu).unwrap();

        let mut y2 = Field::zeros(dom(), &[]);
        let ys2 = Field::from_values(dom(), &[1, 1], ys_vals).unwrap();
        let j2 = jac(j_vals, &[1, 1], &[]);
        let op2 = accumulate(&mut y2, &ys2, &[ChainTarget { jacobian: &j2, level_sets: &[0] }], mu).unwrap();

        assert_eq!((op0, op1, op2), (GradOp::Rank0, GradOp::Rank1, GradOp::Rank2));
        assert!((y0.values()[0] - 9.0).abs() < 1e-12);
        assert!((y0.values()[1] + 0.75).abs() < 1e-12);
        assert_eq!(y0.values(), y1.values());
        assert_eq!(y0.values(), y2.values());
    }

    #[test]
    fn test_vector_and_matrix_property_agree() {
        // A 4-entry property read from two level sets, once as a vector
        // and once reshaped as a 2x2 matrix.
        let ys_vals: Vec<f64> = (0..8).map(|v| v as f64 * 0.25 - 1.0).collect();
        let j_vals: Vec<f64> = (0..16).map(|v| (v as f64).sin()).collect();

        let mut y_vec = Field::zeros(dom(), &[2]);
        let ys_vec = Field::from_values(dom(), &[4], ys_vals.clone()).unwrap();
        let j_vec = jac(j_vals.clone(), &[4], &[2]);
        accumulate(&mut y_vec, &ys_vec, &[ChainTarget { jacobian: &j_vec, level_sets: &[] }], 2.0)
            .unwrap();

        let mut y_mat = Field::zeros(dom(), &[2]);
        let ys_mat = Field::from_values(dom(), &[2, 2], ys_vals).unwrap();
        let j_mat = jac(j_vals, &[2, 2], &[2]);
        accumulate(&mut y_mat, &ys_mat, &[ChainTarget { jacobian: &j_mat, level_sets: &[] }], 2.0)
            .unwrap();

        for (a, b) in y_vec.values().iter().zip(y_mat.values()) {
            assert!((a - b).abs() < 1e-12, "{a} != {b}");
        }
    }

    #[test]
    fn test_stacked_scalar_properties_route_to_their_level_sets() {
        // Model consumes property A (from m[1]) then property B (from m[0]).
        let mut y = Field::zeros(dom(), &[2]);
        let ys = Field::from_values(dom(), &[2], vec![1.0, 10.0, 2.0, 20.0]).unwrap();
        let ja = jac(vec![3.0, 3.0], &[], &[]);
        let jb = jac(vec![0.5, 0.5], &[], &[]);
        let targets = [
            ChainTarget { jacobian: &ja, level_sets: &[1] },
            ChainTarget { jacobian: &jb, level_sets: &[0] },
        ];
        accumulate(&mut y, &ys, &targets, 1.0).unwrap();
        assert_eq!(y.values(), &[5.0, 3.0, 10.0, 6.0]);
    }

    #[test]
    fn test_scalar_property_from_two_level_sets() {
        let mut y = Field::zeros(dom(), &[3]);
        let ys = Field::constant(dom(), &[], 2.0);
        let j = jac(vec![1.0, -1.0, 1.0, -1.0], &[], &[2]);
        accumulate(&mut y, &ys, &[ChainTarget { jacobian: &j, level_sets: &[2, 0] }], 0.5).unwrap();
        assert_eq!(y.at(0), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mut y = Field::zeros(dom(), &[]);
        let ys = Field::zeros(dom(), &[3]);
        let j = jac(vec![1.0, 1.0], &[], &[]);
        assert!(matches!(
            accumulate(&mut y, &ys, &[ChainTarget { jacobian: &j, level_sets: &[] }], 1.0),
            Err(InversionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_rank3_gradient_rejected() {
        let ys = Field::zeros(dom(), &[1, 1, 1]);
        assert!(GradOp::dispatch(&ys).is_err());
    }

    #[test]
    fn test_level_set_index_checked() {
        let mut y = Field::zeros(dom(), &[2]);
        let ys = Field::zeros(dom(), &[]);
        let j = jac(vec![1.0, 1.0], &[], &[]);
        assert!(matches!(
            accumulate(&mut y, &ys, &[ChainTarget { jacobian: &j, level_sets: &[2] }], 1.0),
            Err(InversionError::IndexOutOfRange(_))
        ));
    }
}
