// ─────────────────────────────────────────────────────────────────────
// JointInv — Discretized Fields
// ─────────────────────────────────────────────────────────────────────
//! Point-wise tensor fields on a shared discretization.
//!
//! A `Field` stores one tensor of a fixed per-point `shape` for every
//! point of its `Discretization`, point-major: the values of point `p`
//! occupy `values[p * point_size .. (p + 1) * point_size]`, row-major
//! within the point. Rank 0 (scalar), 1 (vector) and 2 (matrix) are
//! the ranks physical properties use; Jacobians may go higher.

use serde::{Deserialize, Serialize};

use crate::error::{InversionError, InversionResult};

/// Opaque handle of a discretization: a 1-D regular point set.
///
/// Two fields can only be combined when their discretizations are
/// equal. Every subworld holds its own copy of the driver's domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discretization {
    pub id: u64,
    pub num_points: usize,
    pub spacing: f64,
}

impl Discretization {
    pub fn new(id: u64, num_points: usize, spacing: f64) -> InversionResult<Self> {
        if num_points == 0 {
            return Err(InversionError::Config(
                "discretization needs at least one point".to_string(),
            ));
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(InversionError::Config(format!(
                "discretization spacing must be finite and > 0, got {spacing}"
            )));
        }
        Ok(Self {
            id,
            num_points,
            spacing,
        })
    }
}

#[inline]
fn shape_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Values of a fixed per-point shape on a discretization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    domain: Discretization,
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl Field {
    pub fn zeros(domain: Discretization, shape: &[usize]) -> Self {
        Self::constant(domain, shape, 0.0)
    }

    pub fn constant(domain: Discretization, shape: &[usize], value: f64) -> Self {
        Self {
            domain,
            shape: shape.to_vec(),
            values: vec![value; domain.num_points * shape_len(shape)],
        }
    }

    /// Build from point-major values, checking the length.
    pub fn from_values(
        domain: Discretization,
        shape: &[usize],
        values: Vec<f64>,
    ) -> InversionResult<Self> {
        let expected = domain.num_points * shape_len(shape);
        if values.len() != expected {
            return Err(InversionError::ShapeMismatch(format!(
                "{} values for {} points of shape {:?} (expected {expected})",
                values.len(),
                domain.num_points,
                shape
            )));
        }
        Ok(Self {
            domain,
            shape: shape.to_vec(),
            values,
        })
    }

    /// Build from `f(point, flat_component)`.
    pub fn from_fn(
        domain: Discretization,
        shape: &[usize],
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> Self {
        let size = shape_len(shape);
        let mut values = Vec::with_capacity(domain.num_points * size);
        for p in 0..domain.num_points {
            for c in 0..size {
                values.push(f(p, c));
            }
        }
        Self {
            domain,
            shape: shape.to_vec(),
            values,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.domain, &self.shape)
    }

    pub fn domain(&self) -> Discretization {
        self.domain
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_points(&self) -> usize {
        self.domain.num_points
    }

    /// Number of values per point (1 for a scalar field).
    pub fn point_size(&self) -> usize {
        shape_len(&self.shape)
    }

    /// Extent of the leading axis; a scalar field has one component.
    pub fn num_components(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Flat values of one point.
    pub fn at(&self, point: usize) -> &[f64] {
        let n = self.point_size();
        &self.values[point * n..(point + 1) * n]
    }

    pub fn at_mut(&mut self, point: usize) -> &mut [f64] {
        let n = self.point_size();
        &mut self.values[point * n..(point + 1) * n]
    }

    pub fn check_domain(&self, domain: &Discretization, what: &str) -> InversionResult<()> {
        if &self.domain != domain {
            return Err(InversionError::DomainMismatch(format!(
                "{what}: field lives on discretization {} ({} points), expected {} ({} points)",
                self.domain.id, self.domain.num_points, domain.id, domain.num_points
            )));
        }
        Ok(())
    }

    /// Same discretization and same per-point shape.
    pub fn check_compatible(&self, other: &Field, what: &str) -> InversionResult<()> {
        self.check_domain(&other.domain, what)?;
        if self.shape != other.shape {
            return Err(InversionError::ShapeMismatch(format!(
                "{what}: shape {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }

    fn component_range(&self, k: usize) -> InversionResult<(Vec<usize>, usize)> {
        if k >= self.num_components() {
            return Err(InversionError::IndexOutOfRange(format!(
                "component {k} of a field with shape {:?}",
                self.shape
            )));
        }
        let sub_shape = if self.shape.is_empty() {
            Vec::new()
        } else {
            self.shape[1..].to_vec()
        };
        let sub_len = shape_len(&sub_shape);
        Ok((sub_shape, k * sub_len))
    }

    /// Slice `k` along the leading axis. For a scalar field only `k = 0`
    /// exists and the field itself is returned.
    pub fn component(&self, k: usize) -> InversionResult<Field> {
        let (sub_shape, offset) = self.component_range(k)?;
        let sub_len = shape_len(&sub_shape);
        let mut values = Vec::with_capacity(self.num_points() * sub_len);
        for p in 0..self.num_points() {
            values.extend_from_slice(&self.at(p)[offset..offset + sub_len]);
        }
        Ok(Field {
            domain: self.domain,
            shape: sub_shape,
            values,
        })
    }

    /// Overwrite slice `k` along the leading axis.
    pub fn set_component(&mut self, k: usize, value: &Field) -> InversionResult<()> {
        value.check_domain(&self.domain, "set_component")?;
        let (sub_shape, offset) = self.component_range(k)?;
        if value.shape != sub_shape {
            return Err(InversionError::ShapeMismatch(format!(
                "component {k} has shape {sub_shape:?}, got {:?}",
                value.shape
            )));
        }
        let sub_len = shape_len(&sub_shape);
        for p in 0..self.num_points() {
            self.at_mut(p)[offset..offset + sub_len].copy_from_slice(value.at(p));
        }
        Ok(())
    }

    /// Gather the listed leading-axis components into a vector field.
    pub fn select(&self, indices: &[usize]) -> InversionResult<Field> {
        if self.rank() != 1 {
            return Err(InversionError::ShapeMismatch(format!(
                "select needs a vector field, got shape {:?}",
                self.shape
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&k| k >= self.shape[0]) {
            return Err(InversionError::IndexOutOfRange(format!(
                "component {bad} of a field with {} components",
                self.shape[0]
            )));
        }
        Ok(Field::from_fn(self.domain, &[indices.len()], |p, c| {
            self.at(p)[indices[c]]
        }))
    }

    /// Same values, different per-point shape of equal size.
    pub fn reshape(&self, shape: &[usize]) -> InversionResult<Field> {
        if shape_len(shape) != self.point_size() {
            return Err(InversionError::ShapeMismatch(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape
            )));
        }
        Ok(Field {
            domain: self.domain,
            shape: shape.to_vec(),
            values: self.values.clone(),
        })
    }

    pub fn add_assign(&mut self, other: &Field) -> InversionResult<()> {
        self.check_compatible(other, "add")?;
        for (a, b) in self.values.iter_mut().zip(&other.values) {
            *a += b;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    pub fn scaled(&self, factor: f64) -> Field {
        self.map(|v| v * factor)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Field {
        Field {
            domain: self.domain,
            shape: self.shape.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Sum over all points and components of the product.
    pub fn dot(&self, other: &Field) -> InversionResult<f64> {
        self.check_compatible(other, "dot")?;
        Ok(self.values.iter().zip(&other.values).map(|(a, b)| a * b).sum())
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Two-part gradient `(Y, X)` of a level-set functional.
///
/// `y` pairs with a perturbation of `m`, `x` with its spatial gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gradient {
    pub y: Field,
    pub x: Field,
}

impl Gradient {
    pub fn new(y: Field, x: Field) -> InversionResult<Self> {
        y.check_domain(&x.domain(), "gradient parts")?;
        Ok(Self { y, x })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom(n: usize) -> Discretization {
        Discretization::new(7, n, 0.5).unwrap()
    }

    #[test]
    fn test_discretization_rejects_empty() {
        assert!(Discretization::new(0, 0, 1.0).is_err());
        assert!(Discretization::new(0, 3, 0.0).is_err());
        assert!(Discretization::new(0, 3, f64::NAN).is_err());
    }

    #[test]
    fn test_from_values_length_checked() {
        let d = dom(3);
        assert!(Field::from_values(d, &[2], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Field::from_values(d, &[2], vec![0.0; 5]),
            Err(InversionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_component_of_vector() {
        let f = Field::from_fn(dom(2), &[3], |p, c| (10 * p + c) as f64);
        let c1 = f.component(1).unwrap();
        assert_eq!(c1.shape(), &[] as &[usize]);
        assert_eq!(c1.values(), &[1.0, 11.0]);
    }

    #[test]
    fn test_component_of_matrix_is_row() {
        let f = Field::from_fn(dom(1), &[2, 2], |_, c| c as f64);
        let row = f.component(1).unwrap();
        assert_eq!(row.shape(), &[2]);
        assert_eq!(row.values(), &[2.0, 3.0]);
    }

    #[test]
    fn test_scalar_component_zero_is_self() {
        let f = Field::constant(dom(2), &[], 4.0);
        assert_eq!(f.component(0).unwrap(), f);
        assert!(matches!(
            f.component(1),
            Err(InversionError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_set_component() {
        let mut f = Field::zeros(dom(2), &[2]);
        f.set_component(1, &Field::constant(dom(2), &[], 5.0)).unwrap();
        assert_eq!(f.values(), &[0.0, 5.0, 0.0, 5.0]);
    }

    #[test]
    fn test_set_component_wrong_domain() {
        let mut f = Field::zeros(dom(2), &[2]);
        let other = Field::zeros(Discretization::new(8, 2, 0.5).unwrap(), &[]);
        assert!(matches!(
            f.set_component(0, &other),
            Err(InversionError::DomainMismatch(_))
        ));
    }

    #[test]
    fn test_select_reorders() {
        let f = Field::from_fn(dom(1), &[3], |_, c| c as f64);
        let s = f.select(&[2, 0]).unwrap();
        assert_eq!(s.values(), &[2.0, 0.0]);
        assert!(f.select(&[3]).is_err());
    }

    #[test]
    fn test_add_assign_checks_shape() {
        let mut a = Field::zeros(dom(2), &[]);
        let b = Field::zeros(dom(2), &[1]);
        assert!(matches!(
            a.add_assign(&b),
            Err(InversionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_reshape_keeps_values() {
        let f = Field::from_fn(dom(1), &[4], |_, c| c as f64);
        let r = f.reshape(&[2, 2]).unwrap();
        assert_eq!(r.rank(), 2);
        assert_eq!(r.values(), f.values());
        assert!(f.reshape(&[3]).is_err());
    }

    #[test]
    fn test_dot() {
        let a = Field::constant(dom(3), &[], 2.0);
        let b = Field::constant(dom(3), &[], 1.5);
        assert!((a.dot(&b).unwrap() - 9.0).abs() < 1e-12);
    }
}
