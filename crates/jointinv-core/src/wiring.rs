// ─────────────────────────────────────────────────────────────────────
// JointInv — Model and Mapping Wiring
// ─────────────────────────────────────────────────────────────────────
//! Normalization of `(model, indices)` / `(mapping, indices)` specs,
//! per-subworld model state, and the subworld partition arithmetic.

use std::fmt;
use std::ops::Range;

use jointinv_types::{Field, InversionError, InversionResult};

use crate::chain::Jacobian;
use crate::forward::ForwardModel;
use crate::mapping::{restrict_level_set, Mapping};

/// A forward model, optionally with the mapping indices it consumes.
pub enum ModelSpec {
    /// Consumes mapping 0.
    Bare(Box<dyn ForwardModel>),
    WithIndex(Box<dyn ForwardModel>, Vec<usize>),
}

impl From<Box<dyn ForwardModel>> for ModelSpec {
    fn from(model: Box<dyn ForwardModel>) -> Self {
        ModelSpec::Bare(model)
    }
}

impl From<(Box<dyn ForwardModel>,)> for ModelSpec {
    fn from((model,): (Box<dyn ForwardModel>,)) -> Self {
        ModelSpec::Bare(model)
    }
}

impl From<(Box<dyn ForwardModel>, usize)> for ModelSpec {
    fn from((model, index): (Box<dyn ForwardModel>, usize)) -> Self {
        ModelSpec::WithIndex(model, vec![index])
    }
}

impl From<(Box<dyn ForwardModel>, Vec<usize>)> for ModelSpec {
    fn from((model, indices): (Box<dyn ForwardModel>, Vec<usize>)) -> Self {
        ModelSpec::WithIndex(model, indices)
    }
}

/// A mapping, optionally with the level-set components it reads.
pub enum MappingSpec {
    /// Reads the whole level set.
    Bare(Box<dyn Mapping>),
    WithIndex(Box<dyn Mapping>, Vec<usize>),
}

impl From<Box<dyn Mapping>> for MappingSpec {
    fn from(mapping: Box<dyn Mapping>) -> Self {
        MappingSpec::Bare(mapping)
    }
}

impl From<(Box<dyn Mapping>, usize)> for MappingSpec {
    fn from((mapping, index): (Box<dyn Mapping>, usize)) -> Self {
        MappingSpec::WithIndex(mapping, vec![index])
    }
}

impl From<(Box<dyn Mapping>, Vec<usize>)> for MappingSpec {
    fn from((mapping, indices): (Box<dyn Mapping>, Vec<usize>)) -> Self {
        MappingSpec::WithIndex(mapping, indices)
    }
}

fn check_indices(what: &str, indices: &[usize], bound: usize) -> InversionResult<()> {
    if let Some(&bad) = indices.iter().find(|&&k| k >= bound) {
        return Err(InversionError::IndexOutOfRange(format!(
            "{what} index {bad} >= {bound}"
        )));
    }
    Ok(())
}

/// Per-point values cached by `LocalModel::set_point`.
struct PointCache {
    props: Vec<Field>,
    args: Vec<Field>,
}

/// A forward model living in one subworld, with its mapping indices
/// and the properties of the current point.
pub struct LocalModel {
    model: Box<dyn ForwardModel>,
    indices: Vec<usize>,
    point: Option<PointCache>,
}

impl fmt::Debug for LocalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalModel")
            .field("indices", &self.indices)
            .field("point_set", &self.point.is_some())
            .finish()
    }
}

impl LocalModel {
    pub fn new(model: Box<dyn ForwardModel>, indices: Vec<usize>) -> Self {
        Self {
            model,
            indices,
            point: None,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn model(&self) -> &dyn ForwardModel {
        self.model.as_ref()
    }

    pub fn check_indices(&self, num_mappings: usize) -> InversionResult<()> {
        check_indices("mapping", &self.indices, num_mappings)
    }

    /// Pick this model's properties out of all mapped properties and
    /// run the caching hook.
    pub fn set_point(&mut self, all_props: &[Field]) -> InversionResult<()> {
        self.check_indices(all_props.len())?;
        let props: Vec<Field> = self.indices.iter().map(|&k| all_props[k].clone()).collect();
        let args = self.model.get_arguments(&props)?;
        self.point = Some(PointCache { props, args });
        Ok(())
    }

    fn cache(&self) -> InversionResult<&PointCache> {
        self.point
            .as_ref()
            .ok_or_else(|| InversionError::PointNotSet("forward model evaluation".to_string()))
    }

    pub fn defect(&self) -> InversionResult<f64> {
        let c = self.cache()?;
        self.model.get_defect(&c.props, &c.args)
    }

    pub fn gradient(&self) -> InversionResult<Field> {
        let c = self.cache()?;
        self.model.get_gradient(&c.props, &c.args)
    }
}

/// A mapping living in one subworld, with the level-set components it reads.
pub struct LocalMapping {
    mapping: Box<dyn Mapping>,
    indices: Vec<usize>,
}

impl fmt::Debug for LocalMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMapping")
            .field("indices", &self.indices)
            .finish()
    }
}

impl LocalMapping {
    pub fn new(mapping: Box<dyn Mapping>, indices: Vec<usize>) -> Self {
        Self { mapping, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn mapping(&self) -> &dyn Mapping {
        self.mapping.as_ref()
    }

    pub fn check_indices(&self, num_level_sets: usize) -> InversionResult<()> {
        check_indices("level-set", &self.indices, num_level_sets)
    }

    pub fn property(&self, m: &Field, num_level_sets: usize) -> InversionResult<Field> {
        self.mapping
            .value(&restrict_level_set(m, &self.indices, num_level_sets)?)
    }

    pub fn derivative(&self, m: &Field, num_level_sets: usize) -> InversionResult<Jacobian> {
        self.mapping
            .derivative(&restrict_level_set(m, &self.indices, num_level_sets)?)
    }

    pub fn inverse(&self, p: &Field) -> InversionResult<Field> {
        self.mapping.inverse(p)
    }
}

/// Normalize model specs into local models. Bare specs read mapping 0.
pub fn format_models<S>(specs: Vec<S>, num_mappings: usize) -> InversionResult<Vec<LocalModel>>
where
    S: Into<ModelSpec>,
{
    specs
        .into_iter()
        .map(|spec| {
            let (model, indices) = match spec.into() {
                ModelSpec::Bare(model) => (model, vec![0]),
                ModelSpec::WithIndex(model, indices) => (model, indices),
            };
            check_indices("mapping", &indices, num_mappings)?;
            Ok(LocalModel::new(model, indices))
        })
        .collect()
}

/// Normalize mapping specs. Bare specs read the whole level set.
pub fn format_mappings<S>(
    specs: Vec<S>,
    num_level_sets: usize,
) -> InversionResult<Vec<LocalMapping>>
where
    S: Into<MappingSpec>,
{
    specs
        .into_iter()
        .map(|spec| {
            let (mapping, indices) = match spec.into() {
                MappingSpec::Bare(mapping) => (mapping, Vec::new()),
                MappingSpec::WithIndex(mapping, indices) => (mapping, indices),
            };
            check_indices("level-set", &indices, num_level_sets)?;
            Ok(LocalMapping::new(mapping, indices))
        })
        .collect()
}

/// Models owned by subworld `id`: contiguous slices of
/// `ceil(num_models / world_count)`, trailing subworlds may be empty.
pub fn model_slice(id: usize, world_count: usize, num_models: usize) -> Range<usize> {
    let chunk = num_models.div_ceil(world_count.max(1));
    let start = (id * chunk).min(num_models);
    let end = (start + chunk).min(num_models);
    start..end
}

/// Legacy trade-off slicing: chunk `max(1, world_count / num_models)`
/// indexed by subworld id, clipped to the factor array.
pub fn chunked_slice(id: usize, world_count: usize, num_models: usize) -> Range<usize> {
    let chunk = (world_count / num_models.max(1)).max(1);
    let start = (id * chunk).min(num_models);
    let end = (start + chunk).min(num_models);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::LeastSquaresModel;
    use crate::mapping::LinearMapping;
    use jointinv_types::Discretization;

    fn dom() -> Discretization {
        Discretization::new(2, 3, 1.0).unwrap()
    }

    fn model() -> Box<dyn ForwardModel> {
        Box::new(LeastSquaresModel::new(Field::zeros(dom(), &[]), 1.0).unwrap())
    }

    #[test]
    fn test_format_models_defaults_to_mapping_zero() {
        let bare = format_models(vec![ModelSpec::from(model())], 1).unwrap();
        let tuple = format_models(vec![ModelSpec::from((model(),))], 1).unwrap();
        let listed = format_models(vec![ModelSpec::from((model(), vec![0]))], 1).unwrap();
        assert_eq!(bare[0].indices(), &[0]);
        assert_eq!(tuple[0].indices(), &[0]);
        assert_eq!(listed[0].indices(), &[0]);
    }

    #[test]
    fn test_format_models_single_index() {
        let out = format_models(vec![ModelSpec::from((model(), 2usize))], 3).unwrap();
        assert_eq!(out[0].indices(), &[2]);
    }

    #[test]
    fn test_format_models_index_out_of_range() {
        assert!(matches!(
            format_models(vec![ModelSpec::from((model(), vec![0, 2]))], 2),
            Err(InversionError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_format_mappings_bare_reads_whole_model() {
        let map: Box<dyn Mapping> = Box::new(LinearMapping::new(dom(), 0.0, 1.0).unwrap());
        let out = format_mappings(vec![MappingSpec::from(map)], 2).unwrap();
        assert!(out[0].indices().is_empty());
    }

    #[test]
    fn test_format_mappings_index_out_of_range() {
        let map: Box<dyn Mapping> = Box::new(LinearMapping::new(dom(), 0.0, 1.0).unwrap());
        assert!(matches!(
            format_mappings(vec![MappingSpec::from((map, 2usize))], 2),
            Err(InversionError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_local_model_needs_point() {
        let local = LocalModel::new(model(), vec![0]);
        assert!(matches!(local.defect(), Err(InversionError::PointNotSet(_))));
    }

    #[test]
    fn test_local_model_picks_properties() {
        let mut local = LocalModel::new(model(), vec![1]);
        let props = vec![
            Field::constant(dom(), &[], 5.0),
            Field::constant(dom(), &[], 1.0),
        ];
        local.set_point(&props).unwrap();
        // ½ · 3 points · 1²
        assert!((local.defect().unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_model_slice_three_on_two() {
        assert_eq!(model_slice(0, 2, 3), 0..2);
        assert_eq!(model_slice(1, 2, 3), 2..3);
    }

    #[test]
    fn test_model_slice_more_worlds_than_models() {
        let slices: Vec<_> = (0..4).map(|i| model_slice(i, 4, 2)).collect();
        assert_eq!(slices, vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn test_model_slices_cover_every_model_once() {
        for w in 1..6 {
            for n in 1..9 {
                let total: usize = (0..w).map(|i| model_slice(i, w, n).len()).sum();
                assert_eq!(total, n, "w={w} n={n}");
            }
        }
    }

    #[test]
    fn test_chunked_slice_legacy_layout() {
        // 4 worlds, 2 models: chunk 2, everything lands in world 0.
        assert_eq!(chunked_slice(0, 4, 2), 0..2);
        assert_eq!(chunked_slice(1, 4, 2), 2..2);
        // 2 worlds, 3 models: chunk 1, model 2 gets no factor.
        assert_eq!(chunked_slice(0, 2, 3), 0..1);
        assert_eq!(chunked_slice(1, 2, 3), 1..2);
    }
}
