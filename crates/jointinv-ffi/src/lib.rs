// ─────────────────────────────────────────────────────────────────────
// JointInv — Split Inversion PyO3 FFI Bindings
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
// Note: #[deny(unsafe_code)] not applied: PyO3 proc macros generate
// unsafe blocks internally. All hand-written code in this crate is safe.
//! Python-callable wrappers around the split joint-inversion cost function.
//!
//! Exposes `InversionConfig` and `JointInversion` to Python via PyO3.
//! Forward models stay in Python: each one is a pair of callables that
//! receive the consumed properties as flat lists.
//!
//! # FFI Safety
//!
//! - The GIL is released around every evaluation round so that subworld
//!   threads can re-acquire it via `Python::with_gil` per callback.
//! - Python exceptions in callbacks surface as `RuntimeError`, nothing is
//!   silently replaced by a default.
//! - No borrowed references escape the GIL lock scope.
//! - All config validated before storage (`InversionConfig::validate()`).
//!
//! Install: `pip install -e crates/jointinv-ffi` (requires maturin).
//!
//! Usage from Python:
//! ```python
//! from jointinv import InversionConfig, JointInversion
//!
//! d = [1.0] * 100
//! defect = lambda props: 0.5 * sum((p - q) ** 2 for p, q in zip(props[0], d))
//! gradient = lambda props: [p - q for p, q in zip(props[0], d)]
//! inv = JointInversion(100, 0.01, [(defect, gradient)], [(0.0, 1.0)],
//!                      config=InversionConfig(world_count=2))
//! j = inv.get_value([0.0] * 100)
//! ```

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use jointinv_core::cost::{MAPPINGS, MODELS, MU_MODEL, REGULARIZATION};
use jointinv_core::{
    format_mappings, format_models, level_set_shape, ExternalForwardModel, ForwardModel,
    L2Regularization, LinearMapping, Mapping, MappingSpec, ModelSpec, Regularization,
    SplitInversionCostFunction, SplitWorld, SubWorld,
};
use jointinv_types::{
    Discretization, Field, Gradient, InversionConfig, InversionError, InversionResult,
    TradeOffSlicing,
};

fn to_py_err(e: InversionError) -> PyErr {
    match e {
        InversionError::Numerical(_) => PyRuntimeError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

/// Reject negative Python indices before they reach `usize`.
fn to_indices(what: &str, raw: Vec<i64>) -> PyResult<Vec<usize>> {
    raw.into_iter()
        .map(|i| {
            usize::try_from(i).map_err(|_| {
                to_py_err(InversionError::IndexOutOfRange(format!(
                    "{what} index {i} is negative"
                )))
            })
        })
        .collect()
}

fn parse_slicing(name: &str) -> PyResult<TradeOffSlicing> {
    match name {
        "ownership" => Ok(TradeOffSlicing::Ownership),
        "chunked" => Ok(TradeOffSlicing::Chunked),
        other => Err(PyValueError::new_err(format!(
            "trade_off_slicing must be 'ownership' or 'chunked', got '{other}'"
        ))),
    }
}

fn slicing_name(slicing: TradeOffSlicing) -> &'static str {
    match slicing {
        TradeOffSlicing::Ownership => "ownership",
        TradeOffSlicing::Chunked => "chunked",
    }
}

// ─── PyInversionConfig ──────────────────────────────────────────────

/// Python-visible configuration for the split inversion.
#[pyclass(name = "InversionConfig")]
#[derive(Clone)]
struct PyInversionConfig {
    inner: InversionConfig,
}

#[pymethods]
impl PyInversionConfig {
    #[new]
    #[pyo3(signature = (
        world_count = 1,
        regularization_owner = 0,
        trade_off_slicing = "ownership",
        value_name = "J",
        gradient_y_name = "grad_y",
        gradient_x_name = "grad_x",
    ))]
    fn new(
        world_count: usize,
        regularization_owner: usize,
        trade_off_slicing: &str,
        value_name: &str,
        gradient_y_name: &str,
        gradient_x_name: &str,
    ) -> PyResult<Self> {
        let cfg = InversionConfig {
            world_count,
            regularization_owner,
            trade_off_slicing: parse_slicing(trade_off_slicing)?,
            value_name: value_name.to_string(),
            gradient_y_name: gradient_y_name.to_string(),
            gradient_x_name: gradient_x_name.to_string(),
        };
        cfg.validate().map_err(to_py_err)?;
        Ok(Self { inner: cfg })
    }

    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let cfg = InversionConfig::from_json(json).map_err(to_py_err)?;
        cfg.validate().map_err(to_py_err)?;
        Ok(Self { inner: cfg })
    }

    #[getter]
    fn world_count(&self) -> usize {
        self.inner.world_count
    }

    #[getter]
    fn regularization_owner(&self) -> usize {
        self.inner.regularization_owner
    }

    #[getter]
    fn trade_off_slicing(&self) -> &'static str {
        slicing_name(self.inner.trade_off_slicing)
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("world_count", self.inner.world_count)?;
        dict.set_item("regularization_owner", self.inner.regularization_owner)?;
        dict.set_item(
            "trade_off_slicing",
            slicing_name(self.inner.trade_off_slicing),
        )?;
        dict.set_item("value_name", &self.inner.value_name)?;
        dict.set_item("gradient_y_name", &self.inner.gradient_y_name)?;
        dict.set_item("gradient_x_name", &self.inner.gradient_x_name)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "InversionConfig(world_count={}, owner={}, slicing={})",
            self.inner.world_count,
            self.inner.regularization_owner,
            slicing_name(self.inner.trade_off_slicing),
        )
    }
}

// ─── Python forward models ──────────────────────────────────────────

/// A `(defect, gradient)` callable pair plus the mappings it reads.
struct PyModelSpec {
    defect: Arc<PyObject>,
    gradient: Arc<PyObject>,
    indices: Vec<usize>,
}

/// Wrap a Python callable pair as a forward model.
///
/// Both callables receive `list[list[float]]`, one flat list per consumed
/// property. `gradient` returns a flat list stacking the property
/// gradients point by point.
fn python_model(spec: &PyModelSpec) -> ExternalForwardModel {
    let defect = Arc::clone(&spec.defect);
    let gradient = Arc::clone(&spec.gradient);
    ExternalForwardModel::new(
        move |props: &[Field]| {
            let lists = to_lists(props);
            Python::with_gil(|py| {
                defect
                    .call1(py, (lists,))
                    .and_then(|r| r.extract::<f64>(py))
                    .map_err(|e| callback_error("defect", e))
            })
        },
        move |props: &[Field]| {
            let lists = to_lists(props);
            let flat = Python::with_gil(|py| {
                gradient
                    .call1(py, (lists,))
                    .and_then(|r| r.extract::<Vec<f64>>(py))
                    .map_err(|e| callback_error("gradient", e))
            })?;
            gradient_field(props, flat)
        },
    )
}

fn callback_error(which: &str, e: PyErr) -> InversionError {
    InversionError::Numerical(format!("python {which} callback failed: {e}"))
}

fn to_lists(props: &[Field]) -> Vec<Vec<f64>> {
    props.iter().map(|p| p.values().to_vec()).collect()
}

fn gradient_field(props: &[Field], flat: Vec<f64>) -> InversionResult<Field> {
    let first = props.first().ok_or_else(|| {
        InversionError::ShapeMismatch("forward model consumed no properties".to_string())
    })?;
    let shape = match props {
        [single] => single.shape().to_vec(),
        _ => vec![props.iter().map(Field::point_size).sum()],
    };
    Field::from_values(first.domain(), &shape, flat)
}

// ─── JointInversion ─────────────────────────────────────────────────

/// `(defect, gradient)` with an optional mapping index or index list.
#[derive(FromPyObject)]
enum ModelArg {
    WithIndex(PyObject, PyObject, Vec<i64>),
    WithSingleIndex(PyObject, PyObject, i64),
    Bare(PyObject, PyObject),
}

/// `(offset, scale)` with an optional level-set index or index list.
#[derive(FromPyObject)]
enum MappingArg {
    WithIndex(f64, f64, Vec<i64>),
    WithSingleIndex(f64, f64, i64),
    Bare(f64, f64),
}

/// Everything a subworld needs to build its share of the wiring.
struct WorldSetup {
    domain: Discretization,
    num_level_sets: usize,
    models: Vec<PyModelSpec>,
    mappings: Vec<(f64, f64, Option<Vec<usize>>)>,
    weights: (f64, f64),
    mu: Vec<f64>,
}

impl WorldSetup {
    fn init(&self, w: &mut SubWorld) -> InversionResult<()> {
        let slice: Range<usize> = w.model_slice(self.models.len());
        let mut specs: Vec<ModelSpec> = Vec::with_capacity(slice.len());
        for spec in &self.models[slice.clone()] {
            let model: Box<dyn ForwardModel> = Box::new(python_model(spec));
            specs.push((model, spec.indices.clone()).into());
        }
        let mut mappings: Vec<MappingSpec> = Vec::with_capacity(self.mappings.len());
        for (offset, scale, indices) in &self.mappings {
            let mapping: Box<dyn Mapping> =
                Box::new(LinearMapping::new(self.domain, *offset, *scale)?);
            mappings.push(match indices {
                Some(idx) => (mapping, idx.clone()).into(),
                None => mapping.into(),
            });
        }
        let (w0, w1) = self.weights;
        let reg: Box<dyn Regularization> = Box::new(L2Regularization::new(
            self.domain,
            self.num_level_sets,
            w0,
            w1,
        )?);
        w.export_value(MODELS, format_models(specs, self.mappings.len())?)?;
        w.export_value(MAPPINGS, format_mappings(mappings, self.num_level_sets)?)?;
        w.export_value(REGULARIZATION, reg)?;
        w.export_value(MU_MODEL, self.mu[slice].to_vec())
    }
}

/// Split joint-inversion cost function with Python forward models.
///
/// Mappings are linear, `p = offset + scale · m`. The regularization is
/// the built-in L2 smoothing with cross-gradient coupling.
#[pyclass(name = "JointInversion")]
struct PyJointInversion {
    inner: SplitInversionCostFunction,
    domain: Discretization,
    property_shapes: Vec<Vec<usize>>,
}

impl PyJointInversion {
    fn level_set(&self, values: Vec<f64>) -> PyResult<Field> {
        let nls = self.inner.num_level_sets().map_err(to_py_err)?;
        Field::from_values(self.domain, &level_set_shape(nls), values).map_err(to_py_err)
    }

    fn gradient(&self, y: Vec<f64>, x: Vec<f64>) -> PyResult<Gradient> {
        let y = self.level_set(y)?;
        let x = self.level_set(x)?;
        Gradient::new(y, x).map_err(to_py_err)
    }
}

#[pymethods]
impl PyJointInversion {
    /// Build and configure the split world.
    ///
    /// Args:
    ///     num_points: Grid size of the level set.
    ///     spacing: Grid spacing.
    ///     models: List of `(defect, gradient)` or `(defect, gradient, indices)`
    ///             tuples; `indices` is an int or a list of the mappings a
    ///             model reads (default `[0]`).
    ///     mappings: List of `(offset, scale)` or `(offset, scale, indices)`;
    ///               `indices` (int or list) restricts a mapping to those
    ///               level-set components (default: whole level set).
    ///     num_level_sets: Number of level-set components.
    ///     w0, w1: Regularization weights on values and slopes.
    ///     mu: Forward-model trade-off factors (default all 1).
    ///     config: Optional InversionConfig.
    #[new]
    #[pyo3(signature = (
        num_points,
        spacing,
        models,
        mappings,
        num_level_sets = 1,
        w0 = 1.0,
        w1 = 0.0,
        mu = None,
        config = None,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        py: Python<'_>,
        num_points: usize,
        spacing: f64,
        models: Vec<ModelArg>,
        mappings: Vec<MappingArg>,
        num_level_sets: usize,
        w0: f64,
        w1: f64,
        mu: Option<Vec<f64>>,
        config: Option<PyInversionConfig>,
    ) -> PyResult<Self> {
        let cfg = config.map(|c| c.inner).unwrap_or_default();
        let domain = Discretization::new(1, num_points, spacing).map_err(to_py_err)?;

        let mut model_specs = Vec::with_capacity(models.len());
        for arg in models {
            let (defect, gradient, indices) = match arg {
                ModelArg::WithIndex(d, g, raw) => (d, g, to_indices("mapping", raw)?),
                ModelArg::WithSingleIndex(d, g, raw) => {
                    (d, g, to_indices("mapping", vec![raw])?)
                }
                ModelArg::Bare(d, g) => (d, g, vec![0]),
            };
            model_specs.push(PyModelSpec {
                defect: Arc::new(defect),
                gradient: Arc::new(gradient),
                indices,
            });
        }
        let mut mapping_specs = Vec::with_capacity(mappings.len());
        for arg in mappings {
            mapping_specs.push(match arg {
                MappingArg::WithIndex(offset, scale, raw) => {
                    (offset, scale, Some(to_indices("level-set", raw)?))
                }
                MappingArg::WithSingleIndex(offset, scale, raw) => {
                    (offset, scale, Some(to_indices("level-set", vec![raw])?))
                }
                MappingArg::Bare(offset, scale) => (offset, scale, None),
            });
        }

        let property_shapes: Vec<Vec<usize>> = mapping_specs
            .iter()
            .map(|(_, _, indices)| match indices.as_deref() {
                _ if num_level_sets == 1 => Vec::new(),
                None | Some([]) => level_set_shape(num_level_sets),
                Some(idx) => level_set_shape(idx.len()),
            })
            .collect();
        let num_models = model_specs.len();
        let num_mappings = mapping_specs.len();
        let setup = Arc::new(WorldSetup {
            domain,
            num_level_sets,
            models: model_specs,
            mappings: mapping_specs,
            weights: (w0, w1),
            mu: mu.unwrap_or_else(|| vec![1.0; num_models]),
        });
        if setup.mu.len() != num_models {
            return Err(to_py_err(InversionError::InvalidTradeOff(format!(
                "{} factor(s) for {num_models} model(s)",
                setup.mu.len()
            ))));
        }

        let world = SplitWorld::from_config(&cfg, domain).map_err(to_py_err)?;
        let mut inner = SplitInversionCostFunction::new(Arc::new(Mutex::new(world)), cfg)
            .map_err(to_py_err)?;
        py.allow_threads(|| {
            inner.configure(num_level_sets, num_models, num_mappings, move |w: &mut SubWorld| {
                setup.init(w)
            })
        })
        .map_err(to_py_err)?;
        Ok(Self {
            inner,
            domain,
            property_shapes,
        })
    }

    #[getter]
    fn num_level_sets(&self) -> PyResult<usize> {
        self.inner.num_level_sets().map_err(to_py_err)
    }

    #[getter]
    fn num_models(&self) -> PyResult<usize> {
        self.inner.num_models().map_err(to_py_err)
    }

    #[getter]
    fn num_mappings(&self) -> PyResult<usize> {
        self.inner.num_mappings().map_err(to_py_err)
    }

    #[pyo3(signature = (mu = None))]
    fn set_trade_off_factors_models(
        &mut self,
        py: Python<'_>,
        mu: Option<Vec<f64>>,
    ) -> PyResult<()> {
        let inner = &mut self.inner;
        py.allow_threads(|| inner.set_trade_off_factors_models(mu.as_deref()))
            .map_err(to_py_err)
    }

    fn get_trade_off_factors_models(&self) -> PyResult<Vec<f64>> {
        self.inner.get_trade_off_factors_models().map_err(to_py_err)
    }

    #[pyo3(signature = (mu = None, mu_c = None))]
    fn set_trade_off_factors_regularization(
        &mut self,
        py: Python<'_>,
        mu: Option<Vec<f64>>,
        mu_c: Option<Vec<f64>>,
    ) -> PyResult<()> {
        let inner = &mut self.inner;
        py.allow_threads(|| {
            inner.set_trade_off_factors_regularization(mu.as_deref(), mu_c.as_deref())
        })
        .map_err(to_py_err)
    }

    /// All factors: forward models first, then the regularization's.
    #[pyo3(signature = (mu = None))]
    fn set_trade_off_factors(&mut self, py: Python<'_>, mu: Option<Vec<f64>>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.allow_threads(|| inner.set_trade_off_factors(mu.as_deref()))
            .map_err(to_py_err)
    }

    fn get_trade_off_factors(&self) -> PyResult<Vec<f64>> {
        self.inner.get_trade_off_factors().map_err(to_py_err)
    }

    fn get_num_trade_off_factors(&self) -> PyResult<usize> {
        self.inner.get_num_trade_off_factors().map_err(to_py_err)
    }

    /// Total cost `J(m)`; `m` is the flat level set.
    fn get_value(&mut self, py: Python<'_>, m: Vec<f64>) -> PyResult<f64> {
        let m = self.level_set(m)?;
        let inner = &mut self.inner;
        py.allow_threads(|| inner.get_value(&m)).map_err(to_py_err)
    }

    /// Gradient of `J` as a `(y, x)` pair of flat lists.
    fn get_gradient(&mut self, py: Python<'_>, m: Vec<f64>) -> PyResult<(Vec<f64>, Vec<f64>)> {
        let m = self.level_set(m)?;
        let inner = &mut self.inner;
        let g = py.allow_threads(|| inner.get_gradient(&m)).map_err(to_py_err)?;
        Ok((g.y.into_values(), g.x.into_values()))
    }

    /// `[J_reg, J_0, J_1, ...]`, forward-model terms unweighted.
    fn get_component_values(&mut self, py: Python<'_>, m: Vec<f64>) -> PyResult<Vec<f64>> {
        let m = self.level_set(m)?;
        let inner = &mut self.inner;
        py.allow_threads(|| inner.get_component_values(&m))
            .map_err(to_py_err)
    }

    fn get_inverse_hessian_approximation(
        &mut self,
        py: Python<'_>,
        m: Vec<f64>,
        y: Vec<f64>,
        x: Vec<f64>,
    ) -> PyResult<Vec<f64>> {
        let m = self.level_set(m)?;
        let r = self.gradient(y, x)?;
        let inner = &mut self.inner;
        py.allow_threads(|| inner.get_inverse_hessian_approximation(&m, &r))
            .map(Field::into_values)
            .map_err(to_py_err)
    }

    fn update_hessian(&mut self, py: Python<'_>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.allow_threads(|| inner.update_hessian()).map_err(to_py_err)
    }

    fn get_dual_product(
        &mut self,
        py: Python<'_>,
        x: Vec<f64>,
        y: Vec<f64>,
        gx: Vec<f64>,
    ) -> PyResult<f64> {
        let x = self.level_set(x)?;
        let r = self.gradient(y, gx)?;
        let inner = &mut self.inner;
        py.allow_threads(|| inner.get_dual_product(&x, &r))
            .map_err(to_py_err)
    }

    fn get_norm(&mut self, py: Python<'_>, m: Vec<f64>) -> PyResult<f64> {
        let m = self.level_set(m)?;
        let inner = &mut self.inner;
        py.allow_threads(|| inner.get_norm(&m)).map_err(to_py_err)
    }

    /// Physical properties of `m`, one flat list per mapping.
    fn get_properties(&self, py: Python<'_>, m: Vec<f64>) -> PyResult<Vec<Vec<f64>>> {
        let m = self.level_set(m)?;
        let inner = &self.inner;
        let props = py.allow_threads(|| inner.get_properties(&m)).map_err(to_py_err)?;
        Ok(props.into_iter().map(Field::into_values).collect())
    }

    /// Level set from target properties; `None` entries are skipped.
    fn create_level_set_function(
        &self,
        py: Python<'_>,
        props: Vec<Option<Vec<f64>>>,
    ) -> PyResult<Vec<f64>> {
        let fields = props
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let shape = self.property_shapes.get(i).map_or(&[][..], Vec::as_slice);
                p.map(|values| Field::from_values(self.domain, shape, values))
                    .transpose()
            })
            .collect::<InversionResult<Vec<_>>>()
            .map_err(to_py_err)?;
        let inner = &self.inner;
        py.allow_threads(|| inner.create_level_set_function(&fields))
            .map(Field::into_values)
            .map_err(to_py_err)
    }

    fn statistics<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let s = self.inner.statistics();
        let dict = PyDict::new(py);
        dict.set_item("value_calls", s.value_calls)?;
        dict.set_item("gradient_calls", s.gradient_calls)?;
        dict.set_item("arguments_calls", s.arguments_calls)?;
        dict.set_item("dual_product_calls", s.dual_product_calls)?;
        dict.set_item("norm_calls", s.norm_calls)?;
        dict.set_item("inverse_hessian_calls", s.inverse_hessian_calls)?;
        dict.set_item("hessian_updates", s.hessian_updates)?;
        Ok(dict)
    }

    fn reset_statistics(&mut self) {
        self.inner.reset_statistics();
    }

    fn __repr__(&self) -> String {
        format!(
            "JointInversion(points={}, worlds={}, models={}, state={:?})",
            self.domain.num_points,
            self.inner.config().world_count,
            self.inner.num_models().unwrap_or(0),
            self.inner.state(),
        )
    }
}

// ─── Module ─────────────────────────────────────────────────────────

#[pymodule]
fn jointinv(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyInversionConfig>()?;
    m.add_class::<PyJointInversion>()?;
    Ok(())
}
