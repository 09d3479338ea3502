// ─────────────────────────────────────────────────────────────────────
// JointInv — Split Inversion Cost Function
// ─────────────────────────────────────────────────────────────────────
//! Orchestrator for `J(m) = J_reg(m) + Σ_f mu_f · J_f(p)`.
//!
//! Every evaluation is expressed as a job round on the shared
//! `SplitWorld`. Each subworld evaluates the forward models it owns;
//! the regularization is replicated everywhere but only the subworld
//! named by `regularization_owner` adds its value and gradient.
//!
//! # Lifecycle
//!
//! `Unconfigured → Configured → PointSet → ValueComputed`. Every entry
//! point fails with `NotConfigured` before `configure()` succeeds, and
//! value/gradient rounds fail with `PointNotSet` until `set_point()`
//! has completed.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use jointinv_types::{
    Field, Gradient, InversionConfig, InversionError, InversionResult, TradeOffSlicing,
};

use crate::chain::{self, ChainTarget, Jacobian};
use crate::mapping::{insert_level_set, level_set_shape};
use crate::splitworld::{Job, Reducer, SplitWorld, SubWorld, Value};
use crate::wiring::{chunked_slice, model_slice};

/// Local: the subworld's forward models (`Vec<LocalModel>`).
pub const MODELS: &str = "models";
/// Local: the subworld's regularization replica.
pub const REGULARIZATION: &str = "regularization";
/// Local: trade-off factors of the subworld's models.
pub const MU_MODEL: &str = "mu_model";
/// Local: every mapping (`Vec<LocalMapping>`), replicated.
pub const MAPPINGS: &str = "mappings";
/// Local: the current level-set point.
pub const POINT: &str = "point";
/// Gather: number of forward models each subworld holds.
pub const MODEL_COUNT: &str = "model_count";

const REQUIRED: [&str; 4] = [MODELS, REGULARIZATION, MU_MODEL, MAPPINGS];

const MU_REPORT: &str = "mu_report";
const REG_FACTORS: &str = "regularization_factors";
const COMPONENTS: &str = "component_values";
const RESULT: &str = "owner_result";

/// Evaluation state of the cost function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    Unconfigured,
    Configured,
    PointSet,
    ValueComputed,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CostFunctionStatistics {
    pub value_calls: u64,
    pub gradient_calls: u64,
    pub arguments_calls: u64,
    pub dual_product_calls: u64,
    pub norm_calls: u64,
    pub inverse_hessian_calls: u64,
    pub hessian_updates: u64,
}

impl CostFunctionStatistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy)]
struct Wiring {
    num_level_sets: usize,
    num_models: usize,
    num_mappings: usize,
}

fn local_mu(world: &SubWorld) -> InversionResult<Vec<f64>> {
    match world.import_value(MU_MODEL)?.as_value()? {
        Value::Scalar(v) => Ok(vec![*v]),
        Value::Vector(v) => Ok(v.clone()),
        _ => Err(InversionError::Variable(format!(
            "'{MU_MODEL}' must hold a scalar or a vector"
        ))),
    }
}

fn current_point(world: &SubWorld) -> InversionResult<&Field> {
    match world.import_value(POINT) {
        Ok(v) => v.as_value()?.as_field(),
        Err(_) => Err(InversionError::PointNotSet(format!(
            "subworld {}",
            world.id()
        ))),
    }
}

fn check_positive(what: &str, values: &[f64]) -> InversionResult<()> {
    if let Some(v) = values.iter().find(|&&v| !(v.is_finite() && v > 0.0)) {
        return Err(InversionError::InvalidTradeOff(format!(
            "{what}: all trade-off factors must be positive, got {v}"
        )));
    }
    Ok(())
}

/// Validates local wiring and reports counts, factors and the
/// regularization's trade-off factors.
struct WiringReport {
    wiring: Wiring,
    owner: usize,
}

impl Job for WiringReport {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let w = self.wiring;
        let mappings = world.import_value(MAPPINGS)?.as_mappings()?;
        if mappings.len() != w.num_mappings {
            return Err(InversionError::Partition(format!(
                "subworld {} holds {} mapping(s), expected {}",
                world.id(),
                mappings.len(),
                w.num_mappings
            )));
        }
        for m in mappings {
            m.check_indices(w.num_level_sets)?;
        }
        let models = world.import_value(MODELS)?.as_models()?;
        for m in models {
            m.check_indices(w.num_mappings)?;
        }
        let count = models.len();

        let reg = world.import_value(REGULARIZATION)?.as_regularization()?;
        if reg.num_level_sets() != w.num_level_sets {
            return Err(InversionError::Config(format!(
                "regularization in subworld {} covers {} level set(s), expected {}",
                world.id(),
                reg.num_level_sets(),
                w.num_level_sets
            )));
        }
        let factors = reg.get_trade_off_factors();
        let mu = local_mu(world)?;

        world.export_value(MODEL_COUNT, count as f64)?;
        world.export_value(MU_REPORT, mu)?;
        if world.id() == self.owner {
            world.export_value(REG_FACTORS, factors)?;
        }
        Ok(())
    }
}

struct SetMu {
    slices: Vec<Vec<f64>>,
}

impl Job for SetMu {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let slice = self.slices.get(world.id()).cloned().unwrap_or_default();
        world.export_value(MU_MODEL, slice)
    }
}

enum RegularizationFactors {
    Split {
        mu: Option<Vec<f64>>,
        mu_c: Option<Vec<f64>>,
    },
    All(Vec<f64>),
}

struct SetRegularizationFactors {
    factors: RegularizationFactors,
    owner: usize,
}

impl Job for SetRegularizationFactors {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let reg = world.import_value_mut(REGULARIZATION)?.as_regularization_mut()?;
        match &self.factors {
            RegularizationFactors::Split { mu, mu_c } => {
                reg.set_trade_off_factors_for_variation(mu.as_deref())?;
                reg.set_trade_off_factors_for_cross_gradient(mu_c.as_deref())?;
            }
            RegularizationFactors::All(all) => reg.set_trade_off_factors(all)?,
        }
        let factors = reg.get_trade_off_factors();
        if world.id() == self.owner {
            world.export_value(REG_FACTORS, factors)?;
        }
        Ok(())
    }
}

/// Map the point to properties and prime every local model.
struct SetPoint {
    point: Field,
    num_level_sets: usize,
}

impl Job for SetPoint {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let props = world
            .import_value(MAPPINGS)?
            .as_mappings()?
            .iter()
            .map(|m| m.property(&self.point, self.num_level_sets))
            .collect::<InversionResult<Vec<Field>>>()?;
        for model in world.import_value_mut(MODELS)?.as_models_mut()? {
            model.set_point(&props)?;
        }
        world
            .import_value_mut(REGULARIZATION)?
            .as_regularization_mut()?
            .set_point(&self.point)?;
        world.export_value(POINT, self.point.clone())
    }
}

struct ValueJob {
    names: Vec<String>,
    owner: usize,
    num_models: usize,
}

impl Job for ValueJob {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let mu = local_mu(world)?;
        let models = world.import_value(MODELS)?.as_models()?;
        if mu.len() != models.len() {
            return Err(InversionError::Partition(format!(
                "subworld {} has {} trade-off factor(s) for {} model(s)",
                world.id(),
                mu.len(),
                models.len()
            )));
        }
        let first = world.model_slice(self.num_models).start;
        let mut j = 0.0;
        for (i, (model, mu_i)) in models.iter().zip(&mu).enumerate() {
            let defect = model.defect()?;
            log::debug!(
                "subworld {}: model {} defect {defect:.6e} (mu = {mu_i})",
                world.id(),
                first + i
            );
            j += mu_i * defect;
        }
        if world.id() == self.owner {
            let point = current_point(world)?;
            j += world
                .import_value(REGULARIZATION)?
                .as_regularization()?
                .get_value(point)?;
        }
        for name in &self.names {
            world.export_value(name, j)?;
        }
        Ok(())
    }
}

struct GradientJob {
    y_names: Vec<String>,
    x_names: Vec<String>,
    owner: usize,
    num_level_sets: usize,
}

impl Job for GradientJob {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let mu = local_mu(world)?;
        let point = current_point(world)?;
        let mappings = world.import_value(MAPPINGS)?.as_mappings()?;
        let jacobians = mappings
            .iter()
            .map(|m| m.derivative(point, self.num_level_sets))
            .collect::<InversionResult<Vec<Jacobian>>>()?;

        let (mut y, x) = if world.id() == self.owner {
            let g = world
                .import_value(REGULARIZATION)?
                .as_regularization()?
                .get_gradient(point)?;
            (g.y, Some(g.x))
        } else {
            (point.zeros_like(), None)
        };

        let models = world.import_value(MODELS)?.as_models()?;
        if mu.len() != models.len() {
            return Err(InversionError::Partition(format!(
                "subworld {} has {} trade-off factor(s) for {} model(s)",
                world.id(),
                mu.len(),
                models.len()
            )));
        }
        for (i, (model, &mu_i)) in models.iter().zip(&mu).enumerate() {
            let ys = model.gradient()?;
            let targets = model
                .indices()
                .iter()
                .map(|&k| match (jacobians.get(k), mappings.get(k)) {
                    (Some(jacobian), Some(mapping)) => Ok(ChainTarget {
                        jacobian,
                        level_sets: mapping.indices(),
                    }),
                    _ => Err(InversionError::IndexOutOfRange(format!(
                        "mapping index {k} >= {}",
                        mappings.len()
                    ))),
                })
                .collect::<InversionResult<Vec<_>>>()?;
            let op = chain::accumulate(&mut y, &ys, &targets, mu_i)?;
            log::debug!("subworld {}: local model {i} gradient via {op:?}", world.id());
        }

        for name in &self.y_names {
            world.export_value(name, y.clone())?;
        }
        if let Some(x) = x {
            for name in &self.x_names {
                world.export_value(name, x.clone())?;
            }
        }
        Ok(())
    }
}

/// Unweighted defects per subworld; the owner also reports `J_reg`.
struct ComponentsJob {
    owner: usize,
}

impl Job for ComponentsJob {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let defects = world
            .import_value(MODELS)?
            .as_models()?
            .iter()
            .map(|m| m.defect())
            .collect::<InversionResult<Vec<f64>>>()?;
        if world.id() == self.owner {
            let point = current_point(world)?;
            let j_reg = world
                .import_value(REGULARIZATION)?
                .as_regularization()?
                .get_value(point)?;
            world.export_value(RESULT, j_reg)?;
        }
        world.export_value(COMPONENTS, defects)
    }
}

struct UpdateHessian;

impl Job for UpdateHessian {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        world
            .import_value_mut(REGULARIZATION)?
            .as_regularization_mut()?
            .update_hessian()
    }
}

/// Queries answered by the regularization owner alone.
enum OwnerQuery {
    InverseHessian { m: Field, r: Gradient },
    DualProduct { x: Field, r: Gradient },
    Norm { m: Field },
    Properties { m: Field },
    LevelSet { props: Vec<Option<Field>> },
}

struct OwnerJob {
    num_level_sets: usize,
    query: OwnerQuery,
}

impl Job for OwnerJob {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        let nls = self.num_level_sets;
        match &self.query {
            OwnerQuery::InverseHessian { m, r } => {
                let dm = world
                    .import_value_mut(REGULARIZATION)?
                    .as_regularization_mut()?
                    .get_inverse_hessian_approximation(m, r)?;
                world.export_value(RESULT, dm)
            }
            OwnerQuery::DualProduct { x, r } => {
                let d = world
                    .import_value(REGULARIZATION)?
                    .as_regularization()?
                    .get_dual_product(x, r)?;
                world.export_value(RESULT, d)
            }
            OwnerQuery::Norm { m } => {
                let n = world
                    .import_value(REGULARIZATION)?
                    .as_regularization()?
                    .get_norm(m)?;
                world.export_value(RESULT, n)
            }
            OwnerQuery::Properties { m } => {
                let props = world
                    .import_value(MAPPINGS)?
                    .as_mappings()?
                    .iter()
                    .map(|mapping| mapping.property(m, nls))
                    .collect::<InversionResult<Vec<Field>>>()?;
                world.export_value(RESULT, props)
            }
            OwnerQuery::LevelSet { props } => {
                let mappings = world.import_value(MAPPINGS)?.as_mappings()?;
                let mut m = Field::zeros(world.domain(), &level_set_shape(nls));
                for (mapping, p) in mappings.iter().zip(props) {
                    if let Some(p) = p {
                        let inv = mapping.inverse(p)?;
                        insert_level_set(&mut m, mapping.indices(), &inv, nls)?;
                    }
                }
                world.export_value(RESULT, m)
            }
        }
    }
}

/// Joint-inversion cost function over a split world.
pub struct SplitInversionCostFunction {
    world: Arc<Mutex<SplitWorld>>,
    config: InversionConfig,
    wiring: Option<Wiring>,
    model_counts: Vec<usize>,
    mu_model: Vec<f64>,
    regularization_factors: Vec<f64>,
    state: EvaluationState,
    stats: CostFunctionStatistics,
}

impl SplitInversionCostFunction {
    pub const PROVIDES_INVERSE_HESSIAN_APPROXIMATION: bool = true;

    pub fn new(world: Arc<Mutex<SplitWorld>>, config: InversionConfig) -> InversionResult<Self> {
        config.validate()?;
        let world_count = world.lock().world_count();
        if world_count != config.world_count {
            return Err(InversionError::Config(format!(
                "config expects {} subworld(s), split world has {world_count}",
                config.world_count
            )));
        }
        Ok(Self {
            world,
            config,
            wiring: None,
            model_counts: Vec::new(),
            mu_model: Vec::new(),
            regularization_factors: Vec::new(),
            state: EvaluationState::Unconfigured,
            stats: CostFunctionStatistics::default(),
        })
    }

    pub fn config(&self) -> &InversionConfig {
        &self.config
    }

    pub fn state(&self) -> EvaluationState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.wiring.is_some()
    }

    pub fn split_world(&self) -> Arc<Mutex<SplitWorld>> {
        Arc::clone(&self.world)
    }

    pub fn statistics(&self) -> &CostFunctionStatistics {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    fn wiring(&self, op: &str) -> InversionResult<Wiring> {
        self.wiring
            .ok_or_else(|| InversionError::NotConfigured(op.to_string()))
    }

    fn require_point(&self, op: &str) -> InversionResult<Wiring> {
        let w = self.wiring(op)?;
        match self.state {
            EvaluationState::PointSet | EvaluationState::ValueComputed => Ok(w),
            _ => Err(InversionError::PointNotSet(op.to_string())),
        }
    }

    fn check_level_set(&self, m: &Field, wiring: Wiring, what: &str) -> InversionResult<()> {
        m.check_domain(&self.world.lock().domain(), what)?;
        let expected = level_set_shape(wiring.num_level_sets);
        if m.shape() != expected.as_slice() {
            return Err(InversionError::ShapeMismatch(format!(
                "{what}: level set needs shape {expected:?}, got {:?}",
                m.shape()
            )));
        }
        Ok(())
    }

    fn check_sum_names(world: &SplitWorld, names: &[&str]) -> InversionResult<()> {
        for name in names {
            if world.reducer(name) != Some(Reducer::Sum) {
                return Err(InversionError::Variable(format!(
                    "'{name}' must be declared as a summed variable"
                )));
            }
        }
        Ok(())
    }

    /// Y and X names must pair up and never share a bus variable.
    fn check_gradient_names(y_names: &[&str], x_names: &[&str]) -> InversionResult<()> {
        if y_names.len() != x_names.len() {
            return Err(InversionError::Variable(format!(
                "got {} Y name(s) but {} X name(s)",
                y_names.len(),
                x_names.len()
            )));
        }
        let all: Vec<&str> = y_names.iter().chain(x_names).copied().collect();
        for (i, name) in all.iter().enumerate() {
            if all[..i].contains(name) {
                return Err(InversionError::Variable(format!(
                    "'{name}' is named more than once in the gradient outputs"
                )));
            }
        }
        Ok(())
    }

    fn broadcast(&self, job: impl Job + 'static) -> InversionResult<()> {
        let mut world = self.world.lock();
        world.add_job_per_world(job);
        world.run_jobs()
    }

    fn query_owner(&self, wiring: Wiring, query: OwnerQuery) -> InversionResult<Value> {
        let owner = self.config.regularization_owner;
        let mut world = self.world.lock();
        world.clear_variable(RESULT);
        world.add_job(
            owner,
            OwnerJob {
                num_level_sets: wiring.num_level_sets,
                query,
            },
        )?;
        world.run_jobs()?;
        let result = world.get_gathered(RESULT)?.get(owner).cloned().flatten();
        result.ok_or_else(|| InversionError::Variable(format!("subworld {owner} produced no result")))
    }

    /// Wire the split world: run `init` on every subworld, then validate
    /// what it exported.
    pub fn configure(
        &mut self,
        num_level_sets: usize,
        num_models: usize,
        num_mappings: usize,
        init: impl Job + 'static,
    ) -> InversionResult<()> {
        if self.wiring.is_some() {
            return Err(InversionError::Config(
                "cost function is already configured".to_string(),
            ));
        }
        if num_level_sets < 1 || num_models < 1 || num_mappings < 1 {
            return Err(InversionError::Config(format!(
                "need at least one level set, model and mapping, got {num_level_sets}/{num_models}/{num_mappings}"
            )));
        }
        let wiring = Wiring {
            num_level_sets,
            num_models,
            num_mappings,
        };
        let owner = self.config.regularization_owner;

        let mut world = self.world.lock();
        for name in REQUIRED.iter().chain(&[POINT]) {
            world.add_variable(name, Reducer::Local)?;
        }
        for name in [MODEL_COUNT, MU_REPORT, REG_FACTORS, COMPONENTS, RESULT] {
            world.add_variable(name, Reducer::Gather)?;
        }
        for name in [
            &self.config.value_name,
            &self.config.gradient_y_name,
            &self.config.gradient_x_name,
        ] {
            world.add_variable(name, Reducer::Sum)?;
        }

        world.add_job_per_world(init);
        world.run_jobs()?;
        let vars = world.var_list();
        for required in REQUIRED {
            let present = vars.iter().any(|(name, set)| name == required && *set);
            if !present {
                return Err(InversionError::MissingWiring(required.to_string()));
            }
        }

        world.add_job_per_world(WiringReport { wiring, owner });
        world.run_jobs()?;

        let world_count = world.world_count();
        let counts = world.get_gathered(MODEL_COUNT)?;
        let mut model_counts = Vec::with_capacity(world_count);
        for (id, slot) in counts.iter().enumerate() {
            let count = match slot {
                Some(v) => v.as_scalar()? as usize,
                None => 0,
            };
            let expected = model_slice(id, world_count, num_models).len();
            if count != expected {
                return Err(InversionError::Partition(format!(
                    "subworld {id} holds {count} model(s), partition of {num_models} over {world_count} expects {expected}"
                )));
            }
            model_counts.push(count);
        }

        let mut mu_model = Vec::with_capacity(num_models);
        for (id, slot) in world.get_gathered(MU_REPORT)?.iter().enumerate() {
            let mu = match slot {
                Some(v) => v.as_vector()?.to_vec(),
                None => Vec::new(),
            };
            if mu.len() != model_counts[id] {
                return Err(InversionError::InvalidTradeOff(format!(
                    "subworld {id} exported {} factor(s) for {} model(s)",
                    mu.len(),
                    model_counts[id]
                )));
            }
            mu_model.extend(mu);
        }
        check_positive("mu_model", &mu_model)?;

        let factors = match world.get_gathered(REG_FACTORS)?.get(owner) {
            Some(Some(v)) => v.as_vector()?.to_vec(),
            _ => {
                return Err(InversionError::MissingWiring(REGULARIZATION.to_string()));
            }
        };
        drop(world);

        log::info!(
            "configured split inversion: {num_level_sets} level set(s), {num_models} model(s), \
             {num_mappings} mapping(s) over {world_count} subworld(s)"
        );
        self.wiring = Some(wiring);
        self.model_counts = model_counts;
        self.mu_model = mu_model;
        self.regularization_factors = factors;
        self.state = EvaluationState::Configured;
        Ok(())
    }

    pub fn num_level_sets(&self) -> InversionResult<usize> {
        Ok(self.wiring("num_level_sets")?.num_level_sets)
    }

    pub fn num_models(&self) -> InversionResult<usize> {
        Ok(self.wiring("num_models")?.num_models)
    }

    pub fn num_mappings(&self) -> InversionResult<usize> {
        Ok(self.wiring("num_mappings")?.num_mappings)
    }

    /// Forward models held by each subworld, in subworld-id order.
    pub fn model_counts(&self) -> InversionResult<&[usize]> {
        self.wiring("model_counts")?;
        Ok(&self.model_counts)
    }

    /// Per-subworld factor slices. Chunked slices go out as computed;
    /// a mismatch is reported by the next value or gradient round.
    fn mu_slices(&self, wiring: Wiring, mu: &[f64]) -> Vec<Vec<f64>> {
        let world_count = self.config.world_count;
        (0..world_count)
            .map(|id| {
                let range = match self.config.trade_off_slicing {
                    TradeOffSlicing::Ownership => model_slice(id, world_count, wiring.num_models),
                    TradeOffSlicing::Chunked => chunked_slice(id, world_count, wiring.num_models),
                };
                if range.len() != self.model_counts[id] {
                    log::warn!(
                        "chunked trade-off slice {range:?} does not match the {} model(s) of subworld {id}",
                        self.model_counts[id]
                    );
                }
                mu[range].to_vec()
            })
            .collect()
    }

    /// Set the forward-model trade-off factors. `None` resets all to 1.
    pub fn set_trade_off_factors_models(&mut self, mu: Option<&[f64]>) -> InversionResult<()> {
        let wiring = self.wiring("set_trade_off_factors_models")?;
        let values = match mu {
            None => vec![1.0; wiring.num_models],
            Some(v) if v.len() == wiring.num_models => v.to_vec(),
            Some(v) => {
                return Err(InversionError::InvalidTradeOff(format!(
                    "expected {} factor(s), got {}",
                    wiring.num_models,
                    v.len()
                )))
            }
        };
        check_positive("mu_model", &values)?;
        let slices = self.mu_slices(wiring, &values);
        self.broadcast(SetMu { slices })?;
        log::info!("forward model trade-off factors set to {values:?}");
        self.mu_model = values;
        Ok(())
    }

    pub fn get_trade_off_factors_models(&self) -> InversionResult<Vec<f64>> {
        self.wiring("get_trade_off_factors_models")?;
        Ok(self.mu_model.clone())
    }

    fn check_regularization_factors(
        &self,
        wiring: Wiring,
        mu: Option<&[f64]>,
        mu_c: Option<&[f64]>,
    ) -> InversionResult<()> {
        let n = wiring.num_level_sets;
        let pairs = self.regularization_factors.len().saturating_sub(n);
        if let Some(mu) = mu {
            if mu.len() != n {
                return Err(InversionError::InvalidTradeOff(format!(
                    "expected {n} variation factor(s), got {}",
                    mu.len()
                )));
            }
            check_positive("variation", mu)?;
        }
        if let Some(mu_c) = mu_c {
            if mu_c.len() != pairs {
                return Err(InversionError::InvalidTradeOff(format!(
                    "expected {pairs} cross-gradient factor(s), got {}",
                    mu_c.len()
                )));
            }
            if let Some(v) = mu_c.iter().find(|&&v| !(v.is_finite() && v >= 0.0)) {
                return Err(InversionError::InvalidTradeOff(format!(
                    "cross-gradient factors must be >= 0, got {v}"
                )));
            }
        }
        Ok(())
    }

    fn apply_regularization_factors(&mut self, factors: RegularizationFactors) -> InversionResult<()> {
        let owner = self.config.regularization_owner;
        {
            let mut world = self.world.lock();
            world.clear_variable(REG_FACTORS);
            world.add_job_per_world(SetRegularizationFactors { factors, owner });
            world.run_jobs()?;
            if let Some(Some(v)) = world.get_gathered(REG_FACTORS)?.get(owner) {
                self.regularization_factors = v.as_vector()?.to_vec();
            }
        }
        log::info!(
            "regularization trade-off factors set to {:?}",
            self.regularization_factors
        );
        Ok(())
    }

    /// Set the regularization's variation and cross-gradient factors on
    /// every replica. `None` resets the respective group to 1.
    pub fn set_trade_off_factors_regularization(
        &mut self,
        mu: Option<&[f64]>,
        mu_c: Option<&[f64]>,
    ) -> InversionResult<()> {
        let wiring = self.wiring("set_trade_off_factors_regularization")?;
        self.check_regularization_factors(wiring, mu, mu_c)?;
        self.apply_regularization_factors(RegularizationFactors::Split {
            mu: mu.map(<[f64]>::to_vec),
            mu_c: mu_c.map(<[f64]>::to_vec),
        })
    }

    /// All factors: forward models first, then the regularization's.
    /// `None` resets everything to 1.
    pub fn set_trade_off_factors(&mut self, mu: Option<&[f64]>) -> InversionResult<()> {
        let wiring = self.wiring("set_trade_off_factors")?;
        let total = self.get_num_trade_off_factors()?;
        let values = match mu {
            None => vec![1.0; total],
            Some(v) if v.len() == total => v.to_vec(),
            Some(v) => {
                return Err(InversionError::InvalidTradeOff(format!(
                    "expected {total} factor(s), got {}",
                    v.len()
                )))
            }
        };
        let (models, reg) = values.split_at(wiring.num_models);
        check_positive("mu_model", models)?;
        let (variation, cross) = reg.split_at(wiring.num_level_sets.min(reg.len()));
        self.check_regularization_factors(wiring, Some(variation), Some(cross))?;

        self.set_trade_off_factors_models(Some(models))?;
        self.apply_regularization_factors(RegularizationFactors::All(reg.to_vec()))
    }

    pub fn get_trade_off_factors(&self) -> InversionResult<Vec<f64>> {
        self.wiring("get_trade_off_factors")?;
        Ok(self
            .mu_model
            .iter()
            .chain(&self.regularization_factors)
            .copied()
            .collect())
    }

    pub fn get_num_trade_off_factors(&self) -> InversionResult<usize> {
        let wiring = self.wiring("get_num_trade_off_factors")?;
        Ok(wiring.num_models + self.regularization_factors.len())
    }

    /// Map `m` to properties and prime every forward model. Barrier.
    pub fn set_point(&mut self, m: &Field) -> InversionResult<()> {
        let wiring = self.wiring("set_point")?;
        self.check_level_set(m, wiring, "set_point")?;
        self.stats.arguments_calls += 1;
        let job = SetPoint {
            point: m.clone(),
            num_level_sets: wiring.num_level_sets,
        };
        match self.broadcast(job) {
            Ok(()) => {
                self.state = EvaluationState::PointSet;
                Ok(())
            }
            Err(e) => {
                self.state = EvaluationState::Configured;
                Err(e)
            }
        }
    }

    /// Export `J` at the current point under every name in `names`
    /// (summed variables).
    pub fn calculate_value(&mut self, names: &[&str]) -> InversionResult<()> {
        let wiring = self.require_point("calculate_value")?;
        self.stats.value_calls += 1;
        let job = ValueJob {
            names: names.iter().map(|s| s.to_string()).collect(),
            owner: self.config.regularization_owner,
            num_models: wiring.num_models,
        };
        {
            let mut world = self.world.lock();
            Self::check_sum_names(&world, names)?;
            names.iter().for_each(|n| world.clear_variable(n));
            world.add_job_per_world(job);
            world.run_jobs()?;
        }
        self.state = EvaluationState::ValueComputed;
        Ok(())
    }

    /// Export `∇J = (Y, X)` at the current point. `X` comes from the
    /// regularization owner only.
    pub fn calculate_gradient(&mut self, y_names: &[&str], x_names: &[&str]) -> InversionResult<()> {
        let wiring = self.require_point("calculate_gradient")?;
        Self::check_gradient_names(y_names, x_names)?;
        self.stats.gradient_calls += 1;
        let job = GradientJob {
            y_names: y_names.iter().map(|s| s.to_string()).collect(),
            x_names: x_names.iter().map(|s| s.to_string()).collect(),
            owner: self.config.regularization_owner,
            num_level_sets: wiring.num_level_sets,
        };
        let mut world = self.world.lock();
        Self::check_sum_names(&world, y_names)?;
        Self::check_sum_names(&world, x_names)?;
        y_names
            .iter()
            .chain(x_names)
            .for_each(|n| world.clear_variable(n));
        world.add_job_per_world(job);
        world.run_jobs()
    }

    /// `J(m)`.
    pub fn get_value(&mut self, m: &Field) -> InversionResult<f64> {
        self.set_point(m)?;
        let name = self.config.value_name.clone();
        self.calculate_value(&[name.as_str()])?;
        self.world.lock().get_double(&name)
    }

    /// `∇J(m)`.
    pub fn get_gradient(&mut self, m: &Field) -> InversionResult<Gradient> {
        self.set_point(m)?;
        let y_name = self.config.gradient_y_name.clone();
        let x_name = self.config.gradient_x_name.clone();
        self.calculate_gradient(&[y_name.as_str()], &[x_name.as_str()])?;
        let (y, x) = {
            let world = self.world.lock();
            (world.get_field(&y_name)?, world.get_field(&x_name)?)
        };
        Gradient::new(y, x)
    }

    /// `[J_reg, J_f0, J_f1, …]`, forward-model terms unweighted.
    pub fn get_component_values(&mut self, m: &Field) -> InversionResult<Vec<f64>> {
        self.set_point(m)?;
        let owner = self.config.regularization_owner;
        let mut world = self.world.lock();
        world.clear_variable(RESULT);
        world.clear_variable(COMPONENTS);
        world.add_job_per_world(ComponentsJob { owner });
        world.run_jobs()?;
        let j_reg = match world.get_gathered(RESULT)?.get(owner) {
            Some(Some(v)) => v.as_scalar()?,
            _ => {
                return Err(InversionError::Variable(format!(
                    "subworld {owner} produced no regularization value"
                )))
            }
        };
        let mut out = vec![j_reg];
        for slot in world.get_gathered(COMPONENTS)?.iter().flatten() {
            out.extend_from_slice(slot.as_vector()?);
        }
        Ok(out)
    }

    /// Approximate `H⁻¹ r`, from the owner's regularization.
    pub fn get_inverse_hessian_approximation(
        &mut self,
        m: &Field,
        r: &Gradient,
    ) -> InversionResult<Field> {
        let wiring = self.wiring("get_inverse_hessian_approximation")?;
        self.check_level_set(m, wiring, "get_inverse_hessian_approximation")?;
        self.stats.inverse_hessian_calls += 1;
        let query = OwnerQuery::InverseHessian {
            m: m.clone(),
            r: r.clone(),
        };
        Ok(self.query_owner(wiring, query)?.as_field()?.clone())
    }

    /// Notify every regularization replica that the Hessian is stale.
    pub fn update_hessian(&mut self) -> InversionResult<()> {
        self.wiring("update_hessian")?;
        self.stats.hessian_updates += 1;
        self.broadcast(UpdateHessian)
    }

    /// `<r, x>` for a level-set perturbation `x`.
    pub fn get_dual_product(&mut self, x: &Field, r: &Gradient) -> InversionResult<f64> {
        let wiring = self.wiring("get_dual_product")?;
        self.stats.dual_product_calls += 1;
        let query = OwnerQuery::DualProduct {
            x: x.clone(),
            r: r.clone(),
        };
        self.query_owner(wiring, query)?.as_scalar()
    }

    pub fn get_norm(&mut self, m: &Field) -> InversionResult<f64> {
        let wiring = self.wiring("get_norm")?;
        self.stats.norm_calls += 1;
        self.query_owner(wiring, OwnerQuery::Norm { m: m.clone() })?
            .as_scalar()
    }

    /// Physical properties of `m`, one per mapping.
    pub fn get_properties(&self, m: &Field) -> InversionResult<Vec<Field>> {
        let wiring = self.wiring("get_properties")?;
        self.check_level_set(m, wiring, "get_properties")?;
        Ok(self
            .query_owner(wiring, OwnerQuery::Properties { m: m.clone() })?
            .as_fields()?
            .to_vec())
    }

    /// Level set built from mapping inverses. Entry `i` of `props`, when
    /// present, is the target property of mapping `i`; untouched
    /// components stay zero.
    pub fn create_level_set_function(&self, props: &[Option<Field>]) -> InversionResult<Field> {
        let wiring = self.wiring("create_level_set_function")?;
        if props.len() > wiring.num_mappings {
            return Err(InversionError::IndexOutOfRange(format!(
                "{} properties for {} mapping(s)",
                props.len(),
                wiring.num_mappings
            )));
        }
        let query = OwnerQuery::LevelSet {
            props: props.to_vec(),
        };
        Ok(self.query_owner(wiring, query)?.as_field()?.clone())
    }
}
