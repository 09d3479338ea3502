// ─────────────────────────────────────────────────────────────────────
// JointInv — Split World Scheduler
// ─────────────────────────────────────────────────────────────────────
//! A fixed pool of subworlds with a named-variable reduction bus.
//!
//! Jobs are queued per subworld and executed by `run_jobs()`, which
//! is a barrier: every subworld runs its queue (in parallel, via rayon)
//! and only then are exports committed. Reductions are applied in
//! subworld-id order, so sums are reproducible bit for bit regardless
//! of which subworld finished first.
//!
//! Exports are staged. If any job fails the whole batch is discarded
//! and the first error in subworld-id order is returned. In-place
//! mutation through `import_value_mut` is not staged.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use jointinv_types::{Discretization, Field, InversionConfig, InversionError, InversionResult};

use crate::regularization::Regularization;
use crate::wiring::{model_slice, LocalMapping, LocalModel};

/// Work item executed inside one subworld.
pub trait Job: Send + Sync {
    fn run(&self, world: &mut SubWorld) -> InversionResult<()>;
}

impl<F> Job for F
where
    F: Fn(&mut SubWorld) -> InversionResult<()> + Send + Sync,
{
    fn run(&self, world: &mut SubWorld) -> InversionResult<()> {
        self(world)
    }
}

/// How exports of a variable are combined across subworlds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Stays inside the exporting subworld.
    Local,
    /// Summed across subworlds.
    Sum,
    /// One slot per subworld.
    Gather,
}

/// Plain data carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
    Field(Field),
    Fields(Vec<Field>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Vector(_) => "vector",
            Value::Field(_) => "field",
            Value::Fields(_) => "field list",
        }
    }

    fn add_assign(&mut self, other: &Value) -> InversionResult<()> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a += b,
            (Value::Vector(a), Value::Vector(b)) if a.len() == b.len() => {
                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
            }
            (Value::Field(a), Value::Field(b)) => a.add_assign(b)?,
            (a, b) => {
                return Err(InversionError::Variable(format!(
                    "cannot sum a {} and a {}",
                    a.kind(),
                    b.kind()
                )))
            }
        }
        Ok(())
    }

    pub fn as_scalar(&self) -> InversionResult<f64> {
        match self {
            Value::Scalar(v) => Ok(*v),
            other => Err(wrong_kind("scalar", other.kind())),
        }
    }

    pub fn as_vector(&self) -> InversionResult<&[f64]> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(wrong_kind("vector", other.kind())),
        }
    }

    pub fn as_field(&self) -> InversionResult<&Field> {
        match self {
            Value::Field(f) => Ok(f),
            other => Err(wrong_kind("field", other.kind())),
        }
    }

    pub fn as_fields(&self) -> InversionResult<&[Field]> {
        match self {
            Value::Fields(f) => Ok(f),
            other => Err(wrong_kind("field list", other.kind())),
        }
    }
}

fn wrong_kind(expected: &str, got: &str) -> InversionError {
    InversionError::Variable(format!("expected a {expected}, variable holds a {got}"))
}

/// Anything a subworld can hold under a name.
pub enum Variable {
    Value(Value),
    Models(Vec<LocalModel>),
    Mappings(Vec<LocalMapping>),
    Regularization(Box<dyn Regularization>),
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Variable::Models(m) => f.debug_tuple("Models").field(&m.len()).finish(),
            Variable::Mappings(m) => f.debug_tuple("Mappings").field(&m.len()).finish(),
            Variable::Regularization(_) => f.write_str("Regularization"),
        }
    }
}

impl Variable {
    fn kind(&self) -> &'static str {
        match self {
            Variable::Value(v) => v.kind(),
            Variable::Models(_) => "model list",
            Variable::Mappings(_) => "mapping list",
            Variable::Regularization(_) => "regularization",
        }
    }

    pub fn as_value(&self) -> InversionResult<&Value> {
        match self {
            Variable::Value(v) => Ok(v),
            other => Err(wrong_kind("plain value", other.kind())),
        }
    }

    pub fn as_models(&self) -> InversionResult<&[LocalModel]> {
        match self {
            Variable::Models(m) => Ok(m),
            other => Err(wrong_kind("model list", other.kind())),
        }
    }

    pub fn as_models_mut(&mut self) -> InversionResult<&mut [LocalModel]> {
        match self {
            Variable::Models(m) => Ok(m),
            other => Err(wrong_kind("model list", other.kind())),
        }
    }

    pub fn as_mappings(&self) -> InversionResult<&[LocalMapping]> {
        match self {
            Variable::Mappings(m) => Ok(m),
            other => Err(wrong_kind("mapping list", other.kind())),
        }
    }

    pub fn as_regularization(&self) -> InversionResult<&dyn Regularization> {
        match self {
            Variable::Regularization(r) => Ok(r.as_ref()),
            other => Err(wrong_kind("regularization", other.kind())),
        }
    }

    pub fn as_regularization_mut(&mut self) -> InversionResult<&mut dyn Regularization> {
        match self {
            Variable::Regularization(r) => Ok(r.as_mut()),
            other => Err(wrong_kind("regularization", other.kind())),
        }
    }
}

impl From<Value> for Variable {
    fn from(v: Value) -> Self {
        Variable::Value(v)
    }
}

impl From<f64> for Variable {
    fn from(v: f64) -> Self {
        Variable::Value(Value::Scalar(v))
    }
}

impl From<Vec<f64>> for Variable {
    fn from(v: Vec<f64>) -> Self {
        Variable::Value(Value::Vector(v))
    }
}

impl From<Field> for Variable {
    fn from(f: Field) -> Self {
        Variable::Value(Value::Field(f))
    }
}

impl From<Vec<Field>> for Variable {
    fn from(f: Vec<Field>) -> Self {
        Variable::Value(Value::Fields(f))
    }
}

impl From<Vec<LocalModel>> for Variable {
    fn from(m: Vec<LocalModel>) -> Self {
        Variable::Models(m)
    }
}

impl From<Vec<LocalMapping>> for Variable {
    fn from(m: Vec<LocalMapping>) -> Self {
        Variable::Mappings(m)
    }
}

impl From<Box<dyn Regularization>> for Variable {
    fn from(r: Box<dyn Regularization>) -> Self {
        Variable::Regularization(r)
    }
}

/// Isolated execution context. Jobs see only their own subworld.
pub struct SubWorld {
    id: usize,
    world_count: usize,
    domain: Discretization,
    declared: Arc<BTreeMap<String, Reducer>>,
    locals: HashMap<String, Variable>,
    staged_locals: HashMap<String, Variable>,
    staged: HashMap<String, Value>,
}

impl SubWorld {
    fn new(id: usize, world_count: usize, domain: Discretization) -> Self {
        Self {
            id,
            world_count,
            domain,
            declared: Arc::new(BTreeMap::new()),
            locals: HashMap::new(),
            staged_locals: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn world_count(&self) -> usize {
        self.world_count
    }

    pub fn domain(&self) -> Discretization {
        self.domain
    }

    /// Models this subworld owns out of `num_models`.
    pub fn model_slice(&self, num_models: usize) -> Range<usize> {
        model_slice(self.id, self.world_count, num_models)
    }

    fn reducer(&self, name: &str) -> InversionResult<Reducer> {
        self.declared
            .get(name)
            .copied()
            .ok_or_else(|| InversionError::Variable(format!("'{name}' is not declared")))
    }

    fn check_local(&self, name: &str) -> InversionResult<()> {
        match self.reducer(name)? {
            Reducer::Local => Ok(()),
            r => Err(InversionError::Variable(format!(
                "'{name}' is a {r:?} variable and cannot be imported inside a job"
            ))),
        }
    }

    /// Read a local variable. Values exported earlier in the same batch
    /// are visible.
    pub fn import_value(&self, name: &str) -> InversionResult<&Variable> {
        self.check_local(name)?;
        self.staged_locals
            .get(name)
            .or_else(|| self.locals.get(name))
            .ok_or_else(|| {
                InversionError::Variable(format!("'{name}' has no value in subworld {}", self.id))
            })
    }

    pub fn import_value_mut(&mut self, name: &str) -> InversionResult<&mut Variable> {
        self.check_local(name)?;
        let id = self.id;
        let slot = if self.staged_locals.contains_key(name) {
            self.staged_locals.get_mut(name)
        } else {
            self.locals.get_mut(name)
        };
        slot.ok_or_else(|| InversionError::Variable(format!("'{name}' has no value in subworld {id}")))
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.staged_locals.contains_key(name) || self.locals.contains_key(name)
    }

    /// Stage an export. Reduced variables only carry plain values.
    pub fn export_value(&mut self, name: &str, value: impl Into<Variable>) -> InversionResult<()> {
        let value = value.into();
        match self.reducer(name)? {
            Reducer::Local => {
                self.staged_locals.insert(name.to_string(), value);
            }
            Reducer::Sum | Reducer::Gather => match value {
                Variable::Value(v) => {
                    self.staged.insert(name.to_string(), v);
                }
                other => {
                    return Err(InversionError::Variable(format!(
                        "'{name}' is reduced across subworlds and cannot hold a {}",
                        other.kind()
                    )))
                }
            },
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.staged_locals.clear();
        self.staged.clear();
    }

    fn commit_locals(&mut self) {
        self.locals.extend(self.staged_locals.drain());
    }
}

type JobQueue = Vec<Arc<dyn Job>>;

/// Job distributor over `world_count` subworlds.
pub struct SplitWorld {
    domain: Discretization,
    worlds: Vec<SubWorld>,
    declared: BTreeMap<String, Reducer>,
    queues: Vec<JobQueue>,
    reduced: HashMap<String, Value>,
    gathered: HashMap<String, Vec<Option<Value>>>,
}

impl SplitWorld {
    pub fn new(world_count: usize, domain: Discretization) -> InversionResult<Self> {
        if world_count < 1 {
            return Err(InversionError::Config(
                "a split world needs at least one subworld".to_string(),
            ));
        }
        Ok(Self {
            domain,
            worlds: (0..world_count)
                .map(|id| SubWorld::new(id, world_count, domain))
                .collect(),
            declared: BTreeMap::new(),
            queues: vec![Vec::new(); world_count],
            reduced: HashMap::new(),
            gathered: HashMap::new(),
        })
    }

    pub fn from_config(config: &InversionConfig, domain: Discretization) -> InversionResult<Self> {
        config.validate()?;
        Self::new(config.world_count, domain)
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }

    pub fn domain(&self) -> Discretization {
        self.domain
    }

    /// Declare a bus variable. Re-declaring with the same reducer is a no-op.
    pub fn add_variable(&mut self, name: &str, reducer: Reducer) -> InversionResult<()> {
        match self.declared.get(name) {
            Some(&existing) if existing != reducer => Err(InversionError::Variable(format!(
                "'{name}' already declared as {existing:?}, cannot redeclare as {reducer:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.declared.insert(name.to_string(), reducer);
                Ok(())
            }
        }
    }

    pub fn reducer(&self, name: &str) -> Option<Reducer> {
        self.declared.get(name).copied()
    }

    pub fn add_job_per_world(&mut self, job: impl Job + 'static) {
        let job: Arc<dyn Job> = Arc::new(job);
        for queue in &mut self.queues {
            queue.push(Arc::clone(&job));
        }
    }

    pub fn add_job(&mut self, world: usize, job: impl Job + 'static) -> InversionResult<()> {
        let count = self.world_count();
        let queue = self.queues.get_mut(world).ok_or_else(|| {
            InversionError::IndexOutOfRange(format!("subworld {world} >= world count {count}"))
        })?;
        queue.push(Arc::new(job));
        Ok(())
    }

    /// Run every queued job and commit exports. Barrier.
    pub fn run_jobs(&mut self) -> InversionResult<()> {
        let queues = std::mem::replace(&mut self.queues, vec![Vec::new(); self.worlds.len()]);
        let declared = Arc::new(self.declared.clone());
        let jobs: usize = queues.iter().map(Vec::len).sum();
        log::debug!("running {jobs} job(s) on {} subworld(s)", self.worlds.len());

        let results: Vec<InversionResult<()>> = self
            .worlds
            .par_iter_mut()
            .zip(queues.into_par_iter())
            .map(|(world, queue)| -> InversionResult<()> {
                world.declared = Arc::clone(&declared);
                for job in &queue {
                    job.run(world)?;
                }
                Ok(())
            })
            .collect();

        let failure = results
            .into_iter()
            .enumerate()
            .find_map(|(id, r)| r.err().map(|e| (id, e)));
        if let Some((id, err)) = failure {
            self.worlds.iter_mut().for_each(SubWorld::discard);
            log::error!("job batch aborted in subworld {id}: {err}");
            return Err(err);
        }

        if let Err(err) = self.reduce() {
            self.worlds.iter_mut().for_each(SubWorld::discard);
            log::error!("job batch aborted during reduction: {err}");
            return Err(err);
        }
        self.worlds.iter_mut().for_each(SubWorld::commit_locals);
        Ok(())
    }

    /// Fold staged exports in subworld-id order.
    fn reduce(&mut self) -> InversionResult<()> {
        let world_count = self.worlds.len();
        let mut sums: BTreeMap<String, Value> = BTreeMap::new();
        let mut gathers: BTreeMap<String, Vec<Option<Value>>> = BTreeMap::new();
        let staged: Vec<HashMap<String, Value>> = self
            .worlds
            .iter_mut()
            .map(|w| std::mem::take(&mut w.staged))
            .collect();

        for (id, exports) in staged.into_iter().enumerate() {
            let mut exports: Vec<(String, Value)> = exports.into_iter().collect();
            exports.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, value) in exports {
                match self.declared.get(&name) {
                    Some(Reducer::Sum) => match sums.get_mut(&name) {
                        Some(acc) => acc.add_assign(&value).map_err(|e| {
                            InversionError::Variable(format!("summing '{name}': {e}"))
                        })?,
                        None => {
                            sums.insert(name, value);
                        }
                    },
                    Some(Reducer::Gather) => {
                        gathers
                            .entry(name)
                            .or_insert_with(|| vec![None; world_count])[id] = Some(value);
                    }
                    _ => {
                        return Err(InversionError::Variable(format!(
                            "'{name}' was staged but is not a reduced variable"
                        )))
                    }
                }
            }
        }
        self.reduced.extend(sums);
        self.gathered.extend(gathers);
        Ok(())
    }

    /// `(name, has_value)` for every declared variable. A local variable
    /// has a value only when every subworld holds one.
    pub fn var_list(&self) -> Vec<(String, bool)> {
        self.declared
            .iter()
            .map(|(name, reducer)| {
                let set = match reducer {
                    Reducer::Local => self.worlds.iter().all(|w| w.locals.contains_key(name)),
                    Reducer::Sum => self.reduced.contains_key(name),
                    Reducer::Gather => self
                        .gathered
                        .get(name)
                        .is_some_and(|slots| slots.iter().any(Option::is_some)),
                };
                (name.clone(), set)
            })
            .collect()
    }

    pub fn get_value(&self, name: &str) -> InversionResult<&Value> {
        match self.declared.get(name) {
            Some(Reducer::Sum) => self.reduced.get(name).ok_or_else(|| {
                InversionError::Variable(format!("'{name}' has not been exported yet"))
            }),
            Some(r) => Err(InversionError::Variable(format!(
                "'{name}' is a {r:?} variable, not a summed one"
            ))),
            None => Err(InversionError::Variable(format!("'{name}' is not declared"))),
        }
    }

    pub fn get_double(&self, name: &str) -> InversionResult<f64> {
        self.get_value(name)?.as_scalar()
    }

    pub fn get_field(&self, name: &str) -> InversionResult<Field> {
        self.get_value(name)?.as_field().cloned()
    }

    /// One slot per subworld; `None` where a subworld did not export.
    pub fn get_gathered(&self, name: &str) -> InversionResult<&[Option<Value>]> {
        match self.declared.get(name) {
            Some(Reducer::Gather) => self
                .gathered
                .get(name)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    InversionError::Variable(format!("'{name}' has not been exported yet"))
                }),
            Some(r) => Err(InversionError::Variable(format!(
                "'{name}' is a {r:?} variable, not a gathered one"
            ))),
            None => Err(InversionError::Variable(format!("'{name}' is not declared"))),
        }
    }

    /// Forget the reduced value of `name` so a stale result is never read.
    pub fn clear_variable(&mut self, name: &str) {
        self.reduced.remove(name);
        self.gathered.remove(name);
    }
}
