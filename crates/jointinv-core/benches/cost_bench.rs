// ─────────────────────────────────────────────────────────────────────
// JointInv — Cost Function Benchmarks
// ─────────────────────────────────────────────────────────────────────
//! Criterion benchmarks for value and gradient rounds on one and four
//! subworlds.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parking_lot::Mutex;

use jointinv_core::cost::{MAPPINGS, MODELS, MU_MODEL, REGULARIZATION};
use jointinv_core::{
    format_mappings, format_models, ForwardModel, L2Regularization, LeastSquaresModel,
    LinearMapping, Mapping, MappingSpec, ModelSpec, Regularization, SplitInversionCostFunction,
    SplitWorld, SubWorld,
};
use jointinv_types::{Discretization, Field, InversionConfig, InversionResult};

const POINTS: usize = 2_000;
const MODELS_TOTAL: usize = 8;

fn domain() -> Discretization {
    Discretization::new(1, POINTS, 0.01).unwrap()
}

fn init(w: &mut SubWorld) -> InversionResult<()> {
    let d = domain();
    let slice = w.model_slice(MODELS_TOTAL);
    let mut specs: Vec<ModelSpec> = Vec::new();
    for i in slice.clone() {
        let observed = Field::from_fn(d, &[], |p, _| (p as f64 * 0.01 + i as f64).sin());
        let model: Box<dyn ForwardModel> = Box::new(LeastSquaresModel::new(observed, 1.0)?);
        specs.push(model.into());
    }
    let mapping: Box<dyn Mapping> = Box::new(LinearMapping::new(d, 0.0, 1.0)?);
    let reg: Box<dyn Regularization> = Box::new(L2Regularization::new(d, 1, 1e-2, 1e-3)?);
    w.export_value(MODELS, format_models(specs, 1)?)?;
    w.export_value(MAPPINGS, format_mappings(vec![MappingSpec::from(mapping)], 1)?)?;
    w.export_value(REGULARIZATION, reg)?;
    w.export_value(MU_MODEL, vec![1.0; slice.len()])
}

fn cost_function(worlds: usize) -> SplitInversionCostFunction {
    let sw = SplitWorld::new(worlds, domain()).unwrap();
    let mut f = SplitInversionCostFunction::new(
        Arc::new(Mutex::new(sw)),
        InversionConfig::with_worlds(worlds),
    )
    .unwrap();
    f.configure(1, MODELS_TOTAL, 1, init).unwrap();
    f
}

// ── get_value() ─────────────────────────────────────────────────────

fn bench_value(c: &mut Criterion) {
    let m = Field::from_fn(domain(), &[], |p, _| (p as f64 * 0.003).cos());
    for worlds in [1, 4] {
        let mut f = cost_function(worlds);
        c.bench_function(&format!("value_{worlds}w"), |b| {
            b.iter(|| f.get_value(black_box(&m)).unwrap())
        });
    }
}

// ── get_gradient() ──────────────────────────────────────────────────

fn bench_gradient(c: &mut Criterion) {
    let m = Field::from_fn(domain(), &[], |p, _| (p as f64 * 0.003).cos());
    for worlds in [1, 4] {
        let mut f = cost_function(worlds);
        c.bench_function(&format!("gradient_{worlds}w"), |b| {
            b.iter(|| f.get_gradient(black_box(&m)).unwrap())
        });
    }
}

criterion_group!(benches, bench_value, bench_gradient);
criterion_main!(benches);
