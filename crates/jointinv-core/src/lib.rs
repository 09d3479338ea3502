// ─────────────────────────────────────────────────────────────────────
// JointInv — Split Inversion Core Engine
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Joint-inversion cost function split across parallel subworlds.
//!
//! `J(m) = J_reg(m) + Σ_f mu_f · J_f(p)`: a multi-component level set
//! `m` is mapped to physical properties `p`, each forward model `f`
//! measures its data misfit on the properties it consumes, and a
//! regularization penalizes the structure of `m`.
//!
//! # Invariants
//!
//! 1. **Regularization counted once**: every subworld holds a replica,
//!    only `regularization_owner` contributes its value and gradient.
//!    Totals do not depend on the number of subworlds.
//!
//! 2. **Contiguous ownership**: subworld `i` owns models
//!    `[i·c, min((i+1)·c, n))` with `c = ceil(n / W)`. `configure()`
//!    rejects any other layout.
//!
//! 3. **Reproducible reductions**: subworlds run in parallel, but sums
//!    are folded in subworld-id order.
//!
//! 4. **Fail fast**: nothing evaluates before `configure()` has
//!    validated the wiring, and a failing job discards the whole batch.

pub mod chain;
pub mod cost;
pub mod forward;
pub mod mapping;
pub mod regularization;
pub mod splitworld;
pub mod wiring;

pub use chain::{accumulate, ChainTarget, GradOp, Jacobian};
pub use cost::{CostFunctionStatistics, EvaluationState, SplitInversionCostFunction};
pub use forward::{ExternalForwardModel, ForwardModel, LeastSquaresModel};
pub use mapping::{
    insert_level_set, level_set_shape, restrict_level_set, ExponentialMapping, LinearMapping,
    Mapping, WeightedSumMapping,
};
pub use regularization::{L2Regularization, Regularization};
pub use splitworld::{Job, Reducer, SplitWorld, SubWorld, Value, Variable};
pub use wiring::{
    chunked_slice, format_mappings, format_models, model_slice, LocalMapping, LocalModel,
    MappingSpec, ModelSpec,
};
