// ─────────────────────────────────────────────────────────────────────
// JointInv — Split Inversion Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Discretized fields, configuration, and error hierarchy for the
//! joint-inversion split cost function.

pub mod config;
pub mod error;
pub mod field;

pub use config::{InversionConfig, TradeOffSlicing};
pub use error::{InversionError, InversionResult};
pub use field::{Discretization, Field, Gradient};
