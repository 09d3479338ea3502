// ─────────────────────────────────────────────────────────────────────
// JointInv — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all cost function and split-world failures.
///
/// Every variant is fatal to the call that raised it. Nothing is
/// retried internally; misconfiguration surfaces to the caller as-is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InversionError {
    /// Operation invoked before `configure()` succeeded.
    #[error("not configured: {0} requires a configured inversion cost function")]
    NotConfigured(String),

    /// Value or gradient requested before `set_point()` completed.
    #[error("point not set: {0} requires set_point() first")]
    PointNotSet(String),

    /// A required named variable was not created by the world init function.
    #[error("missing wiring: required variable '{0}' was not created by the world init function")]
    MissingWiring(String),

    /// Non-positive, non-finite or wrongly sized trade-off factor(s).
    #[error("invalid trade-off factor: {0}")]
    InvalidTradeOff(String),

    /// Mapping, property or level-set index out of range.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    /// Field defined on the wrong discretization.
    #[error("domain mismatch: {0}")]
    DomainMismatch(String),

    /// Per-point shapes do not line up.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Model ownership does not match the subworld partition.
    #[error("partition error: {0}")]
    Partition(String),

    /// Unknown, undeclared or wrongly typed bus variable.
    #[error("variable error: {0}")]
    Variable(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Numerical error (NaN/Inf in computation).
    #[error("numerical error: {0}")]
    Numerical(String),
}

pub type InversionResult<T> = Result<T, InversionError>;
