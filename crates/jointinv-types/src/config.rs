// ─────────────────────────────────────────────────────────────────────
// JointInv — Split Inversion Configuration
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::error::{InversionError, InversionResult};

/// How the forward-model trade-off factors are sliced across subworlds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOffSlicing {
    /// Each subworld receives the factors of the models it owns
    /// (contiguous slices of size `ceil(num_models / W)`).
    #[default]
    Ownership,
    /// Legacy slicing by subworld index over the flat factor array with
    /// chunk size `max(1, W / num_models)`. Chunks past the end are empty.
    /// Only agrees with model ownership when `num_models == 1` or
    /// `num_models == W`. Other layouts fail at the next evaluation.
    Chunked,
}

/// Runtime configuration for the split inversion cost function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionConfig {
    /// Number of subworlds `W` the forward models are spread over.
    /// Default: 1.
    pub world_count: usize,

    /// Subworld whose regularization contribution is counted.
    /// Default: 0.
    pub regularization_owner: usize,

    /// Trade-off factor broadcast policy.
    /// Default: `Ownership`.
    pub trade_off_slicing: TradeOffSlicing,

    /// Bus name the driver conveniences export the value under.
    /// Default: "J".
    pub value_name: String,

    /// Bus name for the model-space gradient part `Y`.
    /// Default: "grad_y".
    pub gradient_y_name: String,

    /// Bus name for the gradient-space part `X`.
    /// Default: "grad_x".
    pub gradient_x_name: String,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            world_count: 1,
            regularization_owner: 0,
            trade_off_slicing: TradeOffSlicing::Ownership,
            value_name: "J".to_string(),
            gradient_y_name: "grad_y".to_string(),
            gradient_x_name: "grad_x".to_string(),
        }
    }
}

impl InversionConfig {
    pub fn with_worlds(world_count: usize) -> Self {
        Self {
            world_count,
            ..Self::default()
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> InversionResult<()> {
        if self.world_count < 1 {
            return Err(InversionError::Config(format!(
                "world_count must be >= 1, got {}",
                self.world_count
            )));
        }
        if self.regularization_owner >= self.world_count {
            return Err(InversionError::Config(format!(
                "regularization_owner must be < world_count ({}), got {}",
                self.world_count, self.regularization_owner
            )));
        }
        let names = [
            &self.value_name,
            &self.gradient_y_name,
            &self.gradient_x_name,
        ];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(InversionError::Config(
                "variable names must not be empty".to_string(),
            ));
        }
        if self.gradient_y_name == self.gradient_x_name {
            return Err(InversionError::Config(format!(
                "gradient_y_name and gradient_x_name must differ, both are '{}'",
                self.gradient_y_name
            )));
        }
        if self.trade_off_slicing == TradeOffSlicing::Chunked && self.world_count > 1 {
            log::warn!(
                "chunked trade-off slicing over {} subworlds only works for 1 or {} models",
                self.world_count,
                self.world_count
            );
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> InversionResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| InversionError::Config(format!("JSON parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(InversionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_worlds_rejected() {
        let cfg = InversionConfig::with_worlds(0);
        assert!(matches!(cfg.validate(), Err(InversionError::Config(_))));
    }

    #[test]
    fn test_owner_out_of_range() {
        let cfg = InversionConfig {
            world_count: 2,
            regularization_owner: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_gradient_names_must_differ() {
        let cfg = InversionConfig {
            gradient_x_name: "grad_y".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let cfg = InversionConfig::from_json(
            r#"{"world_count": 4, "trade_off_slicing": "chunked"}"#,
        )
        .unwrap();
        assert_eq!(cfg.world_count, 4);
        assert_eq!(cfg.trade_off_slicing, TradeOffSlicing::Chunked);
        assert_eq!(cfg.value_name, "J");
    }

    #[test]
    fn test_from_json_garbage() {
        assert!(matches!(
            InversionConfig::from_json("{not json"),
            Err(InversionError::Config(_))
        ));
    }
}
