//! Prediction collaborator: a tiny fixed-architecture linear regressor over
//! the engineered-feature contract.
//!
//! Model unavailability is an explicit [`PredictionUnavailable`] condition
//! surfaced at load time, and the fallback is a documented deterministic
//! function rather than a catch-all heuristic.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use twinrc_core::{FeatureVector, Prediction, Scenario};

pub const CRATE_NAME: &str = "twinrc-model";
pub const MODEL_VERSION: &str = "linear-v1";

/// Model input width: the six engineered features plus the scenario slot.
pub const INPUT_SLOTS: usize = 7;

/// Raised when the regressor cannot be constructed (missing or malformed
/// weights). Callers decide whether to surface it or fall back.
#[derive(Debug, Error)]
#[error("prediction model unavailable: {reason}")]
pub struct PredictionUnavailable {
    pub reason: String,
}

/// Weights for the two output heads, stored as JSON next to the deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearWeights {
    pub gait: [f64; INPUT_SLOTS],
    pub gait_bias: f64,
    pub adherence: [f64; INPUT_SLOTS],
    pub adherence_bias: f64,
}

pub struct TwinModel {
    weights: LinearWeights,
}

impl TwinModel {
    pub fn from_weights(weights: LinearWeights) -> Self {
        Self { weights }
    }

    pub fn from_weights_file(path: &Path) -> Result<Self, PredictionUnavailable> {
        let text = std::fs::read_to_string(path).map_err(|e| PredictionUnavailable {
            reason: format!("reading {}: {e}", path.display()),
        })?;
        let weights: LinearWeights =
            serde_json::from_str(&text).map_err(|e| PredictionUnavailable {
                reason: format!("parsing {}: {e}", path.display()),
            })?;
        Ok(Self::from_weights(weights))
    }

    /// Fixed-order model input: the six feature slots with the scenario
    /// parameter appended.
    pub fn input_vector(features: &FeatureVector, scenario: Scenario) -> [f64; INPUT_SLOTS] {
        let slots = features.as_slots();
        [
            slots[0],
            slots[1],
            slots[2],
            slots[3],
            slots[4],
            slots[5],
            scenario.extra_minutes_balance,
        ]
    }

    pub fn predict(&self, features: &FeatureVector, scenario: Scenario) -> Prediction {
        let input = Self::input_vector(features, scenario);
        let gait = dot(&self.weights.gait, &input) + self.weights.gait_bias;
        let adherence = dot(&self.weights.adherence, &input) + self.weights.adherence_bias;
        Prediction {
            gait_speed_change_pct: gait.clamp(0.0, 100.0),
            adherence_score: adherence.clamp(0.0, 100.0),
        }
    }
}

fn dot(weights: &[f64; INPUT_SLOTS], input: &[f64; INPUT_SLOTS]) -> f64 {
    weights.iter().zip(input).map(|(w, x)| w * x).sum()
}

/// Deterministic fallback used when no regressor is available: the midpoint
/// of the legacy heuristic band (base 0.5), so
/// `gait_speed_change_pct = 25 + 2 * extra_minutes_balance` (clamped to
/// `[0, 100]`) and `adherence_score = 50`.
pub fn fallback_prediction(scenario: Scenario) -> Prediction {
    const BASE: f64 = 0.5;
    let effect = 0.02 * scenario.extra_minutes_balance;
    Prediction {
        gait_speed_change_pct: ((BASE * 50.0) + (effect * 100.0)).clamp(0.0, 100.0),
        adherence_score: BASE * 100.0,
    }
}

/// Predict with the model when one is loaded, otherwise fall back. Returns
/// whether the fallback was used so callers can label the result.
pub fn predict_with_fallback(
    model: Option<&TwinModel>,
    features: &FeatureVector,
    scenario: Scenario,
) -> (Prediction, bool) {
    match model {
        Some(model) => (model.predict(features, scenario), false),
        None => {
            warn!("no regressor loaded; using deterministic fallback");
            (fallback_prediction(scenario), true)
        }
    }
}
