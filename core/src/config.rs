/// Meta-learner configuration.
///
/// Immutable after the meta-learner is built. Every field has a default, so a
/// JSON document only needs the fields it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::loss::LossKind;
use crate::quantize::QuantizerKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaLearnerConfig {
    /// Inner-loop step size (initial value when learned).
    pub step_size: f32,
    /// Detach inner-loop gradients (FOMAML).
    pub first_order: bool,
    /// Meta-learn the step size alongside the parameters (Meta-SGD).
    pub learn_step_size: bool,
    /// One step size per parameter instead of a shared one.
    pub per_param_step_size: bool,
    pub num_adaptation_steps: usize,
    /// Samples drawn (without replacement) per adaptation step; all if `None`.
    pub num_adaptation_samples: Option<usize>,
    /// Freeze the head during adaptation: zero step size for the last two
    /// parameters. Incompatible with `learn_step_size`.
    pub boil: bool,
    /// One rule call per sample instead of one per drawn subset.
    pub stream_mode: bool,
    /// Log per-parameter inner gradient norms.
    pub save_graph: bool,
    /// Seed of the adaptation sample selection.
    pub seed: u64,
    pub loss: LossKind,
    /// Applied to the meta-parameters when adaptation starts.
    pub outer_loop_quantizer: Option<QuantizerKind>,
    /// Applied after every inner update.
    pub inner_loop_quantizer: Option<QuantizerKind>,
}

impl Default for MetaLearnerConfig {
    fn default() -> Self {
        MetaLearnerConfig {
            step_size: 0.1,
            first_order: false,
            learn_step_size: false,
            per_param_step_size: false,
            num_adaptation_steps: 1,
            num_adaptation_samples: None,
            boil: false,
            stream_mode: true,
            save_graph: false,
            seed: 0,
            loss: LossKind::CrossEntropy,
            outer_loop_quantizer: None,
            inner_loop_quantizer: None,
        }
    }
}

impl MetaLearnerConfig {
    /// Test configuration: batched adaptation, one step, fixed seed.
    pub fn test_config() -> Self {
        MetaLearnerConfig {
            stream_mode: false,
            seed: 42,
            ..MetaLearnerConfig::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: MetaLearnerConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.boil && self.learn_step_size {
            return Err(MetaError::IncompatibleConfig("boil is not compatible with learning step sizes"));
        }
        if self.step_size < 0.0 {
            return Err(MetaError::IncompatibleConfig("step_size must be non-negative"));
        }
        if self.num_adaptation_samples == Some(0) {
            return Err(MetaError::IncompatibleConfig("num_adaptation_samples must be positive"));
        }
        for q in self.outer_loop_quantizer.iter().chain(self.inner_loop_quantizer.iter()) {
            q.validate()?;
        }
        Ok(())
    }

    /// Per-parameter step sizes are needed for either flag.
    pub fn uses_per_param_step_size(&self) -> bool {
        self.per_param_step_size || self.boil
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = MetaLearnerConfig::from_json_str(r#"{"step_size": 0.4, "first_order": true}"#).unwrap();
        assert_eq!(cfg.step_size, 0.4);
        assert!(cfg.first_order);
        assert_eq!(cfg.num_adaptation_steps, 1);
        assert!(cfg.stream_mode);
    }

    #[test]
    fn test_boil_with_learned_step_rejected() {
        let r = MetaLearnerConfig::from_json_str(r#"{"boil": true, "learn_step_size": true}"#);
        assert!(matches!(r, Err(MetaError::IncompatibleConfig(_))));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(MetaLearnerConfig::from_json_str("{not json"), Err(MetaError::Config(_))));
    }
}
