/// Model interface consumed by the meta-learner and the plasticity rules.
///
/// A model owns its persistent parameters (`ParamStore`) and runs a
/// functional forward pass against any `ParamMap` snapshot, so the inner
/// loop can evaluate adapted parameters without touching the store.
///
/// Capabilities beyond the base trait are separate traits:
/// - `FinalLayer`: locate the last trainable layer and expose its
///   pre-threshold drive (SOEL).
/// - `SpikeProbe`: replay one sample without gradient tracking and return
///   the last layer's spike trains (learning-engine rules).

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::loss::undo_onehot;
use crate::params::{ParamMap, ParamStore};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// Training vs. evaluation, threaded explicitly through every call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

pub trait MetaModule {
    fn params(&self) -> &ParamStore;

    fn params_mut(&mut self) -> &mut ParamStore;

    /// Forward pass against an explicit parameter snapshot. Returns logits
    /// (or regression outputs) of shape `[batch, outputs]`.
    fn forward(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId>;

    fn zero_grad(&mut self) {
        self.params_mut().zero_grad();
    }

    /// Register the persistent parameters on `tape` as differentiable leaves.
    fn meta_named_parameters(&self, tape: &mut Tape) -> ParamMap {
        self.params().register(tape)
    }

    /// Class index per input row, given the `logits` this model produced for
    /// `input`. Defaults to the row argmax; spiking models may decode from
    /// spike timing instead.
    fn predict(&self, tape: &mut Tape, _params: &ParamMap, _input: &Tensor, logits: BufId) -> Result<Vec<usize>> {
        Ok(undo_onehot(&tape.to_tensor(logits)))
    }

    /// Forward pass with the model's own stored parameters.
    fn forward_stored(&self, tape: &mut Tape, input: &Tensor) -> Result<BufId> {
        let params = self.meta_named_parameters(tape);
        self.forward(tape, &params, input)
    }
}

pub trait FinalLayer: MetaModule {
    fn final_weight_name(&self) -> String;

    fn final_bias_name(&self) -> String;

    /// Pre-threshold drive `U` of the final layer, `[batch, n_out]`.
    fn forward_membrane(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId>;
}

/// Pre/post spike trains of the final layer for one sample.
#[derive(Clone, Debug, PartialEq)]
pub struct SpikeTrace {
    pub time_steps: usize,
    pub n_pre: usize,
    pub n_post: usize,
    /// `[time_steps, n_pre]`, row-major.
    pub pre: Vec<f32>,
    /// `[time_steps, n_post]`, row-major.
    pub post: Vec<f32>,
}

impl SpikeTrace {
    pub fn pre_at(&self, t: usize) -> &[f32] {
        &self.pre[t * self.n_pre..(t + 1) * self.n_pre]
    }

    pub fn post_at(&self, t: usize) -> &[f32] {
        &self.post[t * self.n_post..(t + 1) * self.n_post]
    }

    /// Spikes of post unit `unit` over time steps `[start, end)`.
    pub fn post_count(&self, unit: usize, start: usize, end: usize) -> f32 {
        (start..end).map(|t| self.post[t * self.n_post + unit]).sum()
    }

    /// Mean activity of each pre unit over `[start, end)`.
    pub fn pre_rate(&self, start: usize, end: usize) -> Vec<f32> {
        let span = end.saturating_sub(start).max(1) as f32;
        (0..self.n_pre)
            .map(|i| (start..end).map(|t| self.pre[t * self.n_pre + i]).sum::<f32>() / span)
            .collect()
    }
}

pub trait SpikeProbe: FinalLayer {
    /// Run one sample (`[1, ...]`) without gradient tracking.
    fn probe(&self, tape: &mut Tape, params: &ParamMap, sample: &Tensor) -> Result<SpikeTrace>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spike_trace_counts_and_rates() {
        let trace = SpikeTrace {
            time_steps: 4,
            n_pre: 2,
            n_post: 1,
            pre: vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            post: vec![0.0, 1.0, 1.0, 1.0],
        };
        assert_eq!(trace.post_count(0, 0, 4), 3.0);
        assert_eq!(trace.post_count(0, 0, 2), 1.0);
        assert_eq!(trace.pre_rate(0, 4), vec![0.75, 0.5]);
        assert_eq!(trace.pre_at(2), &[0.0, 1.0]);
    }

    #[test]
    fn test_mode_default_is_train() {
        assert!(Mode::default().is_train());
        assert!(!Mode::Eval.is_train());
    }
}
