/// On-chip learning-engine model for the spike-count trace rule.
///
/// The engine sees one sample at a time: it observes the final layer's
/// pre/post spike trains, accepts correction values written into its
/// per-unit correction trace, and on `apply()` hands back the accumulated
/// weight gradient `[n_post, n_pre]`.
///
/// `LoihiPlasticity` implements a reward-modulated rule in the style of the
/// Loihi plasticity processor: each correction written at time `t` for unit
/// `o` contributes
///   dw[o][i] += lr * (correction - offset) * rate_i(window ending at t)
/// where `rate_i` is the pre-synaptic spike rate over that window. A
/// correction equal to the offset is a no-op.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetaError, Result};
use crate::model::SpikeTrace;
use crate::tensor::{vec_norm_f32, Tensor};

/// Timing of the trace rule: `time_steps` split into `windows` equal windows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoelTiming {
    pub time_steps: usize,
    pub windows: usize,
    /// Desired spike count of the target unit per window.
    pub target_count: f32,
    /// Baseline of the correction trace; corrections are written as `offset + err`.
    pub trace_offset: f32,
}

impl Default for SoelTiming {
    fn default() -> Self {
        SoelTiming { time_steps: 100, windows: 5, target_count: 10.0, trace_offset: 20.0 }
    }
}

impl SoelTiming {
    pub fn window_len(&self) -> usize {
        self.time_steps / self.windows.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.windows == 0 || self.time_steps == 0 || self.time_steps % self.windows != 0 {
            return Err(MetaError::IncompatibleConfig("time_steps must split into a whole number of windows"));
        }
        Ok(())
    }
}

pub trait LearningEngine {
    /// Start a sample. Replaces the traces of the previous one.
    fn observe(&mut self, trace: &SpikeTrace) -> Result<()>;

    /// Observed post-synaptic spike train of `unit` for the current sample.
    fn post_trace(&self, unit: usize) -> Vec<f32>;

    /// Write `value` into the correction trace of `unit` at time `t`.
    fn write_target(&mut self, unit: usize, t: usize, value: f32);

    /// Weight gradient accumulated since the last call, `[n_post, n_pre]`.
    /// Resets the accumulator.
    fn apply(&mut self) -> Tensor;
}

#[derive(Clone, Debug)]
pub struct LoihiPlasticity {
    n_pre: usize,
    n_post: usize,
    window_len: usize,
    offset: f32,
    lr: f32,
    trace: Option<SpikeTrace>,
    /// `[n_post, time_steps]` correction trace of the current sample.
    correction: Vec<f32>,
    dw: Vec<f32>,
}

impl LoihiPlasticity {
    pub fn new(n_pre: usize, n_post: usize, timing: &SoelTiming, lr: f32) -> Self {
        LoihiPlasticity {
            n_pre,
            n_post,
            window_len: timing.window_len(),
            offset: timing.trace_offset,
            lr,
            trace: None,
            correction: Vec::new(),
            dw: vec![0.0; n_post * n_pre],
        }
    }

    /// Correction trace of `unit` for the current sample.
    pub fn correction_trace(&self, unit: usize) -> &[f32] {
        let t = self.time_steps();
        &self.correction[unit * t..(unit + 1) * t]
    }

    fn time_steps(&self) -> usize {
        self.trace.as_ref().map_or(0, |tr| tr.time_steps)
    }
}

impl LearningEngine for LoihiPlasticity {
    fn observe(&mut self, trace: &SpikeTrace) -> Result<()> {
        if trace.n_pre != self.n_pre || trace.n_post != self.n_post {
            return Err(MetaError::ShapeMismatch {
                op: "learning_engine",
                left: vec![self.n_post, self.n_pre],
                right: vec![trace.n_post, trace.n_pre],
            });
        }
        self.correction = vec![self.offset; self.n_post * trace.time_steps];
        self.trace = Some(trace.clone());
        Ok(())
    }

    fn post_trace(&self, unit: usize) -> Vec<f32> {
        match &self.trace {
            Some(tr) => (0..tr.time_steps).map(|t| tr.post_at(t)[unit]).collect(),
            None => Vec::new(),
        }
    }

    fn write_target(&mut self, unit: usize, t: usize, value: f32) {
        let Some(trace) = &self.trace else { return };
        let steps = trace.time_steps;
        self.correction[unit * steps + t] = value;

        let start = (t + 1).saturating_sub(self.window_len);
        let rates = trace.pre_rate(start, t + 1);
        let modulation = self.lr * (value - self.offset);
        for (i, r) in rates.iter().enumerate() {
            self.dw[unit * self.n_pre + i] += modulation * r;
        }
    }

    fn apply(&mut self) -> Tensor {
        let dw = std::mem::replace(&mut self.dw, vec![0.0; self.n_post * self.n_pre]);
        debug!(delta_norm = vec_norm_f32(&dw), "learning engine apply");
        Tensor::new(dw, vec![self.n_post, self.n_pre])
    }
}
