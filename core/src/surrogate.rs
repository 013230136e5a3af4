/// Surrogate-gradient activation functions for spiking units.
///
/// Each function pairs a hard, non-differentiable forward value with a custom
/// backward rule. The tape records them as `TapeOp::FastSigmoid` and
/// `TapeOp::ThresholdSurrogate`; the slice kernels here compute both halves.
///
/// Thresholds are either a single value (shared by all elements) or one value
/// per element. Any other length is reported as `None` by the kernels and
/// surfaces from the tape as `MetaError::ShapeMismatch`.

use crate::error::Result;
use crate::tape::{BufId, Tape};

/// Default firing threshold of the fast-sigmoid step.
pub const DEFAULT_SPIKE_THRESHOLD: f32 = 0.0;

/// Steepness of the fast-sigmoid surrogate derivative.
pub const SURROGATE_SLOPE: f32 = 10.0;

#[inline]
fn threshold_at(threshold: &[f32], i: usize) -> f32 {
    if threshold.len() == 1 { threshold[0] } else { threshold[i] }
}

fn broadcastable(x: &[f32], threshold: &[f32]) -> bool {
    threshold.len() == 1 || threshold.len() == x.len()
}

// ── Fast-sigmoid step ────────────────────────────────────────────────

/// Forward: `1[x > th]`. A hard indicator, not a smooth sigmoid.
pub fn fast_sigmoid_forward(x: &[f32], threshold: &[f32]) -> Option<Vec<f32>> {
    if !broadcastable(x, threshold) {
        return None;
    }
    Some(x.iter().enumerate()
        .map(|(i, &v)| if v > threshold_at(threshold, i) { 1.0 } else { 0.0 })
        .collect())
}

/// Backward scale: `1 / (10|x| + 1)^2`. Independent of the threshold.
#[inline]
pub fn fast_sigmoid_grad_scale(x: f32) -> f32 {
    let d = SURROGATE_SLOPE * x.abs() + 1.0;
    1.0 / (d * d)
}

// ── Two-sided threshold surrogate ────────────────────────────────────

/// Gate mask `1[x > th] + 1[x < -th]`. Also the backward "gradient".
pub fn threshold_gate(x: &[f32], threshold: &[f32]) -> Option<Vec<f32>> {
    if !broadcastable(x, threshold) {
        return None;
    }
    Some(x.iter().enumerate()
        .map(|(i, &v)| {
            let th = threshold_at(threshold, i);
            let above = if v > th { 1.0 } else { 0.0 };
            let below = if v < -th { 1.0 } else { 0.0 };
            above + below
        })
        .collect())
}

/// Forward: `x * gate(x)`. Zero inside the dead zone `[-th, th]`.
pub fn threshold_surrogate_forward(x: &[f32], threshold: &[f32]) -> Option<Vec<f32>> {
    let gate = threshold_gate(x, threshold)?;
    Some(x.iter().zip(gate.iter()).map(|(&v, &m)| v * m).collect())
}

// ── Tape-level entry points ──────────────────────────────────────────

/// Spike nonlinearity with the fast-sigmoid surrogate derivative.
pub fn fast_sigmoid(tape: &mut Tape, input: BufId, threshold: &[f32]) -> Result<BufId> {
    tape.fast_sigmoid(input, threshold)
}

/// Two-sided learning-signal gate. Backward ignores the upstream gradient.
pub fn threshold_surrogate(tape: &mut Tape, input: BufId, threshold: &[f32]) -> Result<BufId> {
    tape.threshold_surrogate(input, threshold)
}
