/// Parameter quantization hooks.
///
/// A quantizer maps a parameter snapshot to a reduced-precision snapshot,
/// approximating hardware that stores weights at low precision. Values are
/// rounded in the forward direction only: each quantized entry is recorded as
/// `TapeOp::StraightThrough`, so gradients flow to the full-precision input
/// unchanged.
///
/// The meta-learner applies one quantizer after reading the meta-parameters
/// (outer loop) and optionally another after every inner update.

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::params::ParamMap;
use crate::tape::Tape;

// ── bf16 rounding ────────────────────────────────────────────────────

/// f32 → bf16 bits (1 sign, 8 exponent, 7 mantissa), round to nearest even.
#[inline]
pub fn f32_to_bf16(x: f32) -> u16 {
    let bits = x.to_bits();
    if x.is_nan() {
        // quiet NaN, sign preserved; rounding could otherwise carry into inf
        return (((bits >> 16) & 0x8000) | 0x7FC0) as u16;
    }
    let rounded = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
    (rounded >> 16) as u16
}

/// bf16 bits → f32 (low mantissa bits zero).
#[inline]
pub fn bf16_to_f32(x: u16) -> f32 {
    f32::from_bits((x as u32) << 16)
}

// ── Quantizers ───────────────────────────────────────────────────────

pub trait Quantizer {
    /// Rounded copy of `data`.
    fn quantize_values(&self, data: &[f32]) -> Vec<f32>;

    /// Quantize every entry of `params` with straight-through gradients.
    fn quantize(&self, tape: &mut Tape, params: &ParamMap) -> Result<ParamMap> {
        let mut out = ParamMap::new();
        for (name, &id) in params.iter() {
            let values = self.quantize_values(tape.data(id));
            out.insert(name.clone(), tape.straight_through(id, values)?);
        }
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bf16Quantizer;

impl Quantizer for Bf16Quantizer {
    fn quantize_values(&self, data: &[f32]) -> Vec<f32> {
        data.iter().map(|&x| bf16_to_f32(f32_to_bf16(x))).collect()
    }
}

/// Symmetric fixed point: `bits` signed bits covering `[-range, range]`.
/// Out-of-range values saturate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedPointQuantizer {
    pub bits: u32,
    pub range: f32,
}

impl FixedPointQuantizer {
    /// `bits` in 2..=32 and a finite `range > 0`.
    pub fn new(bits: u32, range: f32) -> Result<Self> {
        let q = FixedPointQuantizer { bits, range };
        q.validate()?;
        Ok(q)
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=32).contains(&self.bits) {
            return Err(MetaError::IncompatibleConfig("fixed-point quantizer needs 2 to 32 bits"));
        }
        if !(self.range.is_finite() && self.range > 0.0) {
            return Err(MetaError::IncompatibleConfig("fixed-point quantizer range must be finite and positive"));
        }
        Ok(())
    }

    pub fn step(&self) -> f32 {
        let levels = ((1u64 << self.bits.clamp(2, 32).saturating_sub(1)) - 1) as f32;
        self.range / levels
    }
}

impl Quantizer for FixedPointQuantizer {
    fn quantize_values(&self, data: &[f32]) -> Vec<f32> {
        let step = self.step();
        data.iter()
            // max/min instead of clamp: an unchecked range must not panic
            .map(|&x| (x.max(-self.range).min(self.range) / step).round() * step)
            .collect()
    }
}

/// Serializable quantizer selection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantizerKind {
    Bf16,
    FixedPoint { bits: u32, range: f32 },
}

impl QuantizerKind {
    pub fn validate(&self) -> Result<()> {
        match *self {
            QuantizerKind::Bf16 => Ok(()),
            QuantizerKind::FixedPoint { bits, range } => FixedPointQuantizer { bits, range }.validate(),
        }
    }

    pub fn build(self) -> Box<dyn Quantizer> {
        match self {
            QuantizerKind::Bf16 => Box::new(Bf16Quantizer),
            QuantizerKind::FixedPoint { bits, range } => Box::new(FixedPointQuantizer { bits, range }),
        }
    }
}
