/// Last-layer learning rules for spiking networks.
///
/// Both rules bypass ordinary backpropagation and touch only the final
/// layer located through the `FinalLayer` capability:
/// - `maml_soel`: gated error signal (SOEL). The cross-entropy error at the
///   spike output is passed through the two-sided threshold gate and used as
///   the upstream gradient of the final layer's drive `U`.
/// - `loihi_soel`: spike-count trace rule. Per sample and per time window the
///   target unit's spike count is compared against a target count and
///   corrections are written into a `LearningEngine`, whose accumulated
///   gradient is then added to the final weight.

use tracing::{debug, warn};

use crate::error::{MetaError, Result};
use crate::learning_engine::{LearningEngine, SoelTiming};
use crate::loss::{cross_entropy, Targets};
use crate::model::{FinalLayer, SpikeProbe};
use crate::params::{ParamMap, StepSize};
use crate::plasticity::{evaluate_inner, InnerContext, PlasticityRule, StepOutcome};
use crate::surrogate;
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// Error magnitude below which an output unit does not learn.
pub const DEFAULT_SOEL_THRESHOLD: f32 = 0.05;

fn classes_of<'a>(targets: &'a Targets, rule: &'static str) -> Result<&'a [usize]> {
    match targets {
        Targets::Classes(c) => Ok(c),
        other => Err(MetaError::UnsupportedTargets { rule, kind: other.kind_name() }),
    }
}

// ── Gradient-triggered SOEL ──────────────────────────────────────────

/// One SOEL update of the final layer from its drive `u` (`[batch, n_out]`).
///
/// `W' = W - step * dU/dW` with `dL/dS` gated as the upstream gradient; the
/// bias is updated the same way when `update_bias` is set. All other entries
/// of `params` pass through.
pub fn maml_soel<M: FinalLayer + ?Sized>(
    model: &M,
    tape: &mut Tape,
    u: BufId,
    classes: &[usize],
    params: &ParamMap,
    step_size: &StepSize,
    threshold: &[f32],
    update_bias: bool,
) -> Result<ParamMap> {
    let weight_name = model.final_weight_name();
    let bias_name = model.final_bias_name();

    // dL/dS at the (detached) spike output
    let spikes = surrogate::fast_sigmoid_forward(tape.data(u), &[surrogate::DEFAULT_SPIKE_THRESHOLD])
        .unwrap_or_default();
    let shape = tape.shape(u).to_vec();
    let s = tape.leaf(spikes, shape, true);
    let loss = cross_entropy(tape, s, classes)?;
    let dl_ds = tape.grad(loss, None, &[s], false)?[0]
        .ok_or(MetaError::MissingParameter("spike output".to_string()))?;

    let triggered = surrogate::threshold_surrogate(tape, dl_ds, threshold)?;
    let active = tape.data(triggered).iter().filter(|&&v| v != 0.0).count();
    debug!(trigger_rate = active as f32 / tape.numel(triggered).max(1) as f32, "soel error gate");

    let weight = params.require(&weight_name)?;
    let mut wrt = vec![weight];
    if update_bias {
        wrt.push(params.require(&bias_name)?);
    }
    let grads = tape.grad(u, Some(triggered), &wrt, false)?;

    let mut updated = ParamMap::new();
    for (name, &param) in params.iter() {
        let grad = if *name == weight_name {
            grads[0]
        } else if update_bias && *name == bias_name {
            grads[1]
        } else {
            updated.insert(name.clone(), param);
            continue;
        };
        let Some(grad) = grad else {
            warn!(param = %name, "grad is None");
            updated.insert(name.clone(), param);
            continue;
        };
        let step = step_size.for_param(name)?;
        let delta = tape.scale_by(step, grad)?;
        updated.insert(name.clone(), tape.sub(param, delta)?);
    }
    Ok(updated)
}

/// SOEL as an inner-loop rule.
#[derive(Clone, Debug)]
pub struct Soel {
    pub threshold: Vec<f32>,
    pub update_bias: bool,
}

impl Default for Soel {
    fn default() -> Self {
        Soel { threshold: vec![DEFAULT_SOEL_THRESHOLD], update_bias: false }
    }
}

impl<M: FinalLayer + ?Sized> PlasticityRule<M> for Soel {
    fn name(&self) -> &'static str {
        "maml_soel"
    }

    fn step(&mut self, model: &M, tape: &mut Tape, params: &ParamMap, ctx: &InnerContext<'_>) -> Result<StepOutcome> {
        let classes = classes_of(ctx.targets, "maml_soel")?;
        let (loss, accuracy) = tape.no_grad(|t| evaluate_inner(model, t, params, ctx))?;
        let u = model.forward_membrane(tape, params, ctx.inputs)?;
        let params = maml_soel(model, tape, u, classes, params, ctx.step_size, &self.threshold, self.update_bias)?;
        Ok(StepOutcome { params, loss: tape.scalar(loss), accuracy })
    }
}

// ── Spike-count trace rule ───────────────────────────────────────────

/// Drive `engine` with every sample, then return params with the final weight
/// replaced by `W + step * engine_gradient`. Everything else passes through.
pub fn loihi_soel<M: SpikeProbe + ?Sized, E: LearningEngine + ?Sized>(
    model: &M,
    tape: &mut Tape,
    inputs: &Tensor,
    classes: &[usize],
    params: &ParamMap,
    step_size: &StepSize,
    engine: &mut E,
    timing: &SoelTiming,
) -> Result<ParamMap> {
    timing.validate()?;
    if inputs.rows() != classes.len() {
        return Err(MetaError::ShapeMismatch {
            op: "loihi_soel",
            left: inputs.shape.clone(),
            right: vec![classes.len()],
        });
    }
    let window = timing.window_len();

    for (sample, &target) in classes.iter().enumerate() {
        let trace = model.probe(tape, params, &inputs.row(sample))?;
        if trace.time_steps != timing.time_steps {
            return Err(MetaError::TimingMismatch { expected: timing.time_steps, found: trace.time_steps });
        }
        if target >= trace.n_post {
            return Err(MetaError::ShapeMismatch {
                op: "loihi_soel target",
                left: vec![trace.n_post],
                right: vec![target],
            });
        }
        engine.observe(&trace)?;
        let post = engine.post_trace(target);

        let mut thresh = 0.0f32;
        for w in 0..timing.windows {
            let observed: f32 = post[w * window..(w + 1) * window].iter().sum();
            let err = timing.target_count - observed;
            if err != 0.0 && (err > thresh || err < -thresh) {
                engine.write_target(target, window * (w + 1) - 1, (timing.trace_offset + err).max(0.0));
                thresh += 1.0;
            } else if thresh > 0.0 {
                thresh -= 1.0;
            }
        }
    }

    let grad = engine.apply();
    let weight_name = model.final_weight_name();
    let weight = params.require(&weight_name)?;
    if grad.shape.as_slice() != tape.shape(weight) {
        return Err(MetaError::ShapeMismatch {
            op: "loihi_soel",
            left: tape.shape(weight).to_vec(),
            right: grad.shape,
        });
    }

    let mut updated = ParamMap::new();
    for (name, &param) in params.iter() {
        if *name != weight_name {
            updated.insert(name.clone(), param);
            continue;
        }
        let g = tape.tensor(&grad);
        let step = step_size.for_param(name)?;
        let delta = tape.scale_by(step, g)?;
        updated.insert(name.clone(), tape.add(param, delta)?);
    }
    Ok(updated)
}

/// Spike-count trace rule as an inner-loop rule. Owns its learning engine.
pub struct LoihiSoel<E> {
    pub engine: E,
    pub timing: SoelTiming,
}

impl<E: LearningEngine> LoihiSoel<E> {
    pub fn new(engine: E, timing: SoelTiming) -> Self {
        LoihiSoel { engine, timing }
    }
}

impl<M: SpikeProbe + ?Sized, E: LearningEngine> PlasticityRule<M> for LoihiSoel<E> {
    fn name(&self) -> &'static str {
        "loihi_soel"
    }

    fn step(&mut self, model: &M, tape: &mut Tape, params: &ParamMap, ctx: &InnerContext<'_>) -> Result<StepOutcome> {
        let classes = classes_of(ctx.targets, "loihi_soel")?;
        let (loss, accuracy) = tape.no_grad(|t| evaluate_inner(model, t, params, ctx))?;
        let params = loihi_soel(
            model, tape, ctx.inputs, classes, params, ctx.step_size, &mut self.engine, &self.timing,
        )?;
        Ok(StepOutcome { params, loss: tape.scalar(loss), accuracy })
    }
}
