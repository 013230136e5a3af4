/// Inner-loop plasticity rules.
///
/// A rule maps (current parameter snapshot, task data) to a NEW snapshot on
/// the same tape. The persistent `ParamStore` is never touched; the outer loop
/// differentiates through whatever ops the rule recorded.
///
/// Gradient rules:
/// - `custom_sgd`: `p - step * grad`, with an optional custom weight update.
/// - `custom_sgd_reg`: gradient step, or a pull toward an anchor for
///   parameters that received no gradient.
///
/// Spike-based rules (`Soel`, `LoihiSoel`) live in `soel`.

use tracing::{debug, warn};

use crate::error::Result;
use crate::loss::{prediction_accuracy, LossKind, Targets};
use crate::model::MetaModule;
use crate::params::{ParamMap, StepSize};
use crate::tape::{BufId, Tape};
use crate::tensor::{vec_norm_f32, Tensor};

// ── Custom weight updates ────────────────────────────────────────────

/// Replacement update for weight tensors (names containing `weight`).
///
/// Returns the NEW weight, given its gradient, the current weight and the
/// step size that applies to it.
pub trait WeightUpdate {
    fn update(&self, tape: &mut Tape, grad: BufId, weight: BufId, step_size: BufId) -> Result<BufId>;
}

/// Gradient step followed by a clamp into a fixed weight range, e.g. the
/// representable range of an on-chip synapse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClampedStep {
    pub min: f32,
    pub max: f32,
}

impl WeightUpdate for ClampedStep {
    fn update(&self, tape: &mut Tape, grad: BufId, weight: BufId, step_size: BufId) -> Result<BufId> {
        let delta = tape.scale_by(step_size, grad)?;
        let stepped = tape.sub(weight, delta)?;
        Ok(tape.clamp(stepped, self.min, self.max))
    }
}

fn is_weight(name: &str) -> bool {
    name.contains("weight")
}

// ── Gradient step ────────────────────────────────────────────────────

/// Options of one `custom_sgd` call.
#[derive(Clone, Copy, Default)]
pub struct SgdOptions<'a> {
    /// Detach the gradients from the graph (first-order approximation).
    pub first_order: bool,
    pub custom_update: Option<&'a dyn WeightUpdate>,
    /// Log the per-element gradient norm of every parameter.
    pub save_graph: bool,
    /// Sample position within the adaptation stream, for diagnostics.
    pub sample_index: Option<usize>,
}

/// Report absent and all-zero gradients. Neither is an error.
fn report_gradients(tape: &Tape, params: &ParamMap, grads: &[Option<BufId>], sample_index: Option<usize>) {
    for ((name, _), grad) in params.iter().zip(grads.iter()) {
        match grad {
            None => warn!(param = %name, input = ?sample_index, "grad is None"),
            Some(g) if tape.data(*g).iter().all(|&v| v == 0.0) => {
                warn!(param = %name, input = ?sample_index, "grad is zero");
            }
            Some(_) => {}
        }
    }
}

fn log_grad_flow(tape: &Tape, params: &ParamMap, grads: &[Option<BufId>]) {
    if grads.iter().any(Option::is_none) {
        return;
    }
    for ((name, _), g) in params.iter().zip(grads.iter().flatten()) {
        let norm = vec_norm_f32(tape.data(*g)) / tape.numel(*g).max(1) as f32;
        debug!(param = %name, grad_norm_per_element = norm, "inner gradient flow");
    }
}

/// One gradient-descent step on `loss` for every parameter in `params`.
///
/// `params` must be the snapshot `loss` was computed against. To step the
/// model's own parameters, register them once with
/// `MetaModule::meta_named_parameters` and pass that map to both the forward
/// pass and this call; a second registration creates new leaves that `loss`
/// does not depend on, so every entry would pass through unchanged.
///
/// Output has exactly the keys of `params`. Parameters without a gradient
/// pass through unchanged. With `first_order` the gradients are detached, so
/// the update is linked to the outer graph only through `params` itself.
pub fn custom_sgd(
    tape: &mut Tape,
    loss: BufId,
    params: &ParamMap,
    step_size: &StepSize,
    opts: &SgdOptions<'_>,
) -> Result<ParamMap> {
    let grads = tape.grad(loss, None, &params.ids(), !opts.first_order)?;
    report_gradients(tape, params, &grads, opts.sample_index);
    if opts.save_graph {
        log_grad_flow(tape, params, &grads);
    }

    let mut updated = ParamMap::new();
    for ((name, &param), grad) in params.iter().zip(grads.into_iter()) {
        let Some(grad) = grad else {
            updated.insert(name.clone(), param);
            continue;
        };
        let step = step_size.for_param(name)?;
        let new_param = match opts.custom_update {
            Some(custom) if is_weight(name) => custom.update(tape, grad, param, step)?,
            _ => {
                let delta = tape.scale_by(step, grad)?;
                tape.sub(param, delta)?
            }
        };
        updated.insert(name.clone(), new_param);
    }
    Ok(updated)
}

// ── Anchor-regularized step ──────────────────────────────────────────

/// Gradient step where a gradient exists, otherwise
/// `p - step * lambda * (p - anchor)`. The two terms never combine.
///
/// Always records the backward graph. Returns the updated snapshot and the
/// raw gradients (aligned with `params`).
pub fn custom_sgd_reg(
    tape: &mut Tape,
    loss: BufId,
    params: &ParamMap,
    step_size: &StepSize,
    anchor: &ParamMap,
    lambda: f32,
) -> Result<(ParamMap, Vec<Option<BufId>>)> {
    let grads = tape.grad(loss, None, &params.ids(), true)?;

    let mut updated = ParamMap::new();
    for ((name, &param), grad) in params.iter().zip(grads.iter()) {
        let step = step_size.for_param(name)?;
        let new_param = match grad {
            Some(g) => {
                let delta = tape.scale_by(step, *g)?;
                tape.sub(param, delta)?
            }
            None => {
                let a = anchor.require(name)?;
                let diff = tape.sub(param, a)?;
                let pull = tape.scale(diff, lambda);
                let delta = tape.scale_by(step, pull)?;
                tape.sub(param, delta)?
            }
        };
        updated.insert(name.clone(), new_param);
    }
    Ok((updated, grads))
}

// ── Rules as used by the meta-learner ────────────────────────────────

/// Per-call context handed to a plasticity rule.
#[derive(Clone, Copy)]
pub struct InnerContext<'a> {
    pub inputs: &'a Tensor,
    pub targets: &'a Targets,
    pub loss: LossKind,
    pub step_size: &'a StepSize,
    pub first_order: bool,
    /// Parameters at the start of adaptation for this task.
    pub anchor: &'a ParamMap,
    pub sample_index: Option<usize>,
    pub save_graph: bool,
}

/// Result of one rule application.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub params: ParamMap,
    /// Inner loss before the update.
    pub loss: f32,
    /// Inner accuracy before the update (classification only).
    pub accuracy: Option<f32>,
}

pub trait PlasticityRule<M: ?Sized> {
    fn name(&self) -> &'static str;

    fn step(&mut self, model: &M, tape: &mut Tape, params: &ParamMap, ctx: &InnerContext<'_>) -> Result<StepOutcome>;
}

/// Forward + loss on the context's data. Returns the loss node and accuracy.
pub fn evaluate_inner<M: MetaModule + ?Sized>(
    model: &M,
    tape: &mut Tape,
    params: &ParamMap,
    ctx: &InnerContext<'_>,
) -> Result<(BufId, Option<f32>)> {
    let logits = model.forward(tape, params, ctx.inputs)?;
    let loss = ctx.loss.compute(tape, logits, ctx.targets)?;
    let accuracy = match ctx.targets {
        Targets::Classes(classes) => {
            let predicted = tape.no_grad(|t| model.predict(t, params, ctx.inputs, logits))?;
            Some(prediction_accuracy(&predicted, classes))
        }
        Targets::Values(_) => None,
    };
    Ok((loss, accuracy))
}

/// Plain gradient step (`custom_sgd`).
#[derive(Default)]
pub struct GradientStep {
    pub custom_update: Option<Box<dyn WeightUpdate>>,
}

impl GradientStep {
    pub fn new() -> Self {
        GradientStep { custom_update: None }
    }

    pub fn with_update(update: impl WeightUpdate + 'static) -> Self {
        GradientStep { custom_update: Some(Box::new(update)) }
    }
}

impl<M: MetaModule + ?Sized> PlasticityRule<M> for GradientStep {
    fn name(&self) -> &'static str {
        "gradient_step"
    }

    fn step(&mut self, model: &M, tape: &mut Tape, params: &ParamMap, ctx: &InnerContext<'_>) -> Result<StepOutcome> {
        let (loss, accuracy) = evaluate_inner(model, tape, params, ctx)?;
        let opts = SgdOptions {
            first_order: ctx.first_order,
            custom_update: self.custom_update.as_deref(),
            save_graph: ctx.save_graph,
            sample_index: ctx.sample_index,
        };
        let params = custom_sgd(tape, loss, params, ctx.step_size, &opts)?;
        Ok(StepOutcome { params, loss: tape.scalar(loss), accuracy })
    }
}

/// Anchor-regularized step (`custom_sgd_reg`), anchored at the task's
/// starting parameters.
#[derive(Clone, Copy, Debug)]
pub struct AnchorRegularized {
    pub lambda: f32,
}

impl Default for AnchorRegularized {
    fn default() -> Self {
        AnchorRegularized { lambda: 1.0 }
    }
}

impl<M: MetaModule + ?Sized> PlasticityRule<M> for AnchorRegularized {
    fn name(&self) -> &'static str {
        "anchor_regularized"
    }

    fn step(&mut self, model: &M, tape: &mut Tape, params: &ParamMap, ctx: &InnerContext<'_>) -> Result<StepOutcome> {
        let (loss, accuracy) = evaluate_inner(model, tape, params, ctx)?;
        let (params, _) = custom_sgd_reg(tape, loss, params, ctx.step_size, ctx.anchor, self.lambda)?;
        Ok(StepOutcome { params, loss: tape.scalar(loss), accuracy })
    }
}
