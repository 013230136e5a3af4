/// Model-Agnostic Meta-Learning orchestrator (MAML / FOMAML / Meta-SGD).
///
/// One batch of tasks per outer step. For each task:
///   1. evaluate the test split with the meta-parameters ("before"),
///   2. adapt on the train split with the plasticity rule,
///   3. evaluate the test split with the adapted parameters ("after"),
///      which contributes the task's outer loss.
/// The mean outer loss is differentiated back to the meta-parameters (and the
/// learned step sizes) and the outer optimizer applies one step.
///
/// Every batch runs on a fresh tape. The meta-parameters are registered once
/// per batch, so all tasks share the same leaves and their contributions
/// accumulate in the outer gradient. In full-order mode the inner-loop
/// gradients are themselves recorded, so the outer gradient flows through
/// every adaptation step.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MetaLearnerConfig;
use crate::error::{MetaError, Result};
use crate::loss::{prediction_accuracy, Targets};
use crate::model::{MetaModule, Mode};
use crate::optimizer::{Optimizer, ParamGroup};
use crate::params::{ParamMap, StepSize, StepSizeStore, SHARED_STEP_SIZE};
use crate::plasticity::{InnerContext, PlasticityRule};
use crate::quantize::Quantizer;
use crate::scheduler::Scheduler;
use crate::tape::{BufId, Tape};
use crate::task::{TaskBatch, TaskSplit};

// ── Results ──────────────────────────────────────────────────────────

/// Per-batch results of `get_outer_loss`.
#[derive(Clone, Debug, Serialize)]
pub struct OuterLossResults {
    pub num_tasks: usize,
    /// `[num_adaptation_steps][num_tasks]`
    pub inner_losses: Vec<Vec<f32>>,
    /// `[num_tasks]`
    pub outer_losses: Vec<f32>,
    pub mean_outer_loss: f32,
    /// Classification batches only.
    pub accuracies_before: Option<Vec<f32>>,
    pub accuracies_after: Option<Vec<f32>>,
}

/// Adaptation trajectory of one task.
#[derive(Clone, Debug, Serialize)]
pub struct AdaptationResults {
    /// One entry per adaptation step (mean over samples in stream mode).
    pub inner_losses: Vec<f32>,
    pub inner_accuracies: Vec<Option<f32>>,
}

/// Running means over several batches.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MeanResults {
    pub num_batches: usize,
    pub mean_outer_loss: f32,
    pub accuracies_before: Option<f32>,
    pub accuracies_after: Option<f32>,
}

impl MeanResults {
    fn update(&mut self, r: &OuterLossResults) {
        self.num_batches += 1;
        let n = self.num_batches as f32;
        self.mean_outer_loss += (r.mean_outer_loss - self.mean_outer_loss) / n;
        let running = |acc: &mut Option<f32>, batch: &Option<Vec<f32>>| {
            if let Some(values) = batch {
                let m = mean(values);
                let cur = acc.get_or_insert(0.0);
                *cur += (m - *cur) / n;
            }
        };
        running(&mut self.accuracies_before, &r.accuracies_before);
        running(&mut self.accuracies_after, &r.accuracies_after);
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Outer loss of one batch, with the tape handles needed to differentiate it.
pub struct OuterLoss {
    pub mean_outer_loss: BufId,
    /// Meta-parameters as registered on the tape.
    pub params: ParamMap,
    pub step_size: StepSize,
    pub results: OuterLossResults,
}

// ── Meta-learner ─────────────────────────────────────────────────────

type OuterUpdateFn<M> = Box<dyn FnMut(&mut M)>;

pub struct MetaLearner<M, R> {
    model: M,
    rule: R,
    config: MetaLearnerConfig,
    optimizer: Option<Box<dyn Optimizer>>,
    scheduler: Option<Box<dyn Scheduler>>,
    step_sizes: StepSizeStore,
    outer_quantizer: Option<Box<dyn Quantizer>>,
    inner_quantizer: Option<Box<dyn Quantizer>>,
    custom_outer_update: Option<OuterUpdateFn<M>>,
    rng: StdRng,
}

impl<M: MetaModule, R: PlasticityRule<M>> MetaLearner<M, R> {
    /// `optimizer` may be `None` for evaluation-only use.
    pub fn new(
        model: M,
        rule: R,
        config: MetaLearnerConfig,
        mut optimizer: Option<Box<dyn Optimizer>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut step_sizes = if config.uses_per_param_step_size() {
            StepSizeStore::per_param(model.params().names(), config.step_size, config.learn_step_size)
        } else {
            StepSizeStore::scalar(config.step_size, config.learn_step_size)
        };
        if config.boil {
            // last two entries: the head's weight and bias
            step_sizes.zero_last(2);
        }

        if config.learn_step_size {
            if let Some(opt) = optimizer.as_mut() {
                opt.add_param_group(ParamGroup::StepSize, None);
            }
        }

        Ok(MetaLearner {
            rng: StdRng::seed_from_u64(config.seed),
            outer_quantizer: config.outer_loop_quantizer.map(|q| q.build()),
            inner_quantizer: config.inner_loop_quantizer.map(|q| q.build()),
            model,
            rule,
            config,
            optimizer,
            scheduler: None,
            step_sizes,
            custom_outer_update: None,
        })
    }

    /// First-order MAML: inner-loop gradients are always detached.
    pub fn fomaml(
        model: M,
        rule: R,
        mut config: MetaLearnerConfig,
        optimizer: Option<Box<dyn Optimizer>>,
    ) -> Result<Self> {
        config.first_order = true;
        Self::new(model, rule, config, optimizer)
    }

    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Hook run on the model after the outer gradient is computed and before
    /// the optimizer step (e.g. gradient clipping or weight clamping).
    pub fn with_outer_update(mut self, f: impl FnMut(&mut M) + 'static) -> Self {
        self.custom_outer_update = Some(Box::new(f));
        self
    }

    pub fn with_outer_quantizer(mut self, q: impl Quantizer + 'static) -> Self {
        self.outer_quantizer = Some(Box::new(q));
        self
    }

    pub fn with_inner_quantizer(mut self, q: impl Quantizer + 'static) -> Self {
        self.inner_quantizer = Some(Box::new(q));
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    pub fn config(&self) -> &MetaLearnerConfig {
        &self.config
    }

    pub fn step_sizes(&self) -> &StepSizeStore {
        &self.step_sizes
    }

    pub fn step_sizes_mut(&mut self) -> &mut StepSizeStore {
        &mut self.step_sizes
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    // ── Outer loss ───────────────────────────────────────────────

    /// Run before/adapt/after for every task of `batch` on `tape`.
    pub fn get_outer_loss(&mut self, tape: &mut Tape, batch: &TaskBatch, mode: Mode) -> Result<OuterLoss> {
        let classification = batch.validate()?;
        let num_tasks = batch.num_tasks();
        let steps = self.config.num_adaptation_steps;

        let params = self.model.meta_named_parameters(tape);
        let step_size = self.step_sizes.register(tape);

        let mut results = OuterLossResults {
            num_tasks,
            inner_losses: vec![vec![0.0; num_tasks]; steps],
            outer_losses: vec![0.0; num_tasks],
            mean_outer_loss: 0.0,
            accuracies_before: classification.then(|| vec![0.0; num_tasks]),
            accuracies_after: classification.then(|| vec![0.0; num_tasks]),
        };

        let mut total: Option<BufId> = None;
        for (task, (train, test)) in batch.train.iter().zip(batch.test.iter()).enumerate() {
            // Before adaptation
            if let Some(acc) = results.accuracies_before.as_mut() {
                acc[task] = tape.no_grad(|t| -> Result<f32> {
                    let logits = self.model.forward(t, &params, &test.inputs)?;
                    task_accuracy(&self.model, t, &params, logits, test)
                })?;
            }

            let (adapted, adaptation) = self.adapt(tape, &params, &step_size, train, mode)?;
            for (step, loss) in adaptation.inner_losses.iter().enumerate() {
                results.inner_losses[step][task] = *loss;
            }

            // After adaptation: the outer loss is recorded only when training.
            let prev = tape.set_grad_enabled(mode.is_train());
            let evaluated = self.model.forward(tape, &adapted, &test.inputs).and_then(|logits| {
                let loss = self.config.loss.compute(tape, logits, &test.targets)?;
                Ok((logits, loss))
            });
            tape.set_grad_enabled(prev);
            let (logits, outer_loss) = evaluated?;

            results.outer_losses[task] = tape.scalar(outer_loss);
            total = Some(match total {
                Some(t) => tape.add(t, outer_loss)?,
                None => outer_loss,
            });
            if let Some(acc) = results.accuracies_after.as_mut() {
                acc[task] = tape.no_grad(|t| task_accuracy(&self.model, t, &adapted, logits, test))?;
            }
            debug!(
                task,
                outer_loss = results.outer_losses[task],
                acc_before = ?results.accuracies_before.as_ref().map(|a| a[task]),
                acc_after = ?results.accuracies_after.as_ref().map(|a| a[task]),
                "task adapted"
            );
        }

        let total = total.ok_or(MetaError::EmptyBatch)?;
        let mean_outer_loss = tape.scale(total, 1.0 / num_tasks as f32);
        results.mean_outer_loss = tape.scalar(mean_outer_loss);

        Ok(OuterLoss { mean_outer_loss, params, step_size, results })
    }

    // ── Inner loop ───────────────────────────────────────────────

    /// Adapt `params` to one task's training split.
    ///
    /// Each step draws `num_adaptation_samples` indices without replacement
    /// (all samples when unset). Stream mode applies the rule once per drawn
    /// sample; batched mode once per drawn subset. Gradients are detached in
    /// evaluation mode and when `first_order` is configured.
    pub fn adapt(
        &mut self,
        tape: &mut Tape,
        params: &ParamMap,
        step_size: &StepSize,
        split: &TaskSplit,
        mode: Mode,
    ) -> Result<(ParamMap, AdaptationResults)> {
        let n = split.len();
        if n == 0 {
            return Err(MetaError::EmptyBatch);
        }
        let first_order = !mode.is_train() || self.config.first_order;
        let n_samples = self.config.num_adaptation_samples.unwrap_or(n).min(n);

        let mut params = match &self.outer_quantizer {
            Some(q) => q.quantize(tape, params)?,
            None => params.clone(),
        };
        let anchor = params.clone();

        let steps = self.config.num_adaptation_steps;
        let mut results = AdaptationResults {
            inner_losses: Vec::with_capacity(steps),
            inner_accuracies: Vec::with_capacity(steps),
        };

        for step in 0..steps {
            let indices = rand::seq::index::sample(&mut self.rng, n, n_samples).into_vec();
            let calls: Vec<(Option<usize>, TaskSplit)> = if self.config.stream_mode {
                indices.iter().enumerate().map(|(i, &idx)| (Some(i), split.select(&[idx]))).collect()
            } else {
                vec![(None, split.select(&indices))]
            };

            let mut losses = Vec::with_capacity(calls.len());
            let mut accuracies = Vec::with_capacity(calls.len());
            for (sample_index, data) in &calls {
                let ctx = InnerContext {
                    inputs: &data.inputs,
                    targets: &data.targets,
                    loss: self.config.loss,
                    step_size,
                    first_order,
                    anchor: &anchor,
                    sample_index: *sample_index,
                    save_graph: self.config.save_graph,
                };
                let outcome = self.rule.step(&self.model, tape, &params, &ctx)?;
                params = match &self.inner_quantizer {
                    Some(q) => q.quantize(tape, &outcome.params)?,
                    None => outcome.params,
                };
                losses.push(outcome.loss);
                if let Some(acc) = outcome.accuracy {
                    accuracies.push(acc);
                }
            }

            let step_loss = mean(&losses);
            let step_acc = (!accuracies.is_empty()).then(|| mean(&accuracies));
            debug!(step, inner_loss = step_loss, inner_acc = ?step_acc, rule = self.rule.name(), "adaptation step");
            results.inner_losses.push(step_loss);
            results.inner_accuracies.push(step_acc);
        }

        Ok((params, results))
    }

    // ── Training ─────────────────────────────────────────────────

    /// One outer update on `batch`.
    pub fn train_batch(&mut self, batch: &TaskBatch) -> Result<OuterLossResults> {
        if self.optimizer.is_none() {
            return Err(MetaError::MissingOptimizer);
        }
        self.model.zero_grad();
        self.step_sizes.params_mut().zero_grad();

        let mut tape = Tape::new();
        let outer = self.get_outer_loss(&mut tape, batch, Mode::Train)?;

        let mut wrt = outer.params.ids();
        let learn_step = self.step_sizes.is_learnable();
        let step_names: Vec<(String, BufId)> = match &outer.step_size {
            StepSize::Scalar(id) => vec![(SHARED_STEP_SIZE.to_string(), *id)],
            StepSize::PerParam(map) => map.iter().map(|(k, &v)| (k.clone(), v)).collect(),
        };
        if learn_step {
            wrt.extend(step_names.iter().map(|(_, id)| *id));
        }
        let grads = tape.grad(outer.mean_outer_loss, None, &wrt, false)?;

        let (model_grads, step_grads) = grads.split_at(outer.params.len());
        for ((name, _), grad) in outer.params.iter().zip(model_grads.iter()) {
            if let Some(g) = grad {
                self.model.params_mut().accumulate_grad(name, tape.data(*g))?;
            }
        }
        for ((name, _), grad) in step_names.iter().zip(step_grads.iter()) {
            if let Some(g) = grad {
                self.step_sizes.params_mut().accumulate_grad(name, tape.data(*g))?;
            }
        }
        drop(tape);

        if let Some(f) = self.custom_outer_update.as_mut() {
            f(&mut self.model);
        }

        let opt = self.optimizer.as_mut().ok_or(MetaError::MissingOptimizer)?;
        opt.step(ParamGroup::Model, self.model.params_mut());
        if learn_step && opt.has_param_group(ParamGroup::StepSize) {
            opt.step(ParamGroup::StepSize, self.step_sizes.params_mut());
        }
        if learn_step {
            let corrected = self.step_sizes.clamp_non_negative();
            if corrected > 0 {
                warn!(corrected, "Negative step values detected, clamped to zero");
            }
        }
        if let Some(s) = self.scheduler.as_mut() {
            s.step(&mut **opt);
        }

        Ok(outer.results)
    }

    /// Train on up to `max_batches` batches. Returns running means.
    pub fn train<'a>(
        &mut self,
        batches: impl IntoIterator<Item = &'a TaskBatch>,
        max_batches: usize,
    ) -> Result<MeanResults> {
        let mut means = MeanResults::default();
        for batch in batches.into_iter().take(max_batches) {
            let r = self.train_batch(batch)?;
            means.update(&r);
            info!(
                batch = means.num_batches,
                loss = means.mean_outer_loss,
                acc_before = ?means.accuracies_before,
                acc_after = ?means.accuracies_after,
                "train"
            );
        }
        Ok(means)
    }

    // ── Evaluation ───────────────────────────────────────────────

    /// Outer loss of `batch` in evaluation mode. Parameters are not updated.
    pub fn evaluate_batch(&mut self, batch: &TaskBatch) -> Result<OuterLossResults> {
        let mut tape = Tape::new();
        Ok(self.get_outer_loss(&mut tape, batch, Mode::Eval)?.results)
    }

    pub fn evaluate<'a>(
        &mut self,
        batches: impl IntoIterator<Item = &'a TaskBatch>,
        max_batches: usize,
    ) -> Result<MeanResults> {
        let mut means = MeanResults::default();
        for batch in batches.into_iter().take(max_batches) {
            let r = self.evaluate_batch(batch)?;
            means.update(&r);
            info!(
                batch = means.num_batches,
                loss = means.mean_outer_loss,
                acc_after = ?means.accuracies_after,
                "evaluate"
            );
        }
        Ok(means)
    }
}

fn task_accuracy<M: MetaModule>(
    model: &M,
    tape: &mut Tape,
    params: &ParamMap,
    logits: BufId,
    split: &TaskSplit,
) -> Result<f32> {
    match &split.targets {
        Targets::Classes(classes) => {
            let predicted = model.predict(tape, params, &split.inputs, logits)?;
            Ok(prediction_accuracy(&predicted, classes))
        }
        Targets::Values(_) => Ok(0.0),
    }
}
