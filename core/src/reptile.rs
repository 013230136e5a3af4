/// Reptile: first-order meta-learning by parameter interpolation.
///
/// Per batch, every task is adapted independently from the current
/// meta-parameters θ with the plasticity rule (first-order, no outer graph),
/// and θ moves toward the mean adapted parameters:
///   θ ← θ + α_k · mean_tasks(θ' − θ),   α_k = α · (1 − k / K)
/// where k is the outer iteration and K the planned number of iterations.
/// No outer optimizer is involved.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::loss::{prediction_accuracy, LossKind, Targets};
use crate::maml::OuterLossResults;
use crate::model::MetaModule;
use crate::params::{ParamStore, StepSizeStore};
use crate::plasticity::{InnerContext, PlasticityRule};
use crate::tape::Tape;
use crate::task::{TaskBatch, TaskSplit};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReptileConfig {
    /// Outer interpolation rate α.
    pub outer_step_size: f32,
    /// Planned outer iterations K for the linear cooling schedule.
    pub total_iterations: usize,
    pub inner_step_size: f32,
    pub num_adaptation_steps: usize,
    pub loss: LossKind,
}

impl Default for ReptileConfig {
    fn default() -> Self {
        ReptileConfig {
            outer_step_size: 1.0,
            total_iterations: 1000,
            inner_step_size: 0.1,
            num_adaptation_steps: 5,
            loss: LossKind::CrossEntropy,
        }
    }
}

pub struct Reptile<M, R> {
    model: M,
    rule: R,
    config: ReptileConfig,
    iteration: usize,
}

impl<M: MetaModule, R: PlasticityRule<M>> Reptile<M, R> {
    pub fn new(model: M, rule: R, config: ReptileConfig) -> Self {
        Reptile { model, rule, config, iteration: 0 }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// α_k for the current iteration; reaches 0 at `total_iterations`.
    pub fn current_outer_step(&self) -> f32 {
        let k = self.iteration.min(self.config.total_iterations) as f32;
        let total = self.config.total_iterations.max(1) as f32;
        self.config.outer_step_size * (1.0 - k / total)
    }

    /// Adapt to one task from the current meta-parameters. Returns the adapted
    /// values, the inner losses per step, and the test loss/accuracy after.
    fn adapt_task(&mut self, train: &TaskSplit, test: &TaskSplit) -> Result<(ParamStore, Vec<f32>, f32, Option<f32>)> {
        let mut tape = Tape::new();
        let theta = self.model.meta_named_parameters(&mut tape);
        let step_size = StepSizeStore::scalar(self.config.inner_step_size, false).register(&mut tape);

        let mut params = theta.clone();
        let mut inner_losses = Vec::with_capacity(self.config.num_adaptation_steps);
        for _ in 0..self.config.num_adaptation_steps {
            let ctx = InnerContext {
                inputs: &train.inputs,
                targets: &train.targets,
                loss: self.config.loss,
                step_size: &step_size,
                first_order: true,
                anchor: &theta,
                sample_index: None,
                save_graph: false,
            };
            let outcome = self.rule.step(&self.model, &mut tape, &params, &ctx)?;
            params = outcome.params;
            inner_losses.push(outcome.loss);
        }

        let (test_loss, accuracy) = tape.no_grad(|t| -> Result<(f32, Option<f32>)> {
            let logits = self.model.forward(t, &params, &test.inputs)?;
            let loss = self.config.loss.compute(t, logits, &test.targets)?;
            let accuracy = match &test.targets {
                Targets::Classes(c) => {
                    let predicted = self.model.predict(t, &params, &test.inputs, logits)?;
                    Some(prediction_accuracy(&predicted, c))
                }
                Targets::Values(_) => None,
            };
            Ok((t.scalar(loss), accuracy))
        })?;

        Ok((ParamStore::from_map(&tape, &params), inner_losses, test_loss, accuracy))
    }

    /// One Reptile outer step over `batch`.
    pub fn train_batch(&mut self, batch: &TaskBatch) -> Result<OuterLossResults> {
        let classification = batch.validate()?;
        let num_tasks = batch.num_tasks();
        let steps = self.config.num_adaptation_steps;

        let mut delta: Vec<Vec<f32>> = self.model.params().named_parameters()
            .map(|(_, p)| vec![0.0; p.value.numel()])
            .collect();
        let mut results = OuterLossResults {
            num_tasks,
            inner_losses: vec![vec![0.0; num_tasks]; steps],
            outer_losses: vec![0.0; num_tasks],
            mean_outer_loss: 0.0,
            accuracies_before: None,
            accuracies_after: classification.then(|| vec![0.0; num_tasks]),
        };

        for (task, (train, test)) in batch.train.iter().zip(batch.test.iter()).enumerate() {
            let (adapted, inner, test_loss, accuracy) = self.adapt_task(train, test)?;
            for ((name, p), d) in self.model.params().named_parameters().zip(delta.iter_mut()) {
                let adapted_value = adapted.value(name)?;
                for ((di, a), t) in d.iter_mut().zip(adapted_value.data.iter()).zip(p.value.data.iter()) {
                    *di += a - t;
                }
            }
            for (step, loss) in inner.iter().enumerate() {
                results.inner_losses[step][task] = *loss;
            }
            results.outer_losses[task] = test_loss;
            if let (Some(acc), Some(a)) = (results.accuracies_after.as_mut(), accuracy) {
                acc[task] = a;
            }
        }

        let alpha = self.current_outer_step();
        let scale = alpha / num_tasks as f32;
        for ((_, p), d) in self.model.params_mut().named_parameters_mut().zip(delta.iter()) {
            for (w, di) in p.value.data.iter_mut().zip(d.iter()) {
                *w += scale * di;
            }
        }
        self.iteration += 1;

        results.mean_outer_loss = results.outer_losses.iter().sum::<f32>() / num_tasks as f32;
        debug!(alpha, iteration = self.iteration, "reptile interpolation");
        info!(loss = results.mean_outer_loss, "reptile batch");
        Ok(results)
    }
}
