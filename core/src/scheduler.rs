/// Outer-loop learning-rate schedules, advanced once per batch.
///
/// A scheduler records the learning rate of each optimizer group the first
/// time it sees that group and derives every later rate from it, so groups
/// added after construction (a learned step size) are scheduled from their
/// own starting rate.

use indexmap::IndexMap;

use crate::optimizer::{Optimizer, ParamGroup};

pub trait Scheduler {
    /// Advance one batch and write the new rates into `optimizer`.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    /// Batches seen so far.
    fn last_epoch(&self) -> usize;
}

fn record_initial(initial: &mut IndexMap<ParamGroup, f32>, optimizer: &dyn Optimizer) {
    for group in optimizer.groups() {
        initial.entry(group).or_insert_with(|| optimizer.lr(group));
    }
}

/// Multiply the rate by `gamma` every `step_size` batches.
#[derive(Clone, Debug)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f32,
    epoch: usize,
    initial_lr: IndexMap<ParamGroup, f32>,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f32) -> Self {
        StepLr { step_size: step_size.max(1), gamma, epoch: 0, initial_lr: IndexMap::new() }
    }
}

impl Scheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        record_initial(&mut self.initial_lr, optimizer);
        self.epoch += 1;
        let factor = self.gamma.powi((self.epoch / self.step_size) as i32);
        for (&group, &lr0) in &self.initial_lr {
            optimizer.set_lr(group, lr0 * factor);
        }
    }

    fn last_epoch(&self) -> usize {
        self.epoch
    }
}

/// Cosine decay from the initial rate to `eta_min` over `t_max` batches.
#[derive(Clone, Debug)]
pub struct CosineAnnealing {
    pub t_max: usize,
    pub eta_min: f32,
    epoch: usize,
    initial_lr: IndexMap<ParamGroup, f32>,
}

impl CosineAnnealing {
    pub fn new(t_max: usize, eta_min: f32) -> Self {
        CosineAnnealing { t_max: t_max.max(1), eta_min, epoch: 0, initial_lr: IndexMap::new() }
    }
}

impl Scheduler for CosineAnnealing {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        record_initial(&mut self.initial_lr, optimizer);
        self.epoch += 1;
        let progress = self.epoch.min(self.t_max) as f32 / self.t_max as f32;
        let cosine = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        for (&group, &lr0) in &self.initial_lr {
            optimizer.set_lr(group, self.eta_min + (lr0 - self.eta_min) * cosine);
        }
    }

    fn last_epoch(&self) -> usize {
        self.epoch
    }
}
