/// Outer-loop optimizers.
///
/// Parameters are organized in groups: the model's meta-parameters are
/// always present, and the meta-learner adds a second group when the inner
/// step size is learned. Each group has its own learning rate and its own
/// per-parameter state, keyed by parameter name.
///
/// `step` reads the gradients accumulated in a `ParamStore` and updates its
/// values in place. Parameters without a gradient are skipped.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::params::ParamStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Meta-parameters of the model.
    Model,
    /// Learned inner-loop step sizes.
    StepSize,
}

pub trait Optimizer {
    /// Register `group` with learning rate `lr` (defaults to the model group's).
    fn add_param_group(&mut self, group: ParamGroup, lr: Option<f32>);

    fn has_param_group(&self, group: ParamGroup) -> bool;

    fn groups(&self) -> Vec<ParamGroup>;

    /// Learning rate of `group`, or 0 if the group is absent.
    fn lr(&self, group: ParamGroup) -> f32;

    fn set_lr(&mut self, group: ParamGroup, lr: f32);

    /// One update of every parameter in `store` that has a gradient.
    fn step(&mut self, group: ParamGroup, store: &mut ParamStore);

    fn zero_grad(&self, store: &mut ParamStore) {
        store.zero_grad();
    }
}

// ── SGD ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Sgd {
    lrs: IndexMap<ParamGroup, f32>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        let mut lrs = IndexMap::new();
        lrs.insert(ParamGroup::Model, lr);
        Sgd { lrs }
    }
}

impl Optimizer for Sgd {
    fn add_param_group(&mut self, group: ParamGroup, lr: Option<f32>) {
        let lr = lr.unwrap_or_else(|| self.lr(ParamGroup::Model));
        self.lrs.insert(group, lr);
    }

    fn has_param_group(&self, group: ParamGroup) -> bool {
        self.lrs.contains_key(&group)
    }

    fn groups(&self) -> Vec<ParamGroup> {
        self.lrs.keys().copied().collect()
    }

    fn lr(&self, group: ParamGroup) -> f32 {
        self.lrs.get(&group).copied().unwrap_or(0.0)
    }

    fn set_lr(&mut self, group: ParamGroup, lr: f32) {
        if let Some(slot) = self.lrs.get_mut(&group) {
            *slot = lr;
        }
    }

    fn step(&mut self, group: ParamGroup, store: &mut ParamStore) {
        let Some(&lr) = self.lrs.get(&group) else { return };
        for (_, p) in store.named_parameters_mut() {
            if let Some(g) = &p.grad {
                for (w, gi) in p.value.data.iter_mut().zip(g.iter()) {
                    *w -= lr * gi;
                }
            }
        }
    }
}

// ── AdamW ────────────────────────────────────────────────────────────

/// AdamW hyperparameters (shared across groups).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

#[derive(Clone, Debug)]
struct GroupState {
    lr: f32,
    step: u32,
    moments: IndexMap<String, MomentBuf>,
}

impl GroupState {
    fn new(lr: f32) -> Self {
        GroupState { lr, step: 0, moments: IndexMap::new() }
    }
}

/// Core AdamW update on one (params, grads, m, v) buffer, in place.
#[inline]
fn adamw_step_buf(
    params: &mut [f32],
    grads: &[f32],
    buf: &mut MomentBuf,
    lr: f32,
    c: &AdamWConfig,
    bc1_inv: f32,
    bc2_inv: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
        buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
        let m_hat = buf.m[i] * bc1_inv;
        let v_hat = buf.v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * params[i]);
    }
}

/// Bias-corrected Adam with decoupled weight decay, one step counter per group.
#[derive(Clone, Debug)]
pub struct AdamW {
    pub config: AdamWConfig,
    groups: IndexMap<ParamGroup, GroupState>,
}

impl AdamW {
    pub fn new(lr: f32, config: AdamWConfig) -> Self {
        let mut groups = IndexMap::new();
        groups.insert(ParamGroup::Model, GroupState::new(lr));
        AdamW { config, groups }
    }

    /// Number of steps taken by `group`.
    pub fn step_count(&self, group: ParamGroup) -> u32 {
        self.groups.get(&group).map_or(0, |g| g.step)
    }
}

impl Optimizer for AdamW {
    fn add_param_group(&mut self, group: ParamGroup, lr: Option<f32>) {
        let lr = lr.unwrap_or_else(|| self.lr(ParamGroup::Model));
        self.groups.insert(group, GroupState::new(lr));
    }

    fn has_param_group(&self, group: ParamGroup) -> bool {
        self.groups.contains_key(&group)
    }

    fn groups(&self) -> Vec<ParamGroup> {
        self.groups.keys().copied().collect()
    }

    fn lr(&self, group: ParamGroup) -> f32 {
        self.groups.get(&group).map_or(0.0, |g| g.lr)
    }

    fn set_lr(&mut self, group: ParamGroup, lr: f32) {
        if let Some(g) = self.groups.get_mut(&group) {
            g.lr = lr;
        }
    }

    fn step(&mut self, group: ParamGroup, store: &mut ParamStore) {
        let c = &self.config;
        let Some(state) = self.groups.get_mut(&group) else { return };
        state.step += 1;
        let t = state.step as f32;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));

        for (name, p) in store.named_parameters_mut() {
            let Some(grad) = &p.grad else { continue };
            let buf = state.moments
                .entry(name.clone())
                .or_insert_with(|| MomentBuf::zeros(grad.len()));
            adamw_step_buf(&mut p.value.data, grad, buf, state.lr, c, bc1_inv, bc2_inv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn store_with_grad(value: f32, grad: f32) -> ParamStore {
        let mut s = ParamStore::new();
        s.insert("w", Tensor::scalar(value));
        s.accumulate_grad("w", &[grad]).unwrap();
        s.insert("frozen", Tensor::scalar(3.0));
        s
    }

    #[test]
    fn test_sgd_step_skips_missing_grad() {
        let mut s = store_with_grad(1.0, 2.0);
        let mut opt = Sgd::new(0.1);
        opt.step(ParamGroup::Model, &mut s);
        assert!((s.value("w").unwrap().data[0] - 0.8).abs() < 1e-6);
        assert_eq!(s.value("frozen").unwrap().data[0], 3.0);
    }

    #[test]
    fn test_param_groups() {
        let mut opt = AdamW::new(1e-3, AdamWConfig::default());
        assert!(opt.has_param_group(ParamGroup::Model));
        assert!(!opt.has_param_group(ParamGroup::StepSize));
        opt.add_param_group(ParamGroup::StepSize, None);
        assert_eq!(opt.lr(ParamGroup::StepSize), 1e-3);
        opt.set_lr(ParamGroup::StepSize, 5e-4);
        assert_eq!(opt.lr(ParamGroup::StepSize), 5e-4);
        assert_eq!(opt.groups(), vec![ParamGroup::Model, ParamGroup::StepSize]);
    }

    #[test]
    fn test_adamw_first_step_magnitude() {
        // First bias-corrected step moves by ~lr in the gradient's sign direction.
        let cfg = AdamWConfig { weight_decay: 0.0, ..AdamWConfig::default() };
        let mut opt = AdamW::new(0.01, cfg);
        let mut s = store_with_grad(1.0, 5.0);
        opt.step(ParamGroup::Model, &mut s);
        let w = s.value("w").unwrap().data[0];
        assert!((w - 0.99).abs() < 1e-5, "w = {w}");
        assert_eq!(opt.step_count(ParamGroup::Model), 1);
        assert_eq!(opt.step_count(ParamGroup::StepSize), 0);
    }

    #[test]
    fn test_adamw_weight_decay_shrinks_with_zero_grad() {
        let mut opt = AdamW::new(0.1, AdamWConfig::default());
        let mut s = store_with_grad(2.0, 0.0);
        opt.step(ParamGroup::Model, &mut s);
        // 2 - 0.1 * 0.1 * 2
        assert!((s.value("w").unwrap().data[0] - 1.98).abs() < 1e-6);
    }
}
