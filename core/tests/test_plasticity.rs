//! Inner-loop update rules: invariants shared by every gradient-based rule.

use approx::assert_abs_diff_eq;

use snn_maml_core::loss::{cross_entropy, Targets};
use snn_maml_core::mlp::{Mlp, MlpConfig};
use snn_maml_core::model::{FinalLayer, MetaModule};
use snn_maml_core::params::{ParamMap, StepSizeStore};
use snn_maml_core::plasticity::{
    custom_sgd, custom_sgd_reg, AnchorRegularized, ClampedStep, GradientStep, InnerContext,
    PlasticityRule, SgdOptions,
};
use snn_maml_core::soel::{maml_soel, DEFAULT_SOEL_THRESHOLD};
use snn_maml_core::tape::{BufId, Tape};
use snn_maml_core::tensor::{SimpleRng, Tensor};
use snn_maml_core::LossKind;

fn make_inputs(n: usize, seed: u64) -> (Tensor, Vec<usize>) {
    let mut rng = SimpleRng::new(seed);
    let mut x = vec![0.0f32; n * 4];
    rng.fill_uniform(&mut x, 1.0);
    (Tensor::new(x, vec![n, 4]), (0..n).map(|i| i % 3).collect())
}

fn mlp_loss(model: &Mlp, tape: &mut Tape, params: &ParamMap) -> BufId {
    let (x, y) = make_inputs(6, 3);
    let logits = model.forward(tape, params, &x).unwrap();
    cross_entropy(tape, logits, &y).unwrap()
}

#[test]
fn test_zero_gradient_is_bit_identical() {
    let mut tape = Tape::new();
    let w = tape.param(&[0.3, -1.7, 2.5], vec![3]);
    let zeros = tape.constant(vec![0.0; 3], vec![3]);
    let prod = tape.mul(w, zeros).unwrap();
    let loss = tape.sum(prod);
    let params: ParamMap = [("w".to_string(), w)].into_iter().collect();
    let step = StepSizeStore::scalar(0.5, false).register(&mut tape);

    let out = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions::default()).unwrap();
    let before: Vec<u32> = tape.data(w).iter().map(|v| v.to_bits()).collect();
    let after: Vec<u32> = tape.data(out.require("w").unwrap()).iter().map(|v| v.to_bits()).collect();
    assert_eq!(before, after);
}

#[test]
fn test_step_needs_the_snapshot_the_loss_used() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let own = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.5, false).register(&mut tape);
    let loss = mlp_loss(&model, &mut tape, &own);

    let stepped = custom_sgd(&mut tape, loss, &own, &step, &SgdOptions::default()).unwrap();
    let moved = own.iter().filter(|(n, id)| tape.data(**id) != tape.data(stepped.require(n).unwrap())).count();
    assert!(moved > 0);

    // a fresh registration is unrelated to `loss`: nothing moves
    let fresh = model.meta_named_parameters(&mut tape);
    let out = custom_sgd(&mut tape, loss, &fresh, &step, &SgdOptions::default()).unwrap();
    for (name, &id) in fresh.iter() {
        assert_eq!(out.require(name).unwrap(), id, "{name}");
    }
}

#[test]
fn test_zero_step_size_is_identity() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.0, false).register(&mut tape);
    let loss = mlp_loss(&model, &mut tape, &params);

    let out = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions::default()).unwrap();
    for (name, &id) in params.iter() {
        assert_eq!(tape.data(id), tape.data(out.require(name).unwrap()), "{name}");
    }
}

#[test]
fn test_rules_preserve_key_set_and_order() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.1, false).register(&mut tape);
    let expected: Vec<&String> = params.keys().collect();

    let loss = mlp_loss(&model, &mut tape, &params);
    let sgd = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions::default()).unwrap();
    assert_eq!(sgd.keys().collect::<Vec<_>>(), expected);

    let loss = mlp_loss(&model, &mut tape, &params);
    let (reg, grads) = custom_sgd_reg(&mut tape, loss, &params, &step, &params, 1.0).unwrap();
    assert_eq!(reg.keys().collect::<Vec<_>>(), expected);
    assert_eq!(grads.len(), params.len());

    let (x, y) = make_inputs(6, 3);
    let u = model.forward_membrane(&mut tape, &params, &x).unwrap();
    let soel = maml_soel(&model, &mut tape, u, &y, &params, &step, &[DEFAULT_SOEL_THRESHOLD], true).unwrap();
    assert_eq!(soel.keys().collect::<Vec<_>>(), expected);
}

#[test]
fn test_first_order_and_full_order_agree_on_values() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.1, false).register(&mut tape);

    let loss = mlp_loss(&model, &mut tape, &params);
    let first = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions { first_order: true, ..Default::default() }).unwrap();
    let loss = mlp_loss(&model, &mut tape, &params);
    let full = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions::default()).unwrap();

    for name in params.keys() {
        let a = tape.data(first.require(name).unwrap()).to_vec();
        let b = tape.data(full.require(name).unwrap()).to_vec();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_anchor_pull_without_gradient() {
    let mut tape = Tape::new();
    let used = tape.param(&[1.0], vec![1]);
    let unused = tape.param(&[2.0], vec![1]);
    let loss = tape.sum(used);
    let params: ParamMap = [("used".to_string(), used), ("unused".to_string(), unused)].into_iter().collect();
    let anchor_unused = tape.constant(vec![1.0], vec![1]);
    let anchor_used = tape.constant(vec![-100.0], vec![1]);
    let anchor: ParamMap = [("used".to_string(), anchor_used), ("unused".to_string(), anchor_unused)]
        .into_iter()
        .collect();
    let step = StepSizeStore::scalar(0.5, false).register(&mut tape);

    let (out, grads) = custom_sgd_reg(&mut tape, loss, &params, &step, &anchor, 1.0).unwrap();
    assert!(grads[0].is_some());
    assert!(grads[1].is_none());
    // gradient step only, the anchor is ignored where a gradient exists
    assert_abs_diff_eq!(tape.data(out.require("used").unwrap())[0], 0.5, epsilon = 1e-6);
    // 2 - 0.5 * 1.0 * (2 - 1)
    assert_abs_diff_eq!(tape.data(out.require("unused").unwrap())[0], 1.5, epsilon = 1e-6);
}

#[test]
fn test_custom_update_applies_to_weights_only() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.1, false).register(&mut tape);
    let (x, y) = make_inputs(6, 3);
    let targets = Targets::Classes(y);

    let mut rule = GradientStep::with_update(ClampedStep { min: -0.01, max: 0.01 });
    let ctx = InnerContext {
        inputs: &x,
        targets: &targets,
        loss: LossKind::CrossEntropy,
        step_size: &step,
        first_order: false,
        anchor: &params,
        sample_index: None,
        save_graph: true,
    };
    let outcome = rule.step(&model, &mut tape, &params, &ctx).unwrap();
    assert!(outcome.loss.is_finite());
    assert!(outcome.accuracy.is_some());

    for (name, &id) in outcome.params.iter() {
        let data = tape.data(id);
        if name.contains("weight") {
            assert!(data.iter().all(|v| (-0.01..=0.01).contains(v)), "{name}");
        }
    }
    // biases take the plain step
    let b = outcome.params.require("layers.0.bias").unwrap();
    let b0 = params.require("layers.0.bias").unwrap();
    assert_ne!(tape.data(b), tape.data(b0));
}

#[test]
fn test_per_param_step_sizes() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut store = StepSizeStore::per_param(model.params().names(), 0.1, false);
    // freeze the head
    store.zero_last(2);
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = store.register(&mut tape);
    let loss = mlp_loss(&model, &mut tape, &params);

    let out = custom_sgd(&mut tape, loss, &params, &step, &SgdOptions::default()).unwrap();
    let head = [model.final_weight_name(), model.final_bias_name()];
    for (name, &id) in params.iter() {
        let same = tape.data(id) == tape.data(out.require(name).unwrap());
        assert_eq!(same, head.contains(name), "{name}");
    }
}

#[test]
fn test_anchor_rule_matches_gradient_step_when_all_grads_exist() {
    let model = Mlp::new(MlpConfig::test_config());
    let mut tape = Tape::new();
    let params = model.meta_named_parameters(&mut tape);
    let step = StepSizeStore::scalar(0.1, false).register(&mut tape);
    let (x, y) = make_inputs(6, 3);
    let targets = Targets::Classes(y);
    let ctx = InnerContext {
        inputs: &x,
        targets: &targets,
        loss: LossKind::CrossEntropy,
        step_size: &step,
        first_order: false,
        anchor: &params,
        sample_index: None,
        save_graph: false,
    };

    let a = GradientStep::new().step(&model, &mut tape, &params, &ctx).unwrap();
    let b = AnchorRegularized::default().step(&model, &mut tape, &params, &ctx).unwrap();
    assert_eq!(a.loss, b.loss);
    for name in params.keys() {
        let va = tape.data(a.params.require(name).unwrap()).to_vec();
        let vb = tape.data(b.params.require(name).unwrap()).to_vec();
        assert_eq!(va, vb, "{name}");
    }
}
