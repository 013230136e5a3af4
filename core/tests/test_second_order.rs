//! Full-order meta-gradients against central finite differences of the
//! whole outer loss (adaptation included), and the curvature the fast-sigmoid
//! surrogate contributes to full-order adaptation of spiking networks.

use snn_maml_core::config::MetaLearnerConfig;
use snn_maml_core::gradient::check_param_gradient;
use snn_maml_core::lif::{LifConfig, LifNetwork};
use snn_maml_core::mlp::{ActivationKind, Mlp, MlpConfig};
use snn_maml_core::model::{MetaModule, Mode};
use snn_maml_core::params::{ParamStore, StepSize, SHARED_STEP_SIZE};
use snn_maml_core::plasticity::{AnchorRegularized, GradientStep, PlasticityRule};
use snn_maml_core::tape::Tape;
use snn_maml_core::tensor::{SimpleRng, Tensor};
use snn_maml_core::{MetaError, MetaLearner, Targets, TaskBatch, TaskSplit};

const EPS: f32 = 5e-3;
const TOL: f32 = 1e-1;

fn make_split(n: usize, seed: u64) -> TaskSplit {
    let mut rng = SimpleRng::new(seed);
    let mut x = vec![0.0f32; n * 3];
    rng.fill_uniform(&mut x, 1.0);
    TaskSplit::new(Tensor::new(x, vec![n, 3]), Targets::Classes((0..n).map(|i| i % 2).collect()))
}

fn batch() -> TaskBatch {
    TaskBatch::new(vec![make_split(4, 1), make_split(4, 3)], vec![make_split(4, 2), make_split(4, 4)])
}

fn smooth_model() -> Mlp {
    Mlp::new(MlpConfig { layer_sizes: vec![3, 4, 2], activation: ActivationKind::Sigmoid, seed: 5 })
}

fn learner<R: PlasticityRule<Mlp>>(rule: R, learn_step_size: bool) -> MetaLearner<Mlp, R> {
    let cfg = MetaLearnerConfig {
        step_size: 0.5,
        num_adaptation_steps: 2,
        learn_step_size,
        ..MetaLearnerConfig::test_config()
    };
    MetaLearner::new(smooth_model(), rule, cfg, None).unwrap()
}

fn outer_loss<R: PlasticityRule<Mlp>>(l: &mut MetaLearner<Mlp, R>, b: &TaskBatch) -> snn_maml_core::Result<f32> {
    let mut tape = Tape::new();
    Ok(l.get_outer_loss(&mut tape, b, Mode::Train)?.results.mean_outer_loss)
}

fn set_model_params<R: PlasticityRule<Mlp>>(l: &mut MetaLearner<Mlp, R>, store: &ParamStore) -> snn_maml_core::Result<()> {
    for (name, p) in store.named_parameters() {
        let target = l.model_mut().params_mut().get_mut(name)
            .ok_or_else(|| MetaError::MissingParameter(name.clone()))?;
        target.value = p.value.clone();
    }
    Ok(())
}

/// Analytical outer gradients of the model parameters and the step sizes.
fn analytical<R: PlasticityRule<Mlp>>(l: &mut MetaLearner<Mlp, R>, b: &TaskBatch) -> (Vec<(String, Vec<f32>)>, Vec<f32>) {
    let mut tape = Tape::new();
    let outer = l.get_outer_loss(&mut tape, b, Mode::Train).unwrap();
    let mut wrt = outer.params.ids();
    let StepSize::Scalar(alpha) = outer.step_size else { unreachable!() };
    wrt.push(alpha);
    let grads = tape.grad(outer.mean_outer_loss, None, &wrt, false).unwrap();
    let model: Vec<(String, Vec<f32>)> = outer.params.keys()
        .zip(grads.iter())
        .map(|(k, g)| (k.clone(), g.map(|g| tape.data(g).to_vec()).unwrap_or_default()))
        .collect();
    let step = grads.last().copied().flatten().map(|g| tape.data(g).to_vec()).unwrap_or_default();
    (model, step)
}

fn check_model_gradients<R: PlasticityRule<Mlp>>(mut l: MetaLearner<Mlp, R>) {
    let b = batch();
    let (grads, _) = analytical(&mut l, &b);
    let base = l.model().params().clone();

    for (name, g) in &grads {
        let check = check_param_gradient(&base, name, g, 8, EPS, TOL, |store| {
            set_model_params(&mut l, store)?;
            outer_loss(&mut l, &b)
        })
        .unwrap();
        assert!(check.all_passed(), "{name}: {check:?}");
    }
    set_model_params(&mut l, &base).unwrap();
}

#[test]
fn test_full_order_meta_gradient_matches_finite_differences() {
    check_model_gradients(learner(GradientStep::new(), false));
}

#[test]
fn test_anchor_rule_meta_gradient_matches_finite_differences() {
    check_model_gradients(learner(AnchorRegularized::default(), false));
}

#[test]
fn test_step_size_gradient_matches_finite_differences() {
    let mut l = learner(GradientStep::new(), true);
    let b = batch();
    let (_, step_grad) = analytical(&mut l, &b);
    assert_eq!(step_grad.len(), 1);
    let base = l.step_sizes().params().clone();

    let check = check_param_gradient(&base, SHARED_STEP_SIZE, &step_grad, 1, EPS, TOL, |store| {
        let alpha = store.value(SHARED_STEP_SIZE)?.clone();
        let slot = l.step_sizes_mut().params_mut().get_mut(SHARED_STEP_SIZE)
            .ok_or_else(|| MetaError::MissingParameter(SHARED_STEP_SIZE.to_string()))?;
        slot.value = alpha;
        outer_loss(&mut l, &b)
    })
    .unwrap();
    assert!(check.all_passed(), "{check:?}");
}

#[test]
fn test_inner_step_through_spike_carries_surrogate_curvature() {
    // L(w) = fast_sigmoid(u * w), w' = w - a * dL/dw, outer = w'.
    // d outer / dw = 1 - a * d2L/dw2, d2L/dw2 = -20 u^2 sign(uw) / (10|uw| + 1)^3
    let (u, a) = (0.2f32, 0.5f32);
    let outer_grad = |create_graph: bool| {
        let mut tape = Tape::new();
        let w = tape.param(&[0.5], vec![1]);
        let x = tape.scale(w, u);
        let s = tape.fast_sigmoid(x, &[0.0]).unwrap();
        let inner = tape.sum(s);
        let gw = tape.grad(inner, None, &[w], create_graph).unwrap()[0].unwrap();
        let step = tape.scale(gw, a);
        let adapted = tape.sub(w, step).unwrap();
        let outer = tape.sum(adapted);
        let g = tape.grad(outer, None, &[w], false).unwrap()[0].unwrap();
        tape.data(g)[0]
    };
    // uw = 0.1: d2L/dw2 = -20 * 0.04 / 8 = -0.1
    assert!((outer_grad(true) - 1.05).abs() < 1e-5, "{}", outer_grad(true));
    assert!((outer_grad(false) - 1.0).abs() < 1e-6);
}

fn spiking_outer_grads(first_order: bool) -> Vec<f32> {
    let mut rng = SimpleRng::new(17);
    let mut split = |n: usize| {
        let x: Vec<f32> = (0..n * 4).map(|_| 0.5 + rng.uniform(0.5)).collect();
        TaskSplit::new(Tensor::new(x, vec![n, 4]), Targets::Classes((0..n).map(|i| i % 3).collect()))
    };
    let b = TaskBatch::new(vec![split(4), split(4)], vec![split(3), split(3)]);
    let cfg = MetaLearnerConfig { first_order, step_size: 0.5, ..MetaLearnerConfig::test_config() };
    let net = LifNetwork::new(LifConfig::test_config());
    let mut l = MetaLearner::new(net, GradientStep::new(), cfg, None).unwrap();

    let mut tape = Tape::new();
    let outer = l.get_outer_loss(&mut tape, &b, Mode::Train).unwrap();
    let grads = tape.grad(outer.mean_outer_loss, None, &outer.params.ids(), false).unwrap();
    grads.iter().flatten().flat_map(|g| tape.data(*g).to_vec()).collect()
}

#[test]
fn test_spiking_full_order_gradient_differs_from_first_order() {
    let full = spiking_outer_grads(false);
    let first = spiking_outer_grads(true);
    assert!(!full.is_empty());
    assert_eq!(full.len(), first.len());
    assert!(full.iter().chain(first.iter()).all(|g| g.is_finite()));
    let max_diff = full.iter().zip(first.iter()).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    assert!(max_diff > 1e-7, "second-order terms missing: {max_diff}");
}
