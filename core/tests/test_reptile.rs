//! Reptile outer updates: interpolation toward adapted parameters.

use approx::assert_abs_diff_eq;

use snn_maml_core::mlp::{Mlp, MlpConfig};
use snn_maml_core::model::MetaModule;
use snn_maml_core::plasticity::GradientStep;
use snn_maml_core::reptile::{Reptile, ReptileConfig};
use snn_maml_core::tensor::{SimpleRng, Tensor};
use snn_maml_core::{Targets, TaskBatch, TaskSplit};

fn make_split(n: usize, seed: u64) -> TaskSplit {
    let mut rng = SimpleRng::new(seed);
    let mut x = vec![0.0f32; n * 4];
    rng.fill_uniform(&mut x, 1.0);
    TaskSplit::new(Tensor::new(x, vec![n, 4]), Targets::Classes((0..n).map(|i| i % 3).collect()))
}

fn make_batch(num_tasks: usize, seed: u64) -> TaskBatch {
    let train = (0..num_tasks).map(|t| make_split(6, seed + 2 * t as u64)).collect();
    let test = (0..num_tasks).map(|t| make_split(6, seed + 2 * t as u64 + 1)).collect();
    TaskBatch::new(train, test)
}

fn flat(model: &Mlp) -> Vec<f32> {
    model.params().named_parameters().flat_map(|(_, p)| p.value.data.clone()).collect()
}

#[test]
fn test_single_task_full_step_lands_on_adapted_parameters() {
    // α = 1 on iteration 0: θ' replaces θ; compare against a second run
    // with half the rate, which must land exactly halfway.
    let batch = make_batch(1, 7);
    let run = |alpha: f32| {
        let cfg = ReptileConfig { outer_step_size: alpha, total_iterations: 10, num_adaptation_steps: 3, ..ReptileConfig::default() };
        let mut r = Reptile::new(Mlp::new(MlpConfig::test_config()), GradientStep::new(), cfg);
        r.train_batch(&batch).unwrap();
        flat(r.model())
    };
    let theta = flat(&Mlp::new(MlpConfig::test_config()));
    let full = run(1.0);
    let half = run(0.5);
    for ((t, f), h) in theta.iter().zip(full.iter()).zip(half.iter()) {
        assert_abs_diff_eq!(*h, 0.5 * (t + f), epsilon = 1e-5);
    }
    assert_ne!(theta, full);
}

#[test]
fn test_results_and_cooling() {
    let cfg = ReptileConfig { outer_step_size: 0.8, total_iterations: 2, num_adaptation_steps: 2, ..ReptileConfig::default() };
    let mut r = Reptile::new(Mlp::new(MlpConfig::test_config()), GradientStep::new(), cfg);

    let results = r.train_batch(&make_batch(3, 1)).unwrap();
    assert_eq!(results.num_tasks, 3);
    assert_eq!(results.inner_losses.len(), 2);
    assert!(results.inner_losses.iter().all(|step| step.len() == 3));
    assert_eq!(results.accuracies_after.as_ref().map(Vec::len), Some(3));
    assert!(results.mean_outer_loss.is_finite());
    assert_eq!(r.iteration(), 1);
    assert_abs_diff_eq!(r.current_outer_step(), 0.4, epsilon = 1e-6);

    r.train_batch(&make_batch(3, 20)).unwrap();
    // fully cooled: further batches leave θ in place
    let frozen = flat(r.model());
    r.train_batch(&make_batch(3, 40)).unwrap();
    assert_eq!(flat(r.model()), frozen);
}
