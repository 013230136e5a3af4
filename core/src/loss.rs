/// Task losses and accuracy helpers.
///
/// Classification vs. regression is carried by the `Targets` variant:
/// class indices are classification, float tensors are regression.

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::{self, Tensor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Mean softmax cross-entropy over class-index targets.
    #[default]
    CrossEntropy,
    /// Mean squared error over float targets.
    Mse,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Targets {
    Classes(Vec<usize>),
    Values(Tensor),
}

impl Targets {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Targets::Classes(c) => c.len(),
            Targets::Values(t) => t.rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, Targets::Classes(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Targets::Classes(_) => "class-index",
            Targets::Values(_) => "floating-point",
        }
    }

    pub fn select(&self, indices: &[usize]) -> Targets {
        match self {
            Targets::Classes(c) => Targets::Classes(indices.iter().map(|&i| c[i]).collect()),
            Targets::Values(t) => Targets::Values(t.select_rows(indices)),
        }
    }
}

impl LossKind {
    /// Scalar loss of `prediction` against `targets`, recorded on `tape`.
    pub fn compute(&self, tape: &mut Tape, prediction: BufId, targets: &Targets) -> Result<BufId> {
        match (self, targets) {
            (LossKind::CrossEntropy, Targets::Classes(classes)) => cross_entropy(tape, prediction, classes),
            (LossKind::Mse, Targets::Values(values)) => mse(tape, prediction, values),
            (LossKind::CrossEntropy, t) => Err(MetaError::UnsupportedTargets { rule: "cross_entropy", kind: t.kind_name() }),
            (LossKind::Mse, t) => Err(MetaError::UnsupportedTargets { rule: "mse", kind: t.kind_name() }),
        }
    }
}

/// -mean_i log softmax(logits_i)[class_i]
pub fn cross_entropy(tape: &mut Tape, logits: BufId, classes: &[usize]) -> Result<BufId> {
    let shape = tape.shape(logits).to_vec();
    let (rows, cols) = match shape[..] {
        [r, c] => (r, c),
        _ => return Err(MetaError::ShapeMismatch { op: "cross_entropy", left: shape.clone(), right: vec![classes.len(), 0] }),
    };
    if rows != classes.len() || classes.iter().any(|&c| c >= cols) {
        return Err(MetaError::ShapeMismatch { op: "cross_entropy", left: shape, right: vec![classes.len()] });
    }
    let onehot = batch_one_hot(classes, cols);
    let onehot = tape.tensor(&onehot);
    let log_probs = tape.log_softmax_rows(logits)?;
    let picked = tape.mul(log_probs, onehot)?;
    let total = tape.sum(picked);
    Ok(tape.scale(total, -1.0 / rows.max(1) as f32))
}

/// mean((prediction - target)^2)
pub fn mse(tape: &mut Tape, prediction: BufId, target: &Tensor) -> Result<BufId> {
    if tape.shape(prediction) != target.shape.as_slice() {
        return Err(MetaError::ShapeMismatch {
            op: "mse",
            left: tape.shape(prediction).to_vec(),
            right: target.shape.clone(),
        });
    }
    let t = tape.tensor(target);
    let diff = tape.sub(prediction, t)?;
    let sq = tape.mul(diff, diff)?;
    Ok(tape.mean(sq))
}

/// Class indices → one-hot rows `[len, num_classes]`.
pub fn batch_one_hot(classes: &[usize], num_classes: usize) -> Tensor {
    let mut out = Tensor::zeros(&[classes.len(), num_classes]);
    for (i, &c) in classes.iter().enumerate() {
        out.data[i * num_classes + c] = 1.0;
    }
    out
}

/// One-hot (or score) rows → class indices, by row argmax.
pub fn undo_onehot(onehot: &Tensor) -> Vec<usize> {
    tensor::argmax_rows(&onehot.data, onehot.rows(), onehot.row_len())
}

/// Fraction of rows whose argmax equals the target class. 0 for an empty batch.
pub fn compute_accuracy(logits: &Tensor, classes: &[usize]) -> f32 {
    prediction_accuracy(&undo_onehot(logits), classes)
}

/// Fraction of predictions equal to the target class. 0 for an empty batch.
pub fn prediction_accuracy(predicted: &[usize], classes: &[usize]) -> f32 {
    if classes.is_empty() {
        return 0.0;
    }
    let correct = predicted.iter().zip(classes.iter()).filter(|(p, t)| p == t).count();
    correct as f32 / classes.len() as f32
}
