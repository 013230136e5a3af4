/// Crate-wide error type.
///
/// Configuration errors (missing collaborators, incompatible flags) and
/// data-shape errors surface here and are returned to the caller unrecovered.
/// Absent or all-zero gradients are NOT errors: they are reported through
/// `tracing::warn!` and the parameter passes through unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("trying to train while the optimizer is None; construct the meta-learner with an outer-loop optimizer")]
    MissingOptimizer,

    #[error("the task batch contains no tasks")]
    EmptyBatch,

    #[error("task count mismatch: {train} training splits vs {test} test splits")]
    TaskCountMismatch { train: usize, test: usize },

    #[error("tasks in one batch mix classification and regression targets")]
    MixedTaskKinds,

    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("parameter `{0}` not found")]
    MissingParameter(String),

    #[error("key set mismatch: expected {expected} entries, found {found}")]
    KeySetMismatch { expected: usize, found: usize },

    #[error("{op} needs a scalar, got shape {shape:?}")]
    NonScalar { op: &'static str, shape: Vec<usize> },

    #[error("{rule} does not support {kind} targets")]
    UnsupportedTargets { rule: &'static str, kind: &'static str },

    #[error("incompatible configuration: {0}")]
    IncompatibleConfig(&'static str),

    #[error("timing mismatch: expected {expected} time steps, trace has {found}")]
    TimingMismatch { expected: usize, found: usize },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetaError>;
