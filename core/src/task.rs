/// Few-shot task batches.
///
/// A batch holds aligned train/test splits for each task. Batch-level checks
/// (matching task counts, one target kind for the whole batch) happen in
/// `validate`, before any adaptation runs.

use crate::error::{MetaError, Result};
use crate::loss::Targets;
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct TaskSplit {
    /// `[samples, ...]`
    pub inputs: Tensor,
    pub targets: Targets,
}

impl TaskSplit {
    pub fn new(inputs: Tensor, targets: Targets) -> Self {
        TaskSplit { inputs, targets }
    }

    pub fn len(&self) -> usize {
        self.inputs.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, indices: &[usize]) -> TaskSplit {
        TaskSplit {
            inputs: self.inputs.select_rows(indices),
            targets: self.targets.select(indices),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskBatch {
    pub train: Vec<TaskSplit>,
    pub test: Vec<TaskSplit>,
}

impl TaskBatch {
    pub fn new(train: Vec<TaskSplit>, test: Vec<TaskSplit>) -> Self {
        TaskBatch { train, test }
    }

    pub fn num_tasks(&self) -> usize {
        self.test.len()
    }

    /// Checks the batch and returns whether it is a classification batch.
    pub fn validate(&self) -> Result<bool> {
        if self.test.is_empty() {
            return Err(MetaError::EmptyBatch);
        }
        if self.train.len() != self.test.len() {
            return Err(MetaError::TaskCountMismatch { train: self.train.len(), test: self.test.len() });
        }
        let classification = self.test[0].targets.is_classification();
        let consistent = self.train.iter().chain(self.test.iter())
            .all(|s| s.targets.is_classification() == classification);
        if !consistent {
            return Err(MetaError::MixedTaskKinds);
        }
        for split in self.train.iter().chain(self.test.iter()) {
            if split.inputs.rows() != split.targets.len() {
                return Err(MetaError::ShapeMismatch {
                    op: "task_split",
                    left: split.inputs.shape.clone(),
                    right: vec![split.targets.len()],
                });
            }
        }
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(n: usize) -> TaskSplit {
        TaskSplit::new(Tensor::zeros(&[n, 2]), Targets::Classes(vec![0; n]))
    }

    #[test]
    fn test_validate_classification() {
        let batch = TaskBatch::new(vec![split(3), split(3)], vec![split(2), split(2)]);
        assert!(batch.validate().unwrap());
        assert_eq!(batch.num_tasks(), 2);
    }

    #[test]
    fn test_validate_errors() {
        assert!(matches!(TaskBatch::default().validate(), Err(MetaError::EmptyBatch)));
        let b = TaskBatch::new(vec![split(3)], vec![split(2), split(2)]);
        assert!(matches!(b.validate(), Err(MetaError::TaskCountMismatch { train: 1, test: 2 })));
        let reg = TaskSplit::new(Tensor::zeros(&[2, 2]), Targets::Values(Tensor::zeros(&[2, 1])));
        let mixed = TaskBatch::new(vec![split(2)], vec![reg]);
        assert!(matches!(mixed.validate(), Err(MetaError::MixedTaskKinds)));
    }

    #[test]
    fn test_select_keeps_alignment() {
        let s = TaskSplit::new(
            Tensor::new(vec![0.0, 1.0, 2.0], vec![3, 1]),
            Targets::Classes(vec![5, 6, 7]),
        );
        let picked = s.select(&[2, 0]);
        assert_eq!(picked.inputs.data, vec![2.0, 0.0]);
        assert_eq!(picked.targets, Targets::Classes(vec![7, 5]));
    }
}
