pub mod error;
pub mod tensor;
pub mod tape;
pub mod surrogate;
pub mod params;
pub mod loss;
pub mod model;
pub mod mlp;
pub mod lif;
pub mod plasticity;
pub mod learning_engine;
pub mod soel;
pub mod quantize;
pub mod optimizer;
pub mod scheduler;
pub mod config;
pub mod task;
pub mod maml;
pub mod reptile;
pub mod gradient;

pub use config::MetaLearnerConfig;
pub use error::{MetaError, Result};
pub use loss::{LossKind, Targets};
pub use maml::{MeanResults, MetaLearner, OuterLossResults};
pub use model::{FinalLayer, MetaModule, Mode, SpikeProbe};
pub use params::{ParamMap, ParamStore};
pub use plasticity::{AnchorRegularized, GradientStep, PlasticityRule};
pub use soel::{LoihiSoel, Soel};
pub use tape::{BufId, Tape};
pub use task::{TaskBatch, TaskSplit};
pub use tensor::Tensor;
