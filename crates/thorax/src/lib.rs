//! # Thorax
//!
//! Umbrella crate for the Thorax chest radiograph classifier. Re-exports the
//! dataset, model, and evaluation API from `thorax-core` and the training
//! loop from `thorax-trainer`.

pub use thorax_core::{
    BatchLoader, ChestClassifier, ChestXrayDataset, EvalReport, LabelPolicy, ManifestRecord,
    Result, ThoraxError, TransformPipeline, UncertainPolicy, aggregate, evaluate, resolve_cell,
    roc_auc,
};
pub use thorax_trainer::{
    Adam, AdamConfig, BestLossTracker, CheckpointMeta, TrainConfig, TrainOutcome, Trainer,
};
