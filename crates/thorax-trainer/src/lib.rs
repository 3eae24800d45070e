//! # Thorax Trainer
//!
//! Training workflows for the Thorax chest radiograph classifier: the
//! epoch train/validate loop with best-validation-loss checkpointing, an
//! Adam optimizer with round-trippable state, and the `train` / `evaluate`
//! command line binaries.

pub mod checkpoint;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::CheckpointMeta;
pub use optimizer::{Adam, AdamConfig};
pub use trainer::{BestLossTracker, TrainConfig, TrainOutcome, Trainer};
