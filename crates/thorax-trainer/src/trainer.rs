//! Epoch loop: train, validate, checkpoint on improvement.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_nn::loss::binary_cross_entropy_with_logit;
use tracing::{debug, info};

use thorax_core::{BatchLoader, ChestClassifier, Result};

use crate::checkpoint::{self, CheckpointMeta};
use crate::optimizer::{Adam, AdamConfig};

/// Trainer configuration. The compute device is carried by the model; the
/// trainer itself holds no ambient hardware state.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Number of epochs to run.
    pub epochs: usize,
    /// Optimizer hyperparameters.
    pub adam: AdamConfig,
    /// Emit a progress line every this many training batches.
    pub log_every: usize,
    /// Base directory for checkpoint bundles.
    pub checkpoint_dir: PathBuf,
    /// Run identifier appended to every bundle name.
    pub run_tag: String,
    /// Optional bundle to restore model and optimizer state from before the
    /// first epoch. Absent or unreadable bundles are fatal.
    pub resume: Option<PathBuf>,
    /// Reshuffle the training split between epochs when set.
    pub shuffle: bool,
    /// Seed for the epoch shuffles.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            adam: AdamConfig::default(),
            log_every: 100,
            checkpoint_dir: PathBuf::from("checkpoints"),
            run_tag: "run".to_string(),
            resume: None,
            shuffle: true,
            seed: 0,
        }
    }
}

/// Tracks the running minimum validation loss and decides whether a new
/// value warrants persisting a checkpoint. Only strict improvements count.
#[derive(Debug, Default, Clone)]
pub struct BestLossTracker {
    best: Option<f32>,
}

impl BestLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validation loss; returns whether it improved on the running
    /// minimum.
    pub fn observe(&mut self, loss: f32) -> bool {
        match self.best {
            Some(best) if loss >= best => false,
            _ => {
                self.best = Some(loss);
                true
            }
        }
    }

    /// The running minimum, if any loss has been observed.
    pub fn best(&self) -> Option<f32> {
        self.best
    }
}

/// Result of a completed training run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// 1-based epoch index of the best checkpoint, `None` when no epoch
    /// produced a finite validation loss.
    pub best_epoch: Option<usize>,
    /// Best validation loss reached.
    pub best_val_loss: Option<f32>,
    /// Wall-clock duration of each training pass.
    pub epoch_durations: Vec<Duration>,
}

/// Orchestrates the train / validate / checkpoint cycle for one model.
///
/// Owns the optimizer and the checkpoint lifecycle; any candle or I/O error
/// aborts the run without retries.
pub struct Trainer {
    model: ChestClassifier,
    optimizer: Adam,
    config: TrainConfig,
    best: BestLossTracker,
}

impl Trainer {
    /// Set up optimizer and loss, restoring from a checkpoint bundle first
    /// when the configuration names one.
    pub fn new(model: ChestClassifier, config: TrainConfig) -> Result<Self> {
        let mut optimizer = Adam::new(model.named_vars(), config.adam)?;
        if let Some(resume) = &config.resume {
            let meta = checkpoint::load(resume, &model, &mut optimizer)?;
            info!(
                epoch = meta.epoch,
                best_val_loss = meta.best_val_loss,
                "resumed from checkpoint"
            );
        }
        Ok(Self {
            model,
            optimizer,
            config,
            best: BestLossTracker::new(),
        })
    }

    /// Run the configured number of epochs over `train_loader`, validating
    /// against `val_loader` after each, and persisting a checkpoint whenever
    /// the validation loss improves.
    pub fn run(
        &mut self,
        train_loader: &mut BatchLoader<'_>,
        val_loader: &BatchLoader<'_>,
    ) -> Result<TrainOutcome> {
        let mut best_epoch = None;
        let mut epoch_durations = Vec::with_capacity(self.config.epochs);

        for epoch in 1..=self.config.epochs {
            if self.config.shuffle {
                train_loader.shuffle(self.config.seed, epoch);
            }

            let started = Instant::now();
            let train_loss = self.train_epoch(train_loader)?;
            epoch_durations.push(started.elapsed());

            let val_loss = self.validate_epoch(val_loader)?;

            let improved = self.best.observe(val_loss);
            if improved {
                best_epoch = Some(epoch);
                let dir = checkpoint::checkpoint_dir(
                    &self.config.checkpoint_dir,
                    epoch,
                    &self.config.run_tag,
                );
                checkpoint::save(
                    &dir,
                    &self.model,
                    &self.optimizer,
                    &CheckpointMeta {
                        epoch,
                        best_val_loss: val_loss,
                        optimizer_step: self.optimizer.step_count(),
                    },
                )?;
            }
            info!(
                epoch,
                train_loss,
                val_loss,
                marker = if improved { "[save]" } else { "[----]" },
                "epoch complete"
            );
        }

        Ok(TrainOutcome {
            best_epoch,
            best_val_loss: self.best.best(),
            epoch_durations,
        })
    }

    /// The trained model, for evaluation after `run` returns.
    pub fn into_model(self) -> ChestClassifier {
        self.model
    }

    fn train_epoch(&mut self, loader: &BatchLoader<'_>) -> Result<f32> {
        let mut total = 0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let (images, targets) = batch?;
            let logits = self.model.forward_logits_t(&images, true)?;
            let loss = binary_cross_entropy_with_logit(&logits, &targets)?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;

            total += loss.to_scalar::<f32>()?;
            batches += 1;
            if batches % self.config.log_every == 0 {
                debug!(
                    batch = batches,
                    mean_loss = total / batches as f32,
                    "training progress"
                );
            }
        }
        Ok(total / batches.max(1) as f32)
    }

    fn validate_epoch(&self, loader: &BatchLoader<'_>) -> Result<f32> {
        let mut total = 0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let (images, targets) = batch?;
            let logits = self.model.forward_logits_t(&images, false)?;
            let loss = binary_cross_entropy_with_logit(&logits, &targets)?;
            total += loss.to_scalar::<f32>()?;
            batches += 1;
        }
        Ok(total / batches.max(1) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_persists_only_on_strict_improvement() {
        let mut tracker = BestLossTracker::new();
        let losses = [0.9f32, 0.7, 0.8, 0.5];
        let decisions: Vec<bool> = losses.iter().map(|&l| tracker.observe(l)).collect();
        assert_eq!(decisions, vec![true, true, false, true]);
        assert_eq!(tracker.best(), Some(0.5));
    }

    #[test]
    fn tracker_rejects_equal_loss() {
        let mut tracker = BestLossTracker::new();
        assert!(tracker.observe(0.4));
        assert!(!tracker.observe(0.4));
    }
}
