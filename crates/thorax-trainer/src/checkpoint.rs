//! Durable training snapshots.
//!
//! A checkpoint is a directory `{base}/epoch_{N}_{run_tag}/` holding the
//! model parameters and the optimizer moments as safetensors plus a small
//! JSON metadata file (epoch index, best validation loss, optimizer step
//! count). A missing or unreadable bundle is fatal when a restore was
//! requested.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use thorax_core::{ChestClassifier, Result, ThoraxError};

use crate::optimizer::Adam;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const META_FILE: &str = "meta.json";

/// Training progress recorded alongside the weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// 1-based epoch index the snapshot was taken after.
    pub epoch: usize,
    /// Best validation loss observed so far, i.e. the loss that triggered
    /// this save.
    pub best_val_loss: f32,
    /// Optimizer step counter, restored for bias correction on resume.
    pub optimizer_step: usize,
}

/// Directory for the checkpoint of `epoch` under `base`, suffixed with the
/// caller-supplied run identifier.
pub fn checkpoint_dir(base: &Path, epoch: usize, run_tag: &str) -> PathBuf {
    base.join(format!("epoch_{epoch}_{run_tag}"))
}

/// Persist model parameters, optimizer moments, and metadata. Returns the
/// bundle directory.
pub fn save(
    dir: &Path,
    model: &ChestClassifier,
    optimizer: &Adam,
    meta: &CheckpointMeta,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    model.var_map().save(dir.join(MODEL_FILE))?;
    candle_core::safetensors::save(&optimizer.export_state(), dir.join(OPTIMIZER_FILE))?;

    let meta_file = File::create(dir.join(META_FILE))?;
    serde_json::to_writer_pretty(meta_file, meta)
        .map_err(|err| ThoraxError::Checkpoint(format!("failed to write metadata: {err}")))?;

    info!(dir = %dir.display(), epoch = meta.epoch, "checkpoint written");
    Ok(dir.to_path_buf())
}

/// Restore model parameters and optimizer state from a bundle directory.
pub fn load(dir: &Path, model: &ChestClassifier, optimizer: &mut Adam) -> Result<CheckpointMeta> {
    let meta = read_meta(dir)?;
    load_model_weights(dir, model)?;

    let optimizer_path = dir.join(OPTIMIZER_FILE);
    let state = candle_core::safetensors::load(&optimizer_path, model.device())
        .map_err(|err| checkpoint_file_error(&optimizer_path, &err))?;
    optimizer.import_state(&state, meta.optimizer_step)?;

    info!(dir = %dir.display(), epoch = meta.epoch, "checkpoint restored");
    Ok(meta)
}

/// Restore only the model parameters, for evaluation of a trained snapshot.
pub fn load_model_weights(dir: &Path, model: &ChestClassifier) -> Result<()> {
    let model_path = dir.join(MODEL_FILE);
    let tensors = candle_core::safetensors::load(&model_path, model.device())
        .map_err(|err| checkpoint_file_error(&model_path, &err))?;
    model.apply_weights(&tensors, true)?;
    Ok(())
}

/// Metadata of a bundle, without touching the tensors.
pub fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let meta_path = dir.join(META_FILE);
    let meta_file = File::open(&meta_path).map_err(|err| {
        ThoraxError::Checkpoint(format!("cannot open {}: {err}", meta_path.display()))
    })?;
    serde_json::from_reader(meta_file).map_err(|err| {
        ThoraxError::Checkpoint(format!("corrupt metadata {}: {err}", meta_path.display()))
    })
}

fn checkpoint_file_error(path: &Path, err: &candle_core::Error) -> ThoraxError {
    ThoraxError::Checkpoint(format!("cannot read {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_dir_is_templated_with_epoch_and_tag() {
        let dir = checkpoint_dir(Path::new("/tmp/ckpt"), 3, "frontal");
        assert_eq!(dir, PathBuf::from("/tmp/ckpt/epoch_3_frontal"));
    }

    #[test]
    fn missing_bundle_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("epoch_9_none");
        assert!(matches!(
            read_meta(&missing),
            Err(ThoraxError::Checkpoint(_))
        ));
    }
}
