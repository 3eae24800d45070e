//! Training CLI for the Thorax classifier.
//!
//! Loads train/validation manifests, builds the model on the requested
//! device, and runs the epoch loop with best-validation-loss checkpointing.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::Parser;
use tracing::info;

use thorax_core::{
    BatchLoader, ChestClassifier, ChestXrayDataset, LabelPolicy, TransformPipeline, UncertainPolicy,
    labels::CLASS_NAMES,
};
use thorax_trainer::{AdamConfig, TrainConfig, Trainer};

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train the Thorax chest radiograph classifier")]
#[command(version)]
struct Cli {
    /// Training manifest CSV
    #[arg(long)]
    train_manifest: PathBuf,

    /// Validation manifest CSV
    #[arg(long)]
    valid_manifest: PathBuf,

    /// Root directory that manifest image paths are relative to
    #[arg(long, default_value = ".")]
    image_root: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value_t = 3)]
    epochs: usize,

    /// Batch size
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Learning rate
    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    /// Checkpoint base directory
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Run identifier appended to checkpoint bundle names
    #[arg(long, default_value = "run")]
    run_tag: String,

    /// Resume model and optimizer state from this checkpoint bundle
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Pretrained backbone weights (safetensors, torchvision naming)
    #[arg(long)]
    pretrained: Option<PathBuf>,

    /// Compute device: "cpu" or "cuda:<index>"
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Classes whose uncertain labels resolve to positive
    #[arg(long = "u-ones", value_delimiter = ',', default_values_t = [
        "Pleural Effusion".to_string(),
        "Support Devices".to_string(),
    ])]
    u_ones: Vec<String>,

    /// Shuffle seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log a training progress line every N batches
    #[arg(long, default_value_t = 100)]
    log_every: usize,
}

fn parse_device(spec: &str) -> Result<Device> {
    match spec {
        "cpu" => Ok(Device::Cpu),
        other => {
            let Some(index) = other.strip_prefix("cuda:") else {
                bail!("unknown device {other:?} (expected \"cpu\" or \"cuda:<index>\")");
            };
            let index: usize = index
                .parse()
                .with_context(|| format!("invalid cuda index in {other:?}"))?;
            Ok(Device::new_cuda(index)?)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let device = parse_device(&cli.device)?;
    info!(device = %cli.device, "device selected");

    let table: Vec<(&str, UncertainPolicy)> = cli
        .u_ones
        .iter()
        .map(|name| (name.as_str(), UncertainPolicy::AssignOne))
        .collect();
    let policy = LabelPolicy::from_table(&CLASS_NAMES, &table)
        .context("uncertainty policy table does not match the class list")?;

    let transform = TransformPipeline::default();
    let train_set = ChestXrayDataset::from_manifest(
        &cli.train_manifest,
        &cli.image_root,
        &policy,
        transform.clone(),
    )
    .context("failed to load training manifest")?;
    let valid_set =
        ChestXrayDataset::from_manifest(&cli.valid_manifest, &cli.image_root, &policy, transform)
            .context("failed to load validation manifest")?;
    info!(
        train = train_set.len(),
        valid = valid_set.len(),
        "manifests loaded"
    );

    let model = ChestClassifier::new(policy.class_count(), &device)?;
    if let Some(pretrained) = &cli.pretrained {
        let applied = model.load_pretrained_backbone(pretrained)?;
        info!(applied, "pretrained backbone loaded");
    }

    let mut train_loader = BatchLoader::new(&train_set, cli.batch_size, device.clone());
    let val_loader = BatchLoader::new(&valid_set, cli.batch_size, device);

    let config = TrainConfig {
        epochs: cli.epochs,
        adam: AdamConfig {
            learning_rate: cli.learning_rate,
            ..Default::default()
        },
        log_every: cli.log_every,
        checkpoint_dir: cli.checkpoint_dir,
        run_tag: cli.run_tag,
        resume: cli.resume,
        shuffle: true,
        seed: cli.seed,
    };

    let mut trainer = Trainer::new(model, config)?;
    let outcome = trainer.run(&mut train_loader, &val_loader)?;

    match outcome.best_epoch {
        Some(epoch) => info!(
            best_epoch = epoch,
            best_val_loss = outcome.best_val_loss,
            "training complete"
        ),
        None => info!("training complete, no checkpoint written"),
    }
    for (i, duration) in outcome.epoch_durations.iter().enumerate() {
        info!(epoch = i + 1, seconds = duration.as_secs_f64(), "epoch duration");
    }

    Ok(())
}
