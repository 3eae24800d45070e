//! Evaluation CLI: per-class AUROC over a held-out manifest.
//!
//! Two modes share the same scoring path. The default restores a checkpoint
//! and runs inference; `--ensemble` skips inference and scores precomputed
//! per-sample prediction vectors (a JSON array of per-class probability
//! arrays, in manifest order) against the same ground truths.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::Parser;
use tracing::info;

use thorax_core::{
    BatchLoader, ChestClassifier, ChestXrayDataset, LabelPolicy, TransformPipeline, aggregate,
    evaluate,
};
use thorax_trainer::checkpoint;

/// CLI arguments
#[derive(Parser)]
#[command(name = "evaluate")]
#[command(about = "Score a trained Thorax model or an ensemble prediction file")]
#[command(version)]
struct Cli {
    /// Test manifest CSV
    #[arg(long)]
    test_manifest: PathBuf,

    /// Root directory that manifest image paths are relative to
    #[arg(long, default_value = ".")]
    image_root: PathBuf,

    /// Checkpoint bundle to restore model weights from
    #[arg(long, required_unless_present = "ensemble")]
    checkpoint: Option<PathBuf>,

    /// JSON file of precomputed per-sample prediction vectors; skips model
    /// inference entirely
    #[arg(long, conflicts_with = "checkpoint")]
    ensemble: Option<PathBuf>,

    /// Batch size
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Compute device: "cpu" or "cuda:<index>"
    #[arg(long, default_value = "cpu")]
    device: String,
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
    let policy = LabelPolicy::chexpert_default();
    let dataset = ChestXrayDataset::from_manifest(
        &cli.test_manifest,
        &cli.image_root,
        &policy,
        TransformPipeline::default(),
    )
    .context("failed to load test manifest")?;
    let loader = BatchLoader::new(&dataset, cli.batch_size, device.clone());
    info!(samples = dataset.len(), "test manifest loaded");

    let report = if let Some(ensemble) = &cli.ensemble {
        let file = File::open(ensemble)
            .with_context(|| format!("cannot open predictions {}", ensemble.display()))?;
        let predictions: Vec<Vec<f32>> = serde_json::from_reader(file)
            .with_context(|| format!("corrupt predictions {}", ensemble.display()))?;
        println!("<<< Ensemble Test Results >>>");
        aggregate(&predictions, &loader, policy.class_names())?
    } else {
        let bundle = cli
            .checkpoint
            .as_ref()
            .expect("clap enforces checkpoint when no ensemble file is given");
        let model = ChestClassifier::new(policy.class_count(), &device)?;
        checkpoint::load_model_weights(bundle, &model)?;
        println!("<<< Model Test Results >>>");
        evaluate(&model, &loader, policy.class_names())?
    };

    print!("{report}");
    Ok(())
}
