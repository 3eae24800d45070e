//! Per-class AUROC scoring for trained models and ensembled predictions.
//!
//! AUROC is computed with the rank-sum (Mann-Whitney) formulation, with
//! average ranks over tied scores. A class whose ground truth contains only
//! one label value across the evaluation window has no defined ROC curve;
//! such classes are skipped, not treated as errors, and excluded from the
//! mean.

use std::fmt;

use tracing::info;

use crate::dataset::BatchLoader;
use crate::error::{Result, ThoraxError};
use crate::model::ChestClassifier;

/// Area under the ROC curve for one class column.
///
/// Returns `None` when the ground truth has no positive or no negative
/// examples, or when `truth` and `scores` disagree in length.
pub fn roc_auc(truth: &[f32], scores: &[f32]) -> Option<f64> {
    if truth.is_empty() || truth.len() != scores.len() {
        return None;
    }
    let positives = truth.iter().filter(|&&t| t > 0.5).count();
    let negatives = truth.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Average ranks across tie groups, 1-based.
    let mut rank_sum_positive = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let average_rank = (i + j + 2) as f64 / 2.0;
        for &index in &order[i..=j] {
            if truth[index] > 0.5 {
                rank_sum_positive += average_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((rank_sum_positive - p * (p + 1.0) / 2.0) / (p * n))
}

/// Per-class AUROC scores plus their mean over the defined classes.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    /// `(class name, score)` pairs; `None` marks a degenerate class.
    pub per_class: Vec<(String, Option<f64>)>,
    /// Arithmetic mean over the defined scores, `None` if every class was
    /// degenerate.
    pub mean: Option<f64>,
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean {
            Some(mean) => writeln!(f, "AUROC mean: {mean:.4}")?,
            None => writeln!(f, "AUROC mean: undefined (no class had both label values)")?,
        }
        for (name, score) in &self.per_class {
            match score {
                Some(score) => writeln!(f, "  {name}: {score:.4}")?,
                None => writeln!(f, "  {name}: skipped (single-valued ground truth)")?,
            }
        }
        Ok(())
    }
}

/// Score prediction columns against ground-truth columns, one AUROC per
/// class. Shared by the model evaluator and the ensemble aggregator so both
/// paths are scored identically.
pub fn score_columns(
    truths: &[Vec<f32>],
    predictions: &[Vec<f32>],
    class_names: &[String],
) -> EvalReport {
    let class_count = class_names.len();
    let mut per_class = Vec::with_capacity(class_count);
    let mut defined = Vec::new();
    for (class, name) in class_names.iter().enumerate() {
        let truth: Vec<f32> = truths.iter().map(|row| row[class]).collect();
        let scores: Vec<f32> = predictions.iter().map(|row| row[class]).collect();
        let auc = roc_auc(&truth, &scores);
        if let Some(auc) = auc {
            defined.push(auc);
        }
        per_class.push((name.clone(), auc));
    }
    let mean = if defined.is_empty() {
        None
    } else {
        Some(defined.iter().sum::<f64>() / defined.len() as f64)
    };
    EvalReport { per_class, mean }
}

/// Run forward-only inference over every batch of `loader`, concatenate
/// predictions and ground truths in iteration order, and score per-class
/// AUROC.
pub fn evaluate(
    model: &ChestClassifier,
    loader: &BatchLoader<'_>,
    class_names: &[String],
) -> Result<EvalReport> {
    let mut truths: Vec<Vec<f32>> = Vec::with_capacity(loader.num_samples());
    let mut predictions: Vec<Vec<f32>> = Vec::with_capacity(loader.num_samples());

    for batch in loader.iter() {
        let (images, targets) = batch?;
        let probs = model.forward_t(&images, false)?;
        predictions.extend(probs.to_vec2::<f32>()?);
        truths.extend(targets.to_vec2::<f32>()?);
    }
    info!(samples = truths.len(), "inference complete");

    Ok(score_columns(&truths, &predictions, class_names))
}

/// Score externally supplied per-sample prediction vectors against the
/// loader's ground truths, with the same per-class AUROC procedure as
/// [`evaluate`]. No model inference occurs.
///
/// `predictions` must match the loader's iteration order: one probability
/// vector per sample, one entry per class.
pub fn aggregate(
    predictions: &[Vec<f32>],
    loader: &BatchLoader<'_>,
    class_names: &[String],
) -> Result<EvalReport> {
    let truths = loader.label_rows();
    if predictions.len() != truths.len() {
        return Err(ThoraxError::Ensemble(format!(
            "{} prediction rows for {} samples",
            predictions.len(),
            truths.len()
        )));
    }
    let class_count = class_names.len();
    if let Some(row) = predictions.iter().find(|row| row.len() != class_count) {
        return Err(ThoraxError::Ensemble(format!(
            "prediction row has {} entries, expected {class_count}",
            row.len()
        )));
    }
    Ok(score_columns(&truths, predictions, class_names))
}
