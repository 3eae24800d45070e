//! # Thorax Core
//!
//! The heart of the Thorax chest radiograph engine. Provides uncertain-label
//! resolution, manifest-driven dataset loading, the DenseNet-121 multi-label
//! classifier, and per-class AUROC evaluation (for live models and for
//! precomputed ensemble predictions).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use thorax_core::{
//!     BatchLoader, ChestClassifier, ChestXrayDataset, LabelPolicy, TransformPipeline, evaluate,
//! };
//!
//! let policy = LabelPolicy::chexpert_default();
//! let dataset = ChestXrayDataset::from_manifest(
//!     "CheXpert-v1.0-small/valid.csv".as_ref(),
//!     ".".as_ref(),
//!     &policy,
//!     TransformPipeline::default(),
//! )?;
//! let loader = BatchLoader::new(&dataset, 16, Device::Cpu);
//! let model = ChestClassifier::new(policy.class_count(), &Device::Cpu)?;
//! let report = evaluate(&model, &loader, policy.class_names())?;
//! println!("{report}");
//! # Ok::<(), thorax_core::ThoraxError>(())
//! ```

pub mod dataset;
pub mod error;
pub mod eval;
pub mod labels;
pub mod model;

// Re-export primary API
pub use dataset::{BatchLoader, ChestXrayDataset, ManifestRecord, TransformPipeline};
pub use error::{Result, ThoraxError};
pub use eval::{EvalReport, aggregate, evaluate, roc_auc, score_columns};
pub use labels::{CLASS_NAMES, LabelPolicy, UncertainPolicy, resolve_cell};
pub use model::{BACKBONE_WIDTH, ChestClassifier};
