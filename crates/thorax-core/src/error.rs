use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during Thorax core operations.
#[derive(Debug, Error)]
pub enum ThoraxError {
    /// A manifest row could not be parsed into a record.
    #[error("malformed manifest row {row}: {reason}")]
    Manifest {
        /// Zero-based row index (header excluded).
        row: usize,
        /// What was wrong with the row.
        reason: String,
    },

    /// The manifest CSV itself could not be read.
    #[error("manifest read error: {0}")]
    Csv(#[from] csv::Error),

    /// An image referenced by the manifest is missing or undecodable.
    #[error("failed to load image {path}: {reason}")]
    Image {
        /// Path of the offending image file.
        path: PathBuf,
        /// Decoder error message.
        reason: String,
    },

    /// The uncertainty policy table does not match the declared class list.
    #[error("invalid uncertainty policy table: {0}")]
    PolicyTable(String),

    /// Model weights could not be loaded.
    #[error("failed to load model weights: {0}")]
    ModelLoad(String),

    /// A checkpoint bundle is absent, incomplete, or corrupt.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Externally supplied ensemble predictions do not line up with the loader.
    #[error("ensemble prediction mismatch: {0}")]
    Ensemble(String),

    /// Candle ML framework error.
    #[error("ML error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Thorax operations.
pub type Result<T> = std::result::Result<T, ThoraxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ThoraxError::Manifest {
            row: 3,
            reason: "expected 19 columns, found 4".into(),
        };
        assert!(err.to_string().contains("row 3"));

        let err = ThoraxError::PolicyTable("unknown class 'Emphysema'".into());
        assert!(err.to_string().contains("Emphysema"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ThoraxError>();
    }
}
