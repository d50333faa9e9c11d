//! Error types for the detection engines.

use thiserror::Error;

/// Engine and artifact error types.
#[derive(Error, Debug)]
pub enum IdsError {
    /// Artifact or sink I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Vector length does not match what a model or scaler was fit on
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// Bucket index past the end of a sized series
    #[error("Bucket index {index} out of range for series of {len} buckets")]
    IndexOutOfRange { index: usize, len: usize },

    /// A bucket field has no vocabulary family to encode it with
    #[error("Known values for field {field} not present in vocabulary")]
    UnknownField { field: String },

    /// Feature names stored with a baseline disagree with the vocabulary
    #[error("Feature layout mismatch at position {position}: baseline has {stored:?}, vocabulary yields {computed:?}")]
    LayoutMismatch {
        position: usize,
        stored: Option<String>,
        computed: Option<String>,
    },

    /// A model artifact is internally inconsistent
    #[error("Invalid model artifact {name}: {reason}")]
    InvalidArtifact { name: String, reason: String },

    /// Empty input where non-empty was required
    #[error("Empty input: {0}")]
    EmptyInput(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, IdsError>;
