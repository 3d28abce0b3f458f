//! Error types for the generation decoder.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Every variant is fatal for the caller: the decoder never retries or skips
/// a step, so errors carry enough context to find the offending tensor or key.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration or missing pretrained files.
    #[error("config: {0}")]
    Config(String),

    /// A tensor does not have the shape its contract requires.
    #[error("shape mismatch for `{tensor}`: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: String,
        actual: Vec<usize>,
    },

    /// The batch lacks a field the step needs.
    #[error("batch is missing `{0}`")]
    MissingBatchField(&'static str),

    /// Checkpoint key missing, unexpected or incompatible.
    #[error("checkpoint key `{key}`: {reason}")]
    Checkpoint { key: String, reason: String },

    /// The step produced a NaN or infinite loss.
    #[error("non-finite loss {loss} at timestep {timestep}")]
    NonFiniteLoss { loss: f32, timestep: f64 },

    /// Tokenizer error (tokenizers::Error doesn't impl std::error::Error).
    #[error("tokenizer: {0}")]
    Tokenizer(String),
}

impl Error {
    pub(crate) fn shape(tensor: impl Into<String>, expected: impl Into<String>, actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            tensor: tensor.into(),
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn checkpoint(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Checkpoint {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(error.to_string())
    }
}
