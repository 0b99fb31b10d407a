//! Error types for voicetune operations.

use thiserror::Error;

/// Result type for voicetune operations.
pub type Result<T> = std::result::Result<T, VoiceTuneError>;

/// Errors that can occur while preparing data or fine-tuning.
#[derive(Error, Debug)]
pub enum VoiceTuneError {
    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Failed to download: {0}")]
    DownloadError(String),

    #[error("Audio processing error: {0}")]
    AudioError(String),

    #[error("Text processing error: {0}")]
    ProcessingError(String),

    #[error("Dataset error: {0}")]
    DatasetError(String),

    #[error("Training failed: {0}")]
    TrainingError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<candle_core::Error> for VoiceTuneError {
    fn from(e: candle_core::Error) -> Self {
        VoiceTuneError::TrainingError(e.to_string())
    }
}

impl From<std::io::Error> for VoiceTuneError {
    fn from(e: std::io::Error) -> Self {
        VoiceTuneError::IoError(e.to_string())
    }
}

impl From<anyhow::Error> for VoiceTuneError {
    fn from(e: anyhow::Error) -> Self {
        VoiceTuneError::TrainingError(e.to_string())
    }
}

impl From<serde_json::Error> for VoiceTuneError {
    fn from(e: serde_json::Error) -> Self {
        VoiceTuneError::ConfigError(e.to_string())
    }
}

impl From<csv::Error> for VoiceTuneError {
    fn from(e: csv::Error) -> Self {
        VoiceTuneError::DatasetError(e.to_string())
    }
}
