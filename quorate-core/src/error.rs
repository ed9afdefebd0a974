use thiserror::Error;

/// All errors produced by quorate-core.
#[derive(Debug, Error)]
pub enum QuorateError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no matching input device found")]
    NoInputDevice,

    #[error("engine is already recording")]
    AlreadyRecording,

    #[error("engine is not recording")]
    NotRecording,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("output error: {0}")]
    Output(String),

    #[error("clipboard error: {0}")]
    Clipboard(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QuorateError>;
