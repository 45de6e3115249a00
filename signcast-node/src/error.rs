use thiserror::Error;

/// Errors produced by the persistence layer and the Program Store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Imported or stored data did not have the expected top-level shape.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Errors returned by scheduler reconfiguration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Playback speed must be greater than zero")]
    InvalidPlaybackSpeed,
}

pub type Result<T> = std::result::Result<T, StoreError>;
