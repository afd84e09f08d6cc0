//! Error types for Jarvis
//!
//! Pipeline outcomes the user sees as notices (rejected captures, cancelled
//! turns, unreachable endpoints) are plain enums in their own modules. This
//! type covers the failures that stop a component from working at all.

use thiserror::Error;

/// Result type alias for Jarvis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Jarvis
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Whisper model lookup, download or load error
    #[error("model error: {0}")]
    Model(String),

    /// Speech-to-text error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Global hotkey listener error
    #[error("hotkey error: {0}")]
    Hotkey(String),

    /// Launching an external action failed
    #[error("launch error: {0}")]
    Launch(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
