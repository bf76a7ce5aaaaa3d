//! Error types for the patter voice dispatch system

use thiserror::Error;

/// Result type alias for voice dispatch operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while dispatching a conversation turn
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Turn timed out after {0} ms")]
    Timeout(u64),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Keyword table load error: {0}")]
    TableLoad(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
