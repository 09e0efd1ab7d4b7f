//! Error type shared by every voxlink component.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for voice session operations
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone or speaker could not be opened or failed mid-stream
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Malformed frame or an error reported by the bridge
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, VoiceError>;
