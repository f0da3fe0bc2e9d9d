//! Error types for Clarion

use std::fmt;

use thiserror::Error;

/// Result type alias for Clarion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Opening the provider connection
    Connect,
    /// Writing a frame or request
    Send,
    /// Reading a frame or response
    Receive,
    /// Turning a payload into samples
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in Clarion
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad endpoint)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network transport failure, terminal for the current utterance
    #[error("transport error during {stage}: {message}")]
    Transport {
        /// Stage the failure happened in
        stage: Stage,
        /// Underlying cause
        message: String,
    },

    /// Provider answered with a non-success status
    #[error("provider error: {0}")]
    Provider(String),

    /// Request exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Utterance was stopped or superseded
    #[error("cancelled")]
    Cancelled,

    /// Audio device or sink error
    #[error("audio error: {0}")]
    Audio(String),

    /// Audio payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Build a transport error for `stage`
    pub fn transport(stage: Stage, message: impl fmt::Display) -> Self {
        Self::Transport {
            stage,
            message: message.to_string(),
        }
    }

    /// Stage the error belongs to, when it has one
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Transport { stage, .. } => Some(*stage),
            Self::Decode(_) => Some(Stage::Decode),
            _ => None,
        }
    }

    /// Whether this error is a normal terminal transition rather than a failure
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
