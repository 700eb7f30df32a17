//! Error types for the ScooterMap environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Transport operation failed (broker unreachable, ack rejected, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport has been shut down
    #[error("Transport closed")]
    Closed,

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
