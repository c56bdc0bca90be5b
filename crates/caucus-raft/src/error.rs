//! Error types.
//!
//! Consensus-level "failures" (a denied vote, a rejected append) are not
//! errors: they travel through the normal reply messages. `RaftError` covers
//! API misuse and collaborator failures only.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    /// A timer was started before `connect` supplied its callback.
    #[error("{timer} timer started before a callback was connected")]
    TimerNotConnected { timer: &'static str },

    /// Configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Durable store I/O failure.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Durable state could not be encoded or decoded.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, RaftError>;
