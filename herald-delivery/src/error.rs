//! Typed error handling for delivery operations.
//!
//! The split mirrors how the worker decides on retries: temporary failures
//! are re-attempted with a delay, permanent ones end the task.

use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A single delivery attempt failed at the transport. Retried by the
    /// worker while attempts remain.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The recipient has used up every permitted attempt.
    #[error("Out of attempts for {address} ({tries} tries)")]
    Exhausted { address: String, tries: u32 },

    /// The store failed while recording an outcome. Never retried; an
    /// unpersisted state change acted upon later is a correctness
    /// violation.
    #[error("Store failure: {0}")]
    Store(#[from] herald_store::StoreError),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and the worker should retry.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if this error ends the task permanently.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }
}

/// Errors from a single transport-level send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish a connection to the server.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server closed the connection mid-session.
    #[error("Connection closed by server")]
    Closed,

    /// An operation exceeded the configured timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server answered a command with an error code.
    #[error("Server rejected {command}: {response}")]
    Rejected {
        command: &'static str,
        response: String,
    },

    /// TLS negotiation or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication was refused.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server response could not be parsed.
    #[error("Malformed server response: {0}")]
    Parse(String),

    /// I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
