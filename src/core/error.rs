//! Error types and handling for racenet
//!
//! Errors are grouped by where they come from: the directory (discovery and
//! signaling delivery), connection negotiation, and the peer transport. None
//! of them is allowed to escape the steady-state loop; they are logged and
//! the offending envelope, frame or peer is dropped.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for racenet
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory service errors (discovery, mailbox delivery)
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Offer/answer/ICE exchange errors
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Peer transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame or envelope (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Directory service errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DirectoryError {
    /// The store could not be reached at all
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// A record or mailbox that must exist does not
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A mailbox write was rejected
    #[error("Mailbox write failed: {0}")]
    Delivery(String),
}

/// Errors raised while exchanging offers, answers and ICE candidates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    /// A signal arrived for a peer with no matching connection
    #[error("No connection for peer {0}")]
    UnknownPeer(String),

    /// A signal arrived in a state that cannot accept it
    #[error("Unexpected {signal} while {state}")]
    OutOfOrder {
        /// Kind of signal received
        signal: &'static str,
        /// Connection state at the time
        state: String,
    },

    /// Envelope body is missing its payload or carries the wrong one
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Peer transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection could not be established or was lost
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Data channel is missing or not open
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Session description or candidate rejected by the transport
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Operation not valid in the link's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
