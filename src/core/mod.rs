//! Core system types and foundations
//!
//! This module contains the fundamental building blocks shared by every
//! layer: identity and time types, error handling and configuration.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items
pub use config::{Config, SessionConfig};
pub use error::{DirectoryError, Error, NegotiationError, Result, TransportError};
pub use types::{BoxFuture, Clock, ManualClock, Notify, PeerId, Role, RolePrefix, SystemClock, Timestamp};
