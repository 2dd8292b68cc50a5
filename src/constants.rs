//! Global constants used throughout the racenet codebase
//!
//! Tunables that sessions may want to change live in `core::config`; the
//! values here are either wire-level names or the defaults those config
//! fields start from.

/// Letters used in generated peer ids (no `i`, `l` or `o`)
pub const PEER_ID_LETTERS: &[u8] = b"abcdefghjkmnpqrstuvwxyz";

/// Digits used in generated peer ids (no `0` or `1`)
pub const PEER_ID_DIGITS: &[u8] = b"23456789";

/// Prefix carried by peer ids minted for the host role
pub const HOST_ID_PREFIX: &str = "game_";

/// Prefix carried by peer ids minted for the client role
pub const CLIENT_ID_PREFIX: &str = "client_";

/// Message type of the only frame exchanged over data channels
pub const STATE_UPDATE: &str = "state-update";

/// Label of the single ordered, reliable data channel per connection
pub const DEFAULT_CHANNEL_LABEL: &str = "gameData";

/// Broadcast / uplink rate
pub const DEFAULT_TICK_RATE_HZ: u64 = 20;

/// A ServerRecord older than this is considered abandoned (seconds)
pub const DEFAULT_MAX_SERVER_AGE_SECS: u64 = 60;

/// Interval between ServerRecord heartbeats while hosting (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A RemoteObject with no update for this long is inactive (milliseconds)
pub const DEFAULT_LIVENESS_WINDOW_MS: u64 = 5_000;

/// Public STUN servers offered to real transports
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];
