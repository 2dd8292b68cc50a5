//! Shared type definitions
//!
//! Peer identity, node role, wall-clock access and the small aliases used by
//! the asynchronous contracts (directory, transport).

use crate::constants::{CLIENT_ID_PREFIX, HOST_ID_PREFIX, PEER_ID_DIGITS, PEER_ID_LETTERS};
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch milliseconds
pub type Timestamp = u64;

/// Boxed, sendable future returned by the async contracts
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Change-notification sink handed to the directory and transport layers.
///
/// Sinks must not do any work themselves beyond forwarding the value; the
/// session's sinks only push onto its event queue.
pub type Notify<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Role namespace a peer id is minted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePrefix {
    /// `game_` ids, advertised in the directory
    Host,
    /// `client_` ids
    Client,
}

impl RolePrefix {
    /// The literal prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            RolePrefix::Host => HOST_ID_PREFIX,
            RolePrefix::Client => CLIENT_ID_PREFIX,
        }
    }
}

/// Opaque peer identifier, e.g. `game_hk742` or `client_ab239`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Mint a fresh id in the given role namespace.
    ///
    /// Two letters then three digits, drawn from alphabets without the
    /// visually ambiguous `o`, `i`, `l`, `0` and `1`.
    pub fn mint(prefix: RolePrefix) -> Self {
        let mut rng = rng();
        let mut id = String::with_capacity(prefix.as_str().len() + 5);
        id.push_str(prefix.as_str());
        for _ in 0..2 {
            id.push(PEER_ID_LETTERS[rng.random_range(0..PEER_ID_LETTERS.len())] as char);
        }
        for _ in 0..3 {
            id.push(PEER_ID_DIGITS[rng.random_range(0..PEER_ID_DIGITS.len())] as char);
        }
        PeerId(id)
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Role namespace this id was minted in, if it carries a known prefix
    pub fn prefix(&self) -> Option<RolePrefix> {
        if self.0.starts_with(HOST_ID_PREFIX) {
            Some(RolePrefix::Host)
        } else if self.0.starts_with(CLIENT_ID_PREFIX) {
            Some(RolePrefix::Client)
        } else {
            None
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Role of this node in the star topology
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Role {
    /// Not yet elected, or between a disconnect and the next discovery
    #[default]
    Undetermined,
    /// Center of the star; advertises a ServerRecord and relays state
    Host,
    /// Connected (or connecting) to the given host
    Client {
        /// Id of the host this client joined
        host: PeerId,
    },
}

impl Role {
    /// Whether this node is hosting
    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host)
    }

    /// Host this node is a client of, if any
    pub fn host(&self) -> Option<&PeerId> {
        match self {
            Role::Client { host } => Some(host),
            _ => None,
        }
    }
}

/// Source of wall-clock time in epoch milliseconds.
///
/// Liveness and staleness are judged against this clock, so tests can pin
/// it with [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> Timestamp;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ms`
    pub fn new(start_ms: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now_ms: Timestamp) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn minted_ids_carry_role_prefix() {
        let host = PeerId::mint(RolePrefix::Host);
        let client = PeerId::mint(RolePrefix::Client);
        assert!(host.as_str().starts_with("game_"));
        assert!(client.as_str().starts_with("client_"));
        assert_eq!(host.prefix(), Some(RolePrefix::Host));
        assert_eq!(client.prefix(), Some(RolePrefix::Client));
        assert_eq!(PeerId::from("someone").prefix(), None);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn role_accessors() {
        assert!(Role::Host.is_host());
        assert!(!Role::Undetermined.is_host());
        let role = Role::Client { host: PeerId::from("game_ab234") };
        assert_eq!(role.host(), Some(&PeerId::from("game_ab234")));
    }

    proptest! {
        #[test]
        fn minted_suffix_avoids_ambiguous_characters(host in any::<bool>()) {
            let prefix = if host { RolePrefix::Host } else { RolePrefix::Client };
            let id = PeerId::mint(prefix);
            let suffix = &id.as_str()[prefix.as_str().len()..];
            prop_assert_eq!(suffix.len(), 5);
            let bytes = suffix.as_bytes();
            prop_assert!(bytes[..2].iter().all(|b| PEER_ID_LETTERS.contains(b)));
            prop_assert!(bytes[2..].iter().all(|b| PEER_ID_DIGITS.contains(b)));
            for ambiguous in ['o', 'i', 'l', '0', '1'] {
                prop_assert!(!suffix.contains(ambiguous));
            }
        }
    }
}
