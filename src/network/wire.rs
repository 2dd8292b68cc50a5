//! Data channel frame codec
//!
//! One JSON text message per frame:
//! `{"type":"state-update","states":{"<peerId>":{"<objectId>":<snapshot>}}}`

use crate::core::{PeerId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Snapshots of one peer, keyed by object id
pub type ObjectStates = BTreeMap<String, Value>;

/// Snapshots of every peer in a frame
pub type FrameStates = BTreeMap<PeerId, ObjectStates>;

/// Messages carried on a data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Full snapshot of every object the sender knows about
    #[serde(rename = "state-update")]
    StateUpdate {
        /// Per-peer object snapshots
        states: FrameStates,
    },
}

impl WireMessage {
    /// Encode as the JSON text sent on the channel
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a received text message
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Number of object entries across all peers
    pub fn entry_count(&self) -> usize {
        match self {
            WireMessage::StateUpdate { states } => states.values().map(BTreeMap::len).sum(),
        }
    }
}
