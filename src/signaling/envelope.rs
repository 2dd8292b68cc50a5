//! Signaling wire types
//!
//! Envelopes are the documents written to a host's mailbox:
//! `{type, from, to, timestamp, offer?, answer?, candidate?}`.

use crate::core::{NegotiationError, PeerId, Timestamp};
use serde::{Deserialize, Serialize};

/// SDP type for session descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer to establish connection
    Offer,
    /// Answer to an offer
    Answer,
}

/// Session Description Protocol data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP type (offer or answer)
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for connectivity establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// Media stream index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
    /// Media stream identification
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// ICE username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

/// Kind of a signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
}

impl SignalKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// A decoded signal, as handed to the connection layer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    /// Remote side wants to connect
    Offer(SessionDescription),
    /// Remote side accepted our offer
    Answer(SessionDescription),
    /// Remote side found a candidate address
    IceCandidate(IceCandidate),
}

impl PeerSignal {
    /// Kind of this signal
    pub fn kind(&self) -> SignalKind {
        match self {
            PeerSignal::Offer(_) => SignalKind::Offer,
            PeerSignal::Answer(_) => SignalKind::Answer,
            PeerSignal::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// Mailbox document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    /// Envelope kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Sender
    pub from: PeerId,
    /// Addressee
    pub to: PeerId,
    /// Server timestamp, filled in by the directory on write
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    /// Present on offers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    /// Present on answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Present on ICE candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalingEnvelope {
    /// Build an unstamped envelope carrying `signal`
    pub fn new(from: PeerId, to: PeerId, signal: PeerSignal) -> Self {
        let mut envelope = Self {
            kind: signal.kind(),
            from,
            to,
            timestamp: None,
            offer: None,
            answer: None,
            candidate: None,
        };
        match signal {
            PeerSignal::Offer(desc) => envelope.offer = Some(desc),
            PeerSignal::Answer(desc) => envelope.answer = Some(desc),
            PeerSignal::IceCandidate(candidate) => envelope.candidate = Some(candidate),
        }
        envelope
    }

    /// Decode the payload matching `kind`
    pub fn signal(&self) -> Result<PeerSignal, NegotiationError> {
        let missing = || {
            NegotiationError::MalformedEnvelope(format!(
                "{} from {} has no payload",
                self.kind.as_str(),
                self.from
            ))
        };
        match self.kind {
            SignalKind::Offer => self.offer.clone().map(PeerSignal::Offer).ok_or_else(missing),
            SignalKind::Answer => self.answer.clone().map(PeerSignal::Answer).ok_or_else(missing),
            SignalKind::IceCandidate => self
                .candidate
                .clone()
                .map(PeerSignal::IceCandidate)
                .ok_or_else(missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ice_candidate_envelope_wire_shape() {
        let envelope = SignalingEnvelope::new(
            PeerId::from("client_ab234"),
            PeerId::from("game_cd567"),
            PeerSignal::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".into()),
                username_fragment: Some("abcd".into()),
            }),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["from"], "client_ab234");
        assert_eq!(value["to"], "game_cd567");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["usernameFragment"], "abcd");
        assert!(value.get("offer").is_none());
    }

    #[test]
    fn decodes_browser_offer_document() {
        let doc = json!({
            "type": "offer",
            "from": "client_ab234",
            "to": "game_cd567",
            "timestamp": 1700000000000u64,
            "offer": { "type": "offer", "sdp": "v=0" }
        });
        let envelope: SignalingEnvelope = serde_json::from_value(doc).unwrap();
        assert_eq!(envelope.timestamp, Some(1_700_000_000_000));
        assert_eq!(envelope.signal().unwrap(), PeerSignal::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn missing_payload_is_malformed() {
        let doc = json!({ "type": "answer", "from": "game_cd567", "to": "client_ab234" });
        let envelope: SignalingEnvelope = serde_json::from_value(doc).unwrap();
        assert!(matches!(envelope.signal(), Err(NegotiationError::MalformedEnvelope(_))));
    }
}
