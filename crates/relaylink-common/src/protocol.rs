//! Broker signaling wire protocol.
//!
//! Inbound frames look like `{"m": {"o": objective, "f": sender}, "p": {"msg": ...}}`.
//! Replies are wrapped as `{"t": "u", "m": {"f", "o": "message", "t": peer}, "p": {"msg": ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ParseError;
use crate::helpers::peer_name;

/// Broker path of the peer that sent a frame (`channel/user`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPath(pub String);

impl PeerPath {
    pub fn peer_name(&self) -> &str {
        peer_name(&self.0)
    }
}

impl fmt::Display for PeerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A classified inbound frame. Constructed per frame and dropped after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    /// Peer list notification.
    Peers { payload: Option<Value> },
    PeerConnected { sender: PeerPath },
    PeerRemoved { sender: PeerPath },
    Message {
        sender: PeerPath,
        message: InboundMessage,
    },
    /// Objective this client does not understand.
    Unknown { objective: String },
}

/// Sub-message carried by a `message` envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(RemoteCandidate),
    Action(Value),
    /// Payload without a `type`: a remote command line.
    Command(String),
    /// `type` present but not one we handle.
    Unknown(String),
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::Action(_) => "action",
            Self::Command(_) => "command",
            Self::Unknown(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Session description exchanged as `{"type": ..., "sdp": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "type": self.sdp_type, "sdp": self.sdp })
    }
}

/// A trickled remote candidate, decoded from its SDP attribute form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    /// The fragment after the `candidate:` prefix.
    pub fragment: String,
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl RemoteCandidate {
    /// Decodes `candidate:<foundation> <component> <proto> <priority> <addr> <port> typ <type> ...`.
    /// The `candidate:` prefix is optional.
    pub fn parse(
        line: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<Self, ParseError> {
        let line = line.trim();
        let fragment = match line.split_once(':') {
            Some((prefix, rest)) if prefix.eq_ignore_ascii_case("candidate") => rest.trim(),
            _ => line,
        };

        let fields: Vec<&str> = fragment.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(ParseError::InvalidCandidate(format!(
                "expected at least 8 fields, got {}",
                fields.len()
            )));
        }
        if fields[6] != "typ" {
            return Err(ParseError::InvalidCandidate(
                "missing `typ` keyword".to_string(),
            ));
        }

        let number = |idx: usize, name: &str| -> Result<u64, ParseError> {
            fields[idx]
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidCandidate(format!("bad {name} `{}`", fields[idx])))
        };
        let component = u16::try_from(number(1, "component")?)
            .map_err(|_| ParseError::InvalidCandidate("component out of range".into()))?;
        let priority = u32::try_from(number(3, "priority")?)
            .map_err(|_| ParseError::InvalidCandidate("priority out of range".into()))?;
        let port = u16::try_from(number(5, "port")?)
            .map_err(|_| ParseError::InvalidCandidate("port out of range".into()))?;

        Ok(Self {
            fragment: fragment.to_string(),
            foundation: fields[0].to_string(),
            component,
            protocol: fields[2].to_ascii_lowercase(),
            priority,
            address: fields[4].to_string(),
            port,
            kind: fields[7].to_string(),
            sdp_mid,
            sdp_mline_index,
        })
    }

    /// Attribute form with the `candidate:` prefix restored.
    pub fn to_attribute(&self) -> String {
        format!("candidate:{}", self.fragment)
    }
}

/// Wire shape of a candidate sub-message.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Outbound reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub t: String,
    pub m: OutboundMeta,
    pub p: OutboundPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMeta {
    pub f: String,
    pub o: String,
    pub t: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub msg: Value,
}

impl OutboundEnvelope {
    /// A user message from `from` (our `channel/user` path) to `target`.
    pub fn message(from: impl Into<String>, target: impl Into<String>, msg: Value) -> Self {
        Self {
            t: "u".to_string(),
            m: OutboundMeta {
                f: from.into(),
                o: "message".to_string(),
                t: target.into(),
            },
            p: OutboundPayload { msg },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_parse_strips_prefix() {
        let c = RemoteCandidate::parse(
            "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx raddr 10.0.0.2 rport 46154",
            Some("0".into()),
            Some(0),
        )
        .unwrap();
        assert_eq!(c.foundation, "842163049");
        assert_eq!(c.component, 1);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.priority, 1677729535);
        assert_eq!(c.address, "203.0.113.7");
        assert_eq!(c.port, 46154);
        assert_eq!(c.kind, "srflx");
        assert!(c.fragment.starts_with("842163049 1 udp"));
        assert!(c.to_attribute().starts_with("candidate:842163049"));
    }

    #[test]
    fn test_candidate_parse_without_prefix() {
        let c = RemoteCandidate::parse("1 1 UDP 2130706431 192.168.1.4 5000 typ host", None, None)
            .unwrap();
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.kind, "host");
    }

    #[test]
    fn test_candidate_parse_rejects_garbage() {
        assert!(RemoteCandidate::parse("candidate:abc", None, None).is_err());
        assert!(RemoteCandidate::parse(
            "candidate:1 1 udp 10 1.2.3.4 99999 typ host",
            None,
            None
        )
        .is_err());
        assert!(RemoteCandidate::parse(
            "candidate:1 1 udp 10 1.2.3.4 5000 kind host",
            None,
            None
        )
        .is_err());
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let answer = SessionDescription::new(SdpType::Answer, "v=0");
        let env = OutboundEnvelope::message("room/bob", "alice", answer.to_value());
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["t"], "u");
        assert_eq!(value["m"]["f"], "room/bob");
        assert_eq!(value["m"]["o"], "message");
        assert_eq!(value["m"]["t"], "alice");
        assert_eq!(value["p"]["msg"]["type"], "answer");
        assert_eq!(value["p"]["msg"]["sdp"], "v=0");
    }

    #[test]
    fn test_peer_path_name() {
        assert_eq!(PeerPath("room/alice".into()).peer_name(), "alice");
    }
}
