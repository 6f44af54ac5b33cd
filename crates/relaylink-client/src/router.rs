//! Classification and dispatch of inbound signaling frames.

use async_trait::async_trait;
use relaylink_common::{
    CandidatePayload, InboundEnvelope, InboundMessage, ParseError, PeerPath, RemoteCandidate,
    SessionDescription,
};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::LifecycleStats;

/// Decodes one raw text frame into an [`InboundEnvelope`].
///
/// Unknown objectives and unknown message types are not errors; they classify as
/// `Unknown` so the caller can log and move on.
pub fn classify(raw: &str) -> Result<InboundEnvelope, ParseError> {
    let mut frame: Value = serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
    let meta = frame.get("m").ok_or(ParseError::MissingField("m"))?;
    let objective = meta
        .get("o")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("m.o"))?
        .to_string();
    let sender = meta
        .get("f")
        .and_then(Value::as_str)
        .map(|f| PeerPath(f.to_string()));
    let require_sender = || sender.clone().ok_or(ParseError::MissingField("m.f"));

    let envelope = match objective.as_str() {
        "peers" => InboundEnvelope::Peers {
            payload: frame.get_mut("p").map(Value::take),
        },
        "peer_connected" => InboundEnvelope::PeerConnected {
            sender: require_sender()?,
        },
        "peer_removed" => InboundEnvelope::PeerRemoved {
            sender: require_sender()?,
        },
        "message" => {
            let sender = require_sender()?;
            let msg = frame
                .get_mut("p")
                .and_then(|p| p.get_mut("msg"))
                .map(Value::take)
                .ok_or(ParseError::MissingField("p.msg"))?;
            InboundEnvelope::Message {
                sender,
                message: classify_message(msg)?,
            }
        }
        _ => InboundEnvelope::Unknown { objective },
    };
    Ok(envelope)
}

fn classify_message(msg: Value) -> Result<InboundMessage, ParseError> {
    let kind = match &msg {
        Value::String(line) => return Ok(InboundMessage::Command(line.clone())),
        Value::Object(map) => match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => {
                return Err(ParseError::InvalidPayload(format!(
                    "`type` must be a string, got {other}"
                )))
            }
            None => {
                return match map.get("command").and_then(Value::as_str) {
                    Some(line) => Ok(InboundMessage::Command(line.to_string())),
                    None => Err(ParseError::InvalidPayload(
                        "message has neither a type nor a command".into(),
                    )),
                }
            }
        },
        other => {
            return Err(ParseError::InvalidPayload(format!(
                "unexpected message payload {other}"
            )))
        }
    };

    let description = |msg: Value| {
        serde_json::from_value::<SessionDescription>(msg)
            .map_err(|e| ParseError::InvalidPayload(e.to_string()))
    };
    match kind.as_str() {
        "offer" => Ok(InboundMessage::Offer(description(msg)?)),
        "answer" => Ok(InboundMessage::Answer(description(msg)?)),
        "candidate" => {
            let payload: CandidatePayload = serde_json::from_value(msg)
                .map_err(|e| ParseError::InvalidCandidate(e.to_string()))?;
            let candidate = RemoteCandidate::parse(
                &payload.candidate,
                payload.sdp_mid,
                payload.sdp_mline_index,
            )?;
            Ok(InboundMessage::Candidate(candidate))
        }
        "action" => Ok(InboundMessage::Action(msg)),
        _ => Ok(InboundMessage::Unknown(kind)),
    }
}

/// Receiver of classified frames. One method per envelope and message kind.
#[async_trait]
pub trait MessageHandler: Send {
    type Error: Send;

    async fn on_peers(&mut self, payload: Option<Value>) -> Result<(), Self::Error> {
        debug!(?payload, "peer list");
        Ok(())
    }

    async fn on_peer_connected(&mut self, sender: PeerPath) -> Result<(), Self::Error>;

    async fn on_peer_removed(&mut self, sender: PeerPath) -> Result<(), Self::Error> {
        debug!(peer = %sender.peer_name(), "peer left");
        Ok(())
    }

    async fn on_offer(
        &mut self,
        sender: PeerPath,
        offer: SessionDescription,
    ) -> Result<(), Self::Error>;

    async fn on_answer(
        &mut self,
        sender: PeerPath,
        answer: SessionDescription,
    ) -> Result<(), Self::Error>;

    async fn on_candidate(
        &mut self,
        sender: PeerPath,
        candidate: RemoteCandidate,
    ) -> Result<(), Self::Error>;

    async fn on_action(&mut self, sender: PeerPath, payload: Value) -> Result<(), Self::Error> {
        debug!(peer = %sender.peer_name(), %payload, "action message, nothing to do");
        Ok(())
    }

    async fn on_command(&mut self, sender: PeerPath, command: String) -> Result<(), Self::Error>;
}

/// Routes each frame to exactly one handler method.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    stats: Arc<LifecycleStats>,
}

impl MessageRouter {
    pub fn new(stats: Arc<LifecycleStats>) -> Self {
        Self { stats }
    }

    /// Classifies `raw` and invokes the matching handler. Malformed frames and unknown
    /// kinds are logged and dropped without touching the handler.
    pub async fn dispatch<H: MessageHandler>(&self, raw: &str, handler: &mut H) -> Result<(), H::Error> {
        let envelope = match classify(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed signaling frame");
                self.dropped();
                return Ok(());
            }
        };

        match envelope {
            InboundEnvelope::Peers { payload } => handler.on_peers(payload).await,
            InboundEnvelope::PeerConnected { sender } => handler.on_peer_connected(sender).await,
            InboundEnvelope::PeerRemoved { sender } => handler.on_peer_removed(sender).await,
            InboundEnvelope::Unknown { objective } => {
                warn!(%objective, "unknown signaling objective");
                self.dropped();
                Ok(())
            }
            InboundEnvelope::Message { sender, message } => {
                debug!(peer = %sender.peer_name(), kind = message.kind(), "message");
                match message {
                    InboundMessage::Offer(offer) => handler.on_offer(sender, offer).await,
                    InboundMessage::Answer(answer) => handler.on_answer(sender, answer).await,
                    InboundMessage::Candidate(c) => handler.on_candidate(sender, c).await,
                    InboundMessage::Action(payload) => handler.on_action(sender, payload).await,
                    InboundMessage::Command(line) => handler.on_command(sender, line).await,
                    InboundMessage::Unknown(kind) => {
                        warn!(%kind, "unknown message type");
                        self.dropped();
                        Ok(())
                    }
                }
            }
        }
    }

    fn dropped(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}
