//! Capability interface of the external media engine.
//!
//! The lifecycle never touches ICE/DTLS state directly; it drives a [`MediaSession`]
//! through these operations and observes [`EngineEvent`]s delivered over a bounded
//! channel from the engine's own tasks.

use async_trait::async_trait;
use relaylink_common::{NegotiationError, RemoteCandidate, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;

use crate::credentials::TraversalServer;
use crate::media::{MediaSink, VideoSource};

pub const ENGINE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// Candidate checks have produced a usable pair.
    pub fn is_fully_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connectivity(ConnectivityState),
    Transport(TransportState),
    RemoteTrack { kind: String },
    DataChannel { label: String },
}

/// Sending half handed to an engine session. Awaiting `emit` applies backpressure to the
/// engine task instead of dropping state changes.
#[derive(Clone, Debug)]
pub struct EngineEvents {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineEvents {
    pub fn channel() -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(ENGINE_EVENT_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("engine event dropped: lifecycle cycle already ended");
        }
    }
}

/// Everything an engine needs to build a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub servers: Vec<TraversalServer>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a fresh session. Remote tracks are handed to `sink`; state changes go to
    /// `events`.
    async fn create_session(
        &self,
        config: SessionConfig,
        events: EngineEvents,
        sink: MediaSink,
    ) -> Result<Box<dyn MediaSession>, NegotiationError>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: &SessionDescription)
        -> Result<(), NegotiationError>;

    /// The description currently applied locally, if any.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_track(&self, source: VideoSource) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: &RemoteCandidate)
        -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}
