//! Broker signaling client.
//!
//! Fetches traversal credentials and a session token from the broker, resolves a live
//! signaling host, answers remote offers through a pluggable media engine, and recycles
//! the whole chain before the credentials expire.

pub mod broker;
pub mod command;
pub mod credentials;
pub mod engine;
pub mod lifecycle;
pub mod media;
pub mod negotiator;
pub mod resolver;
pub mod router;
pub mod signaling;
pub mod state;
pub mod types;
pub mod webrtc_engine;

pub use broker::BrokerClient;
pub use command::CommandExecutor;
pub use credentials::{CredentialProvider, Credentials, TraversalProtocol, TraversalServer};
pub use engine::{
    ConnectivityState, EngineEvent, EngineEvents, MediaEngine, MediaSession, SessionConfig,
    TransportState,
};
pub use lifecycle::{run_client, run_client_with_shutdown, ConnectionLifecycle, CycleError, Disposition};
pub use media::{MediaSink, VideoSource};
pub use negotiator::{NegotiationState, SessionNegotiator};
pub use resolver::{BrokerHostResolver, SignalingEndpoint};
pub use router::{classify, MessageHandler, MessageRouter};
pub use signaling::{Frame, SignalingChannel};
pub use state::{ConnectionState, StateCell, Transition, TransitionError};
pub use types::{
    ClientConfig, ClosePolicy, CommandPolicy, KeepAliveMode, LifecycleStats, NegotiationRole,
    StatsSnapshot,
};
pub use webrtc_engine::WebRtcEngine;
