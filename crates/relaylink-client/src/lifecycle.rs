//! The client's outer loop: acquire credentials, resolve, connect, negotiate, recycle.
//!
//! Each pass through the loop is a *cycle*. A cycle owns its credentials, its signaling
//! channel and its negotiator, and always ends with exactly one cleanup. Between cycles
//! the state returns to `CredentialsMissing` unless the client has been terminated.

use async_trait::async_trait;
use relaylink_common::helpers::sender_path;
use relaylink_common::{
    CredentialError, NegotiationError, OutboundEnvelope, PeerPath, RemoteCandidate,
    ResolutionError, SessionDescription, SignalingError,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::command::CommandExecutor;
use crate::credentials::{CredentialProvider, Credentials};
use crate::engine::{EngineEvent, EngineEvents, MediaEngine};
use crate::negotiator::{NegotiationState, SessionNegotiator};
use crate::resolver::BrokerHostResolver;
use crate::router::{MessageHandler, MessageRouter};
use crate::signaling::{Frame, SignalingChannel};
use crate::state::{ConnectionState, StateCell, TransitionError};
use crate::types::{ClientConfig, ClosePolicy, KeepAliveMode, LifecycleStats, NegotiationRole};
use crate::webrtc_engine::WebRtcEngine;

/// What the outer loop does after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Clean up, wait the retry delay, start over from `CredentialsMissing`.
    Recycle,
    Terminate,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("state machine fault: {0}")]
    Fault(#[from] TransitionError),
}

impl CycleError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Credential(_) | Self::Resolution(_) | Self::Negotiation(_) => {
                Disposition::Recycle
            }
            Self::Signaling(SignalingError::Connect(_)) => Disposition::Recycle,
            Self::Signaling(_) | Self::Fault(_) => Disposition::Terminate,
        }
    }
}

/// How a cycle ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    /// Credentials are about to expire.
    Renew,
    /// The media transport went away.
    Disconnected,
    /// The broker closed the signaling channel.
    ChannelClosed,
    /// The client was terminated.
    Stopped,
}

pub struct ConnectionLifecycle {
    config: ClientConfig,
    engine: Arc<dyn MediaEngine>,
    provider: CredentialProvider,
    resolver: BrokerHostResolver,
    router: MessageRouter,
    commands: Option<CommandExecutor>,
    state: StateCell,
    stats: Arc<LifecycleStats>,
    session_id: Uuid,
}

impl ConnectionLifecycle {
    pub fn new(
        config: ClientConfig,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self, relaylink_common::Error> {
        config.validate()?;
        let broker = BrokerClient::new(config.broker_base(), config.http_timeout, config.insecure_tls)?;
        let provider = CredentialProvider::new(broker.clone(), config.user_name.clone());
        let resolver = BrokerHostResolver::new(
            broker,
            config.user_name.clone(),
            config.channel_name.clone(),
            config.resolve_attempts,
            config.probe_timeout,
        );
        let stats = Arc::new(LifecycleStats::default());

        Ok(Self {
            router: MessageRouter::new(Arc::clone(&stats)),
            commands: config.commands.clone().map(CommandExecutor::new),
            config,
            engine,
            provider,
            resolver,
            state: StateCell::new(),
            stats,
            session_id: Uuid::new_v4(),
        })
    }

    /// Handle for observing or terminating the client from other tasks.
    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<LifecycleStats> {
        Arc::clone(&self.stats)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs cycles until the state reaches `Terminated`.
    pub async fn run(&self) {
        let span = info_span!(
            "client",
            user = %self.config.user_name,
            channel = %self.config.channel_name,
            session = %self.session_id,
        );
        self.run_cycles().instrument(span).await;
    }

    async fn run_cycles(&self) {
        info!(broker = %self.config.broker_base(), "client starting");
        while !self.state.is_terminated() {
            let n = self.stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;
            let mut cycle = Cycle::new(self);
            let outcome = cycle.run().instrument(info_span!("cycle", n)).await;

            let mut pause = false;
            match outcome {
                Ok(CycleEnd::Renew) => {
                    self.stats.renewals.fetch_add(1, Ordering::Relaxed);
                    info!("credentials near expiry, renewing");
                }
                Ok(CycleEnd::Disconnected) => info!("media transport closed, starting over"),
                Ok(CycleEnd::ChannelClosed) => match self.config.close_policy {
                    ClosePolicy::Terminate => {
                        error!("signaling channel closed");
                        self.state.terminate();
                    }
                    ClosePolicy::Recycle => {
                        warn!("signaling channel closed, reconnecting");
                        pause = true;
                    }
                },
                Ok(CycleEnd::Stopped) => debug!("cycle stopped"),
                Err(e) => match e.disposition() {
                    Disposition::Recycle => {
                        warn!(error = %e, "cycle failed, retrying");
                        pause = true;
                    }
                    Disposition::Terminate => {
                        error!(error = %e, "unrecoverable error");
                        self.state.terminate();
                    }
                },
            }

            cycle.cleanup().await;
            if pause && !self.state.is_terminated() {
                self.pause(self.config.retry_delay).await;
            }
        }
        info!(stats = %self.stats.snapshot(), "client terminated");
    }

    /// Sleeps for `delay` unless terminated first.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = self.state.terminated() => {}
        }
    }

    /// Awaits `fut` unless the client is terminated first.
    async fn unless_terminated<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            _ = self.state.terminated() => None,
        }
    }
}

/// Resources owned by one pass through the loop.
struct Cycle<'a> {
    lifecycle: &'a ConnectionLifecycle,
    self_path: String,
    credentials: Option<Credentials>,
    channel: Option<SignalingChannel>,
    negotiator: Option<SessionNegotiator>,
    cleaned: bool,
}

impl<'a> Cycle<'a> {
    fn new(lifecycle: &'a ConnectionLifecycle) -> Self {
        Self {
            self_path: sender_path(&lifecycle.config.channel_name, &lifecycle.config.user_name),
            lifecycle,
            credentials: None,
            channel: None,
            negotiator: None,
            cleaned: false,
        }
    }

    async fn run(&mut self) -> Result<CycleEnd, CycleError> {
        let lc = self.lifecycle;
        let config = &lc.config;

        let acquire = lc
            .provider
            .acquire(&config.channel_name, Some(config.credential_ttl));
        let Some(credentials) = lc.unless_terminated(acquire).await else {
            return Ok(CycleEnd::Stopped);
        };
        let credentials = credentials?;
        lc.state.transition(
            ConnectionState::CredentialsMissing,
            ConnectionState::CredentialsReady,
        )?;

        let Some(endpoint) = lc.unless_terminated(lc.resolver.resolve(&credentials)).await else {
            return Ok(CycleEnd::Stopped);
        };
        let endpoint = endpoint?;
        let connect = SignalingChannel::connect(&endpoint, config.keep_alive);
        let Some(channel) = lc.unless_terminated(connect).await else {
            return Ok(CycleEnd::Stopped);
        };
        self.channel = Some(channel?);

        let (events, mut events_rx) = EngineEvents::channel();
        let negotiator = self.negotiator.insert(SessionNegotiator::new(
            Arc::clone(&lc.engine),
            config.role,
            credentials.servers.clone(),
            config.video_file.clone(),
            events,
        ));
        self.credentials = Some(credentials);
        negotiator.prepare().await?;

        self.receive_loop(&mut events_rx).await
    }

    async fn receive_loop(
        &mut self,
        events_rx: &mut mpsc::Receiver<EngineEvent>,
    ) -> Result<CycleEnd, CycleError> {
        let lc = self.lifecycle;
        let timeout = lc.config.receive_timeout;

        loop {
            if lc.state.is_terminated() {
                return Ok(CycleEnd::Stopped);
            }
            let Some(channel) = self.channel.as_mut() else {
                return Ok(CycleEnd::ChannelClosed);
            };
            if !channel.is_open() {
                return Ok(CycleEnd::ChannelClosed);
            }

            tokio::select! {
                Some(event) = events_rx.recv() => self.on_engine_event(event),
                _ = lc.state.terminated() => return Ok(CycleEnd::Stopped),
                received = channel.receive(timeout) => match received {
                    Ok(Frame::Text(text)) => {
                        lc.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        lc.router.dispatch(&text, self).await?;
                    }
                    Ok(Frame::TimedOut) => {
                        if let Some(end) = self.on_receive_timeout().await {
                            return Ok(end);
                        }
                    }
                    Ok(Frame::Closed) => return Ok(CycleEnd::ChannelClosed),
                    Err(e) => {
                        warn!(error = %e, "signaling receive failed");
                        return Ok(CycleEnd::ChannelClosed);
                    }
                },
            }

            // Steady traffic never reaches the timeout branch.
            if let Some(end) = self.due_end() {
                return Ok(end);
            }
        }
    }

    async fn on_receive_timeout(&mut self) -> Option<CycleEnd> {
        let lc = self.lifecycle;
        if lc.config.keep_alive == KeepAliveMode::Caller {
            if let Some(channel) = self.channel.as_mut() {
                if let Err(e) = channel.ping().await {
                    warn!(error = %e, "keep-alive ping failed");
                    return Some(CycleEnd::ChannelClosed);
                }
            }
        }

        self.due_end()
    }

    /// Cycle end forced by a closed transport or credentials inside the renewal window.
    fn due_end(&self) -> Option<CycleEnd> {
        let lc = self.lifecycle;
        if lc.state.get() == ConnectionState::Disconnected {
            return Some(CycleEnd::Disconnected);
        }
        let credentials = self.credentials.as_ref()?;
        credentials
            .needs_renewal(Instant::now(), lc.config.renew_margin)
            .then_some(CycleEnd::Renew)
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        let state = &self.lifecycle.state;
        match event {
            EngineEvent::Connectivity(connectivity) => {
                debug!(?connectivity, "connectivity changed");
                if connectivity.is_fully_connected()
                    && state.get() == ConnectionState::EstablishingTransport
                {
                    self.step(ConnectionState::EstablishingTransport, ConnectionState::Connected);
                }
            }
            EngineEvent::Transport(transport) => {
                debug!(?transport, "transport changed");
                let current = state.get();
                if transport.is_closed()
                    && matches!(
                        current,
                        ConnectionState::EstablishingTransport | ConnectionState::Connected
                    )
                {
                    self.step(current, ConnectionState::Disconnected);
                }
            }
            EngineEvent::RemoteTrack { kind } => info!(%kind, "remote track"),
            EngineEvent::DataChannel { label } => debug!(%label, "remote data channel"),
        }
    }

    /// Transition that may legitimately race with a stop signal.
    fn step(&self, from: ConnectionState, to: ConnectionState) {
        if let Err(e) = self.lifecycle.state.transition(from, to) {
            debug!(error = %e, "transition skipped");
        }
    }

    /// Moves to `Negotiating` if still waiting in `CredentialsReady`.
    fn begin_negotiation(&self) -> Result<(), TransitionError> {
        let state = &self.lifecycle.state;
        if state.get() == ConnectionState::CredentialsReady {
            state.transition(ConnectionState::CredentialsReady, ConnectionState::Negotiating)?;
        }
        Ok(())
    }

    async fn reply(&mut self, peer: &str, msg: Value) -> Result<(), SignalingError> {
        let envelope = OutboundEnvelope::message(self.self_path.as_str(), peer, msg);
        let text = envelope
            .to_json()
            .map_err(|e| SignalingError::Send(e.to_string()))?;
        match self.channel.as_mut() {
            Some(channel) => channel.send(text).await,
            None => Err(SignalingError::Closed),
        }
    }

    /// Stops the sink, releases the session, closes the channel and resets the state.
    /// Only the first call does anything.
    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.credentials = None;
        self.lifecycle.state.reset();
        self.lifecycle.stats.cleanups.fetch_add(1, Ordering::Relaxed);
        debug!("cycle cleaned up");
    }
}

#[async_trait]
impl MessageHandler for Cycle<'_> {
    type Error = CycleError;

    async fn on_peer_connected(&mut self, sender: PeerPath) -> Result<(), CycleError> {
        let lc = self.lifecycle;
        let peer = sender.peer_name().to_string();
        if peer == lc.config.user_name {
            debug!("own presence notification");
            return Ok(());
        }
        info!(%peer, "peer joined");
        self.begin_negotiation()?;

        if lc.config.role != NegotiationRole::Caller {
            return Ok(());
        }
        let offer = match self.negotiator.as_mut() {
            Some(negotiator) => negotiator.create_offer().await?,
            None => None,
        };
        if let Some(offer) = offer {
            self.reply(&peer, offer.to_value()).await?;
            info!(%peer, "offer sent");
        }
        Ok(())
    }

    async fn on_peer_removed(&mut self, sender: PeerPath) -> Result<(), CycleError> {
        info!(peer = %sender.peer_name(), "peer left");
        Ok(())
    }

    async fn on_offer(
        &mut self,
        sender: PeerPath,
        offer: SessionDescription,
    ) -> Result<(), CycleError> {
        let lc = self.lifecycle;
        let peer = sender.peer_name().to_string();
        info!(%peer, "offer received");

        let acceptable = lc.config.role == NegotiationRole::Responder
            && matches!(
                lc.state.get(),
                ConnectionState::CredentialsReady | ConnectionState::Negotiating
            )
            && self.negotiator.as_ref().is_some_and(|n| !n.has_session());
        if !acceptable {
            warn!(%peer, state = %lc.state.get(), "protocol error: unexpected offer, dropping");
            lc.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.begin_negotiation()?;
        let answer = match self.negotiator.as_mut() {
            Some(negotiator) => negotiator.handle_offer(&offer).await?,
            None => None,
        };
        let Some(answer) = answer else {
            return Ok(());
        };

        self.reply(&peer, answer.to_value()).await?;
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.answer_sent();
        }
        info!(%peer, "answer sent");
        lc.state.transition(
            ConnectionState::Negotiating,
            ConnectionState::EstablishingTransport,
        )?;
        Ok(())
    }

    async fn on_answer(
        &mut self,
        sender: PeerPath,
        answer: SessionDescription,
    ) -> Result<(), CycleError> {
        let lc = self.lifecycle;
        let peer = sender.peer_name();
        let offer_outstanding = self
            .negotiator
            .as_ref()
            .is_some_and(|n| n.has_session() && n.state() == NegotiationState::OfferSent);
        if lc.config.role != NegotiationRole::Caller
            || !offer_outstanding
            || lc.state.get() != ConnectionState::Negotiating
        {
            warn!(%peer, state = %lc.state.get(), "answer without an outstanding offer, dropping");
            lc.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        info!(%peer, "answer received");
        let applied = match self.negotiator.as_mut() {
            Some(negotiator) => negotiator.handle_answer(&answer).await?,
            None => false,
        };
        if !applied {
            lc.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        lc.state.transition(
            ConnectionState::Negotiating,
            ConnectionState::EstablishingTransport,
        )?;
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        sender: PeerPath,
        candidate: RemoteCandidate,
    ) -> Result<(), CycleError> {
        let added = match self.negotiator.as_mut() {
            Some(negotiator) => negotiator.handle_candidate(&candidate).await?,
            None => false,
        };
        if !added {
            debug!(peer = %sender.peer_name(), "no media session, dropping candidate");
        }
        Ok(())
    }

    async fn on_action(&mut self, sender: PeerPath, payload: Value) -> Result<(), CycleError> {
        info!(peer = %sender.peer_name(), %payload, "action message ignored");
        Ok(())
    }

    async fn on_command(&mut self, sender: PeerPath, command: String) -> Result<(), CycleError> {
        let lc = self.lifecycle;
        let peer = sender.peer_name().to_string();
        let Some(executor) = lc.commands.as_ref() else {
            warn!(%peer, "remote commands are disabled, dropping request");
            lc.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let output = executor.execute(&command).await;
        self.reply(&peer, Value::String(output)).await?;
        Ok(())
    }
}

/// Runs a client with the webrtc-rs engine until Ctrl+C or an unrecoverable error.
pub async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = shutdown_tx.send(());
        }
    });
    let engine: Arc<dyn MediaEngine> = Arc::new(WebRtcEngine::new()?);
    run_client_with_shutdown(config, engine, shutdown_rx).await
}

/// Runs a client until `shutdown_rx` fires or the lifecycle terminates on its own.
pub async fn run_client_with_shutdown(
    config: ClientConfig,
    engine: Arc<dyn MediaEngine>,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let lifecycle = ConnectionLifecycle::new(config, engine)?;
    let state = lifecycle.state();
    let stopper = tokio::spawn(async move {
        if shutdown_rx.await.is_ok() {
            state.terminate();
        }
    });
    lifecycle.run().await;
    stopper.abort();
    Ok(())
}
