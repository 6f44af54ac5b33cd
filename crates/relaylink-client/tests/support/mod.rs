//! Test doubles: a broker REST mock (axum), a websocket signaling mock and a media
//! engine that records what the lifecycle asks of it.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Form, Json, Router};
use futures_util::{SinkExt, StreamExt};
use relaylink_client::{
    ConnectionState, EngineEvent, EngineEvents, MediaEngine, MediaSession, MediaSink,
    SessionConfig, StateCell, VideoSource,
};
use relaylink_common::{NegotiationError, RemoteCandidate, SdpType, SessionDescription};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Broker REST mock
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BrokerState {
    pub ice_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub host_calls: AtomicUsize,
    pub fail_token: AtomicBool,
    pub host: Mutex<String>,
    pub last_expire: Mutex<Option<String>>,
    pub last_user: Mutex<Option<String>>,
}

pub struct MockBroker {
    pub base_url: String,
    pub state: Arc<BrokerState>,
}

impl MockBroker {
    /// Serves the three broker endpoints under `/xirsys`, handing out `host` from gethost.
    pub async fn start(host: impl Into<String>) -> Self {
        let state = Arc::new(BrokerState::default());
        *state.host.lock().unwrap() = host.into();

        let app = Router::new()
            .route("/xirsys/getice.php", post(getice))
            .route("/xirsys/gettoken.php", post(gettoken))
            .route("/xirsys/gethost.php", post(gethost))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/xirsys"),
            state,
        }
    }
}

async fn getice(
    State(state): State<Arc<BrokerState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.ice_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_expire.lock().unwrap() = form.get("expire").cloned();
    Json(json!({
        "s": "ok",
        "v": {"iceServers": [
            {"url": "stun:stun.example.org:3478"},
            {"url": "turn:x", "username": "u", "credential": "c"}
        ]}
    }))
}

async fn gettoken(
    State(state): State<Arc<BrokerState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_user.lock().unwrap() = form.get("username").cloned();
    if state.fail_token.load(Ordering::SeqCst) {
        return Json(json!({"s": "error", "v": "no_namespace"}));
    }
    Json(json!({"s": "ok", "v": format!("tok-{n}")}))
}

async fn gethost(State(state): State<Arc<BrokerState>>) -> Json<Value> {
    state.host_calls.fetch_add(1, Ordering::SeqCst);
    let host = state.host.lock().unwrap().clone();
    Json(json!({"s": "ok", "v": host}))
}

// ---------------------------------------------------------------------------
// Signaling websocket mock
// ---------------------------------------------------------------------------

enum Outbound {
    Frame(WsMessage),
    Close,
}

/// One accepted client connection, seen from the broker side.
pub struct MockPeer {
    pub path: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    pub fn send_json(&self, value: Value) {
        let _ = self
            .outbound
            .send(Outbound::Frame(WsMessage::Text(value.to_string())));
    }

    pub fn send_raw(&self, message: WsMessage) {
        let _ = self.outbound.send(Outbound::Frame(message));
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub async fn recv_json(&mut self) -> Value {
        let text = time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client connection gone");
        serde_json::from_str(&text).unwrap()
    }

    /// Next client frame if one arrives within `wait`.
    pub async fn try_recv_json(&mut self, wait: Duration) -> Option<Value> {
        match time::timeout(wait, self.inbound.recv()).await {
            Ok(Some(text)) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }
}

pub struct MockSignaling {
    pub addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockSignaling {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peers_tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let peers_tx = peers_tx.clone();
                tokio::spawn(async move {
                    let path = Arc::new(Mutex::new(String::new()));
                    let seen = Arc::clone(&path);
                    let callback = move |req: &Request, resp: Response| {
                        *seen.lock().unwrap() = req.uri().path().to_string();
                        Ok(resp)
                    };
                    // Resolver probes connect and hang up; those fail the handshake here.
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };

                    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let path = path.lock().unwrap().clone();
                    let _ = peers_tx.send(MockPeer {
                        path,
                        outbound: out_tx,
                        inbound: in_rx,
                    });

                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            incoming = stream.next() => match incoming {
                                Some(Ok(WsMessage::Text(text))) => {
                                    let _ = in_tx.send(text);
                                }
                                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            outgoing = out_rx.recv() => match outgoing {
                                Some(Outbound::Frame(message)) => {
                                    if sink.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Outbound::Close) | None => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self { addr, peers }
    }

    /// Host string as the broker would hand it out.
    pub fn host(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn next_peer(&mut self) -> MockPeer {
        time::timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a signaling connection")
            .expect("signaling mock stopped")
    }

    pub async fn try_next_peer(&mut self, wait: Duration) -> Option<MockPeer> {
        time::timeout(wait, self.peers.recv()).await.ok().flatten()
    }
}

// ---------------------------------------------------------------------------
// Media engine double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EngineLog {
    pub sessions: AtomicUsize,
    pub closes: AtomicUsize,
    pub candidates: AtomicUsize,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub events: Mutex<Option<EngineEvents>>,
    pub sink: Mutex<Option<MediaSink>>,
}

#[derive(Default)]
pub struct FakeEngine {
    pub log: Arc<EngineLog>,
}

impl FakeEngine {
    /// Pushes an engine event as if the transport produced it.
    pub async fn emit(&self, event: EngineEvent) {
        let events = self.log.events.lock().unwrap().clone();
        events.expect("no session created yet").emit(event).await;
    }

    pub fn sink_running(&self) -> bool {
        self.log
            .sink
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(MediaSink::is_running)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_session(
        &self,
        _config: SessionConfig,
        events: EngineEvents,
        sink: MediaSink,
    ) -> Result<Box<dyn MediaSession>, NegotiationError> {
        self.log.sessions.fetch_add(1, Ordering::SeqCst);
        *self.log.events.lock().unwrap() = Some(events);
        *self.log.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(FakeSession {
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeSession {
    log: Arc<EngineLog>,
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if desc.sdp.contains("reject-me") {
            return Err(NegotiationError::engine("set remote description", "unsupported"));
        }
        self.log.remote.lock().unwrap().push(desc.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::new(SdpType::Offer, "v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::new(SdpType::Answer, "v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        _desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    async fn add_track(&self, _source: VideoSource) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: &RemoteCandidate,
    ) -> Result<(), NegotiationError> {
        self.log.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub async fn wait_for_state(state: &StateCell, target: ConnectionState) {
    let mut rx = state.watch();
    time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("state never reached {target}, stuck at {}", state.get()))
        .unwrap();
}

pub fn offer_from(peer_path: &str, sdp: &str) -> Value {
    json!({
        "m": {"o": "message", "f": peer_path},
        "p": {"msg": {"type": "offer", "sdp": sdp}}
    })
}
