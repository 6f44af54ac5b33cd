//! Persistent websocket control connection to the broker.

use futures_util::{SinkExt, StreamExt};
use relaylink_common::SignalingError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::resolver::SignalingEndpoint;
use crate::types::KeepAliveMode;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_PAYLOAD: &[u8] = b"keepalive";

/// Result of one bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    TimedOut,
    Closed,
}

pub struct SignalingChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    keep_alive: KeepAliveMode,
    open: bool,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

impl SignalingChannel {
    pub async fn connect(
        endpoint: &SignalingEndpoint,
        keep_alive: KeepAliveMode,
    ) -> Result<Self, SignalingError> {
        debug!(%endpoint, ?keep_alive, "connecting signaling channel");
        let (ws, _) = time::timeout(CONNECT_TIMEOUT, connect_async(endpoint.url()))
            .await
            .map_err(|_| SignalingError::Connect(format!("timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        info!(%endpoint, "signaling channel connected");

        Ok(Self {
            ws,
            keep_alive,
            open: true,
            last_activity: Instant::now(),
            ping_sent_at: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Waits at most `timeout` for the next text frame.
    ///
    /// Control frames are handled in place and never surface; in automatic keep-alive
    /// mode this is also where idle pings go out and dead connections are detected.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Frame, SignalingError> {
        if !self.open {
            return Ok(Frame::Closed);
        }
        if let Some(frame) = self.automatic_keep_alive().await? {
            return Ok(frame);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let next = match time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return Ok(Frame::TimedOut),
                Ok(next) => next,
            };

            let msg = match next {
                None => {
                    self.open = false;
                    return Ok(Frame::Closed);
                }
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => {
                    self.open = false;
                    return Ok(Frame::Closed);
                }
                Some(Err(e)) => {
                    self.open = false;
                    return Err(SignalingError::Receive(e.to_string()));
                }
                Some(Ok(msg)) => msg,
            };

            self.last_activity = Instant::now();
            match msg {
                WsMessage::Text(text) => return Ok(Frame::Text(text)),
                WsMessage::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Frame::Text(text)),
                    Err(_) => debug!("dropping non-UTF-8 binary frame"),
                },
                WsMessage::Ping(_) => debug!("ping from broker"),
                WsMessage::Pong(_) => {
                    if let Some(sent) = self.ping_sent_at.take() {
                        debug!(rtt = ?sent.elapsed(), "pong received");
                    }
                }
                WsMessage::Close(frame) => {
                    info!(?frame, "broker closed the signaling channel");
                    self.open = false;
                    return Ok(Frame::Closed);
                }
                WsMessage::Frame(_) => {}
            }
        }
    }

    pub async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        if !self.open {
            return Err(SignalingError::Closed);
        }
        debug!(len = text.len(), "sending signaling frame");
        if let Err(e) = self.ws.send(WsMessage::Text(text)).await {
            self.open = false;
            return Err(SignalingError::Send(e.to_string()));
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Sends a keep-alive ping. Pongs are consumed by [`receive`](Self::receive).
    pub async fn ping(&mut self) -> Result<(), SignalingError> {
        if !self.open {
            return Err(SignalingError::Closed);
        }
        if let Err(e) = self.ws.send(WsMessage::Ping(PING_PAYLOAD.to_vec())).await {
            self.open = false;
            return Err(SignalingError::Send(e.to_string()));
        }
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "signaling close handshake failed");
        }
    }

    async fn automatic_keep_alive(&mut self) -> Result<Option<Frame>, SignalingError> {
        let KeepAliveMode::Automatic { interval } = self.keep_alive else {
            return Ok(None);
        };

        if let Some(sent) = self.ping_sent_at {
            if sent.elapsed() >= interval {
                warn!(?interval, "keep-alive ping unanswered, dropping signaling channel");
                self.open = false;
                return Ok(Some(Frame::Closed));
            }
            return Ok(None);
        }

        if self.last_activity.elapsed() >= interval {
            debug!("idle signaling channel, sending keep-alive ping");
            self.ping().await?;
        }
        Ok(None)
    }
}
