//! Signaling endpoint resolution.
//!
//! The broker hands out host candidates that may be stale, so each one is probed with a
//! plain TCP connect before the long-lived signaling channel is committed to it.

use relaylink_common::ResolutionError;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::broker::{BrokerClient, HOST_ENDPOINT};
use crate::credentials::Credentials;

/// Broker websocket URL with the session token appended as `/v2/{token}`.
#[derive(Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    url: Url,
    host: String,
    port: u16,
}

impl SignalingEndpoint {
    /// Builds the endpoint from a broker host (`wss://host:port`, `https://...` also
    /// accepted and mapped to the websocket scheme).
    pub fn from_host(host: &str, token: &str) -> Result<Self, ResolutionError> {
        let invalid = |reason: &str| ResolutionError::InvalidEndpoint {
            url: host.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = host.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            _ => return Err(invalid("scheme must be ws, wss, http or https")),
        };
        if token.trim().is_empty() {
            return Err(invalid("empty session token"));
        }

        let mut url = Url::parse(&format!("{ws_scheme}://{rest}"))
            .map_err(|e| invalid(&e.to_string()))?;
        // Socket connects take the bare address, without the URL's IPv6 brackets.
        let host_name = match url.host().ok_or_else(|| invalid("missing host"))? {
            Host::Ipv6(addr) => addr.to_string(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Domain(name) => name.to_string(),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| invalid("cannot carry a path"))?
            .pop_if_empty()
            .push("v2")
            .push(token);

        Ok(Self {
            url,
            host: host_name,
            port,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Prints the endpoint without the token.
impl fmt::Display for SignalingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.url.scheme();
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}/v2/<token>", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}/v2/<token>", self.host, self.port)
        }
    }
}

impl fmt::Debug for SignalingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalingEndpoint({self})")
    }
}

#[derive(Clone, Debug)]
pub struct BrokerHostResolver {
    broker: BrokerClient,
    user_name: String,
    channel: String,
    max_attempts: u32,
    probe_timeout: Duration,
}

impl BrokerHostResolver {
    pub fn new(
        broker: BrokerClient,
        user_name: impl Into<String>,
        channel: impl Into<String>,
        max_attempts: u32,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            user_name: user_name.into(),
            channel: channel.into(),
            max_attempts: max_attempts.max(1),
            probe_timeout,
        }
    }

    /// Asks the broker for hosts until one accepts a TCP connection.
    pub async fn resolve(
        &self,
        credentials: &Credentials,
    ) -> Result<SignalingEndpoint, ResolutionError> {
        for attempt in 1..=self.max_attempts {
            let host = match self
                .broker
                .call(
                    HOST_ENDPOINT,
                    &[
                        ("username", self.user_name.as_str()),
                        ("channel", self.channel.as_str()),
                    ],
                )
                .await
            {
                Ok(Value::String(host)) => host,
                Ok(other) => {
                    warn!(attempt, payload = %other, "broker returned a non-string host");
                    continue;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "host request failed");
                    continue;
                }
            };

            let endpoint = match SignalingEndpoint::from_host(&host, &credentials.token) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(attempt, error = %e, "unusable host candidate");
                    continue;
                }
            };

            match self.check_reachable(&endpoint).await {
                Ok(()) => {
                    info!(attempt, %endpoint, "resolved signaling host");
                    return Ok(endpoint);
                }
                Err(reason) => {
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        %endpoint,
                        %reason,
                        "host probe failed"
                    );
                }
            }
        }

        Err(ResolutionError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    async fn check_reachable(&self, endpoint: &SignalingEndpoint) -> Result<(), String> {
        let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
        match time::timeout(self.probe_timeout, connect).await {
            Ok(Ok(stream)) => {
                debug!(%endpoint, "probe connected, closing");
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.probe_timeout)),
        }
    }
}
