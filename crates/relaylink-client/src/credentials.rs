//! Time-limited traversal credentials issued by the broker.

use relaylink_common::CredentialError;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::broker::{BrokerClient, ICE_ENDPOINT, TOKEN_ENDPOINT};
use crate::types::DEFAULT_CREDENTIAL_TTL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalProtocol {
    Stun,
    Stuns,
    Turn,
    Turns,
    Unknown,
}

impl TraversalProtocol {
    fn from_url(url: &str) -> Self {
        match url.split(':').next().map(str::to_ascii_lowercase).as_deref() {
            Some("stun") => Self::Stun,
            Some("stuns") => Self::Stuns,
            Some("turn") => Self::Turn,
            Some("turns") => Self::Turns,
            _ => Self::Unknown,
        }
    }
}

/// One STUN/TURN server descriptor, ready for the media engine.
#[derive(Clone, PartialEq, Eq)]
pub struct TraversalServer {
    pub urls: Vec<String>,
    pub protocol: TraversalProtocol,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl fmt::Debug for TraversalServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraversalServer")
            .field("urls", &self.urls)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credentials for one negotiation cycle. Renewal builds a new value; nothing mutates one.
#[derive(Clone)]
pub struct Credentials {
    pub servers: Vec<TraversalServer>,
    pub token: String,
    pub issued_at: Instant,
    pub ttl: Duration,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("servers", &self.servers)
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Credentials {
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// True once `now` is inside the renewal window before expiry.
    ///
    /// The margin is clamped to half the TTL so short-lived credentials still get used.
    pub fn needs_renewal(&self, now: Instant, margin: Duration) -> bool {
        let margin = margin.min(self.ttl / 2);
        now + margin >= self.expires_at()
    }
}

/// Stateless request/response access to the broker's credential endpoints.
#[derive(Clone, Debug)]
pub struct CredentialProvider {
    broker: BrokerClient,
    user_name: String,
}

impl CredentialProvider {
    pub fn new(broker: BrokerClient, user_name: impl Into<String>) -> Self {
        Self {
            broker,
            user_name: user_name.into(),
        }
    }

    /// Fetches traversal servers and a session token. Either both succeed or nothing is
    /// returned.
    pub async fn acquire(
        &self,
        channel: &str,
        ttl_hint: Option<Duration>,
    ) -> Result<Credentials, CredentialError> {
        let expire = ttl_hint.map(|ttl| ttl.as_secs().max(1).to_string());
        let mut ice_form = vec![("channel", channel)];
        if let Some(expire) = expire.as_deref() {
            ice_form.push(("expire", expire));
        }

        let ice = self.broker.call(ICE_ENDPOINT, &ice_form).await?;
        let servers = parse_ice_servers(ice)?;
        debug!(count = servers.len(), "retrieved traversal servers");

        let token = self
            .broker
            .call(
                TOKEN_ENDPOINT,
                &[("username", self.user_name.as_str()), ("channel", channel)],
            )
            .await?;
        let token = match token {
            Value::String(s) if !s.trim().is_empty() => s,
            other => {
                return Err(CredentialError::malformed(
                    TOKEN_ENDPOINT,
                    format!("expected a token string, got {other}"),
                ))
            }
        };

        let ttl = ttl_hint.unwrap_or(DEFAULT_CREDENTIAL_TTL);
        info!(servers = servers.len(), ttl_secs = ttl.as_secs(), "acquired credentials");
        Ok(Credentials {
            servers,
            token,
            issued_at: Instant::now(),
            ttl,
        })
    }
}

/// Parses the `getice` payload `{"iceServers": [...]}`.
///
/// Brokers hand out the legacy single `url` field; it is lifted into a one-element
/// `urls` list. Entries that already carry `urls` (string or array) are kept as they are.
pub fn parse_ice_servers(payload: Value) -> Result<Vec<TraversalServer>, CredentialError> {
    let entries = payload
        .get("iceServers")
        .and_then(Value::as_array)
        .ok_or_else(|| CredentialError::malformed(ICE_ENDPOINT, "missing `iceServers` array"))?;

    let mut servers = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let urls = match (entry.get("urls"), entry.get("url")) {
            (Some(Value::Array(list)), _) => list
                .iter()
                .map(|u| u.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    CredentialError::malformed(
                        ICE_ENDPOINT,
                        format!("iceServers[{idx}].urls must contain strings"),
                    )
                })?,
            (Some(Value::String(u)), _) | (None, Some(Value::String(u))) => vec![u.clone()],
            _ => {
                return Err(CredentialError::malformed(
                    ICE_ENDPOINT,
                    format!("iceServers[{idx}] has no url"),
                ))
            }
        };
        if urls.is_empty() {
            return Err(CredentialError::malformed(
                ICE_ENDPOINT,
                format!("iceServers[{idx}] has an empty url list"),
            ));
        }

        let text = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
        servers.push(TraversalServer {
            protocol: TraversalProtocol::from_url(&urls[0]),
            urls,
            username: text("username"),
            credential: text("credential"),
        });
    }
    Ok(servers)
}
