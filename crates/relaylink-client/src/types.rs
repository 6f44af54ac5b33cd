use relaylink_common::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_CHANNEL: &str = "sampleAppChannel";
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_RENEW_MARGIN: Duration = Duration::from_secs(30);
pub const DEFAULT_RESOLVE_ATTEMPTS: u32 = 10;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Who sends keep-alive pings on the signaling connection.
///
/// Some brokers treat unsolicited pings as a reason to drop the connection, so this is
/// never hardcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMode {
    /// The channel pings after `interval` of silence and gives up on a ping left
    /// unanswered for another `interval`.
    Automatic { interval: Duration },
    /// The lifecycle pings on every receive timeout.
    Caller,
    Disabled,
}

impl Default for KeepAliveMode {
    fn default() -> Self {
        Self::Automatic {
            interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

/// What to do when the broker closes the signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ClosePolicy {
    /// Treat a broker-side close as final.
    #[default]
    Terminate,
    /// Fetch fresh credentials and reconnect.
    Recycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum NegotiationRole {
    /// Answer remote offers (the usual mode).
    #[default]
    Responder,
    /// Hold a session from cycle start and accept remote answers.
    Caller,
}

/// Allow-list for remote command execution. Absent from the config means disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    pub allowed_programs: Vec<String>,
    pub timeout: Duration,
}

impl CommandPolicy {
    pub fn new(allowed_programs: Vec<String>) -> Self {
        Self {
            allowed_programs,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefix under which `getice.php`, `gettoken.php` and `gethost.php` live.
    pub broker_url: String,
    pub user_name: String,
    pub channel_name: String,
    pub video_file: Option<PathBuf>,
    pub keep_alive: KeepAliveMode,
    pub close_policy: ClosePolicy,
    pub role: NegotiationRole,
    pub receive_timeout: Duration,
    pub credential_ttl: Duration,
    pub renew_margin: Duration,
    pub resolve_attempts: u32,
    pub probe_timeout: Duration,
    pub http_timeout: Duration,
    pub retry_delay: Duration,
    /// Accept invalid broker TLS certificates (development brokers).
    pub insecure_tls: bool,
    pub commands: Option<CommandPolicy>,
}

impl ClientConfig {
    pub fn new(broker_url: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            user_name: user_name.into(),
            channel_name: DEFAULT_CHANNEL.to_string(),
            video_file: None,
            keep_alive: KeepAliveMode::default(),
            close_policy: ClosePolicy::default(),
            role: NegotiationRole::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
            renew_margin: DEFAULT_RENEW_MARGIN,
            resolve_attempts: DEFAULT_RESOLVE_ATTEMPTS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            insecure_tls: false,
            commands: None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.broker_url.starts_with("http") {
            return Err(Error::config(format!(
                "broker url should start with http(s), got `{}`",
                self.broker_url
            )));
        }
        url::Url::parse(&self.broker_url)
            .map_err(|e| Error::config(format!("invalid broker url: {e}")))?;
        if self.user_name.trim().is_empty() {
            return Err(Error::config("user name is required"));
        }
        if self.user_name.contains('/') {
            return Err(Error::config("user name must not contain `/`"));
        }
        if self.channel_name.trim().is_empty() {
            return Err(Error::config("channel name is required"));
        }
        if self.receive_timeout.is_zero() {
            return Err(Error::config("receive timeout must be positive"));
        }
        if self.credential_ttl.is_zero() {
            return Err(Error::config("credential ttl must be positive"));
        }
        if self.resolve_attempts == 0 {
            return Err(Error::config("resolver needs at least one attempt"));
        }
        if let KeepAliveMode::Automatic { interval } = self.keep_alive {
            if interval.is_zero() {
                return Err(Error::config("keep-alive interval must be positive"));
            }
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn broker_base(&self) -> &str {
        self.broker_url.trim_end_matches('/')
    }
}

/// Counters readable while the client runs.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    pub cycles: AtomicU64,
    pub cleanups: AtomicU64,
    pub renewals: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
}

impl LifecycleStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub cleanups: u64,
    pub renewals: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycles={} cleanups={} renewals={} frames={} dropped={}",
            self.cycles, self.cleanups, self.renewals, self.frames_received, self.frames_dropped
        )
    }
}
