//! Relaylink diagnostics: broker credential checks and signaling probes.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use relaylink_client::types::{DEFAULT_CHANNEL, DEFAULT_PROBE_TIMEOUT, DEFAULT_RESOLVE_ATTEMPTS};
use relaylink_client::{
    BrokerClient, BrokerHostResolver, ClientConfig, CredentialProvider, Credentials, Frame,
    KeepAliveMode, SignalingChannel, TraversalServer,
};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "relaylink")]
#[command(about = "Relaylink diagnostics")]
struct Args {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct BrokerArgs {
    /// URL prefix under which getice.php, gethost.php and gettoken.php live
    #[arg(env = "RELAYLINK_BROKER_URL")]
    broker_url: String,

    /// User name presented to the broker
    #[arg(env = "RELAYLINK_USER")]
    user_name: String,

    #[arg(short, long, env = "RELAYLINK_CHANNEL", default_value = DEFAULT_CHANNEL)]
    channel: String,

    /// Accept invalid broker TLS certificates
    #[arg(long, env = "RELAYLINK_INSECURE")]
    insecure: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch traversal servers and a session token
    Ice {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Requested credential lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,

        /// Print the servers as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a reachable signaling host
    Host {
        #[command(flatten)]
        broker: BrokerArgs,

        #[arg(long, default_value_t = DEFAULT_RESOLVE_ATTEMPTS)]
        attempts: u32,
    },

    /// Hold a signaling connection open and report every frame and receive timeout
    Probe {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Ping the broker on every receive timeout
        #[arg(short, long)]
        active_ping: bool,

        /// Stop after this many seconds (runs until closed or Ctrl+C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Receive timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        receive_timeout_ms: u64,
    },

    /// Show version information
    Version,
}

impl BrokerArgs {
    fn config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.broker_url.clone(), self.user_name.clone());
        config.channel_name = self.channel.clone();
        config.insecure_tls = self.insecure;
        config.validate()?;
        Ok(config)
    }
}

fn broker_client(config: &ClientConfig) -> Result<BrokerClient> {
    Ok(BrokerClient::new(
        config.broker_base(),
        config.http_timeout,
        config.insecure_tls,
    )?)
}

async fn acquire(config: &ClientConfig, ttl: Duration) -> Result<Credentials> {
    let provider = CredentialProvider::new(broker_client(config)?, config.user_name.clone());
    provider
        .acquire(&config.channel_name, Some(ttl))
        .await
        .context("credential request failed")
}

async fn resolve(
    config: &ClientConfig,
    credentials: &Credentials,
    attempts: u32,
) -> Result<relaylink_client::SignalingEndpoint> {
    let resolver = BrokerHostResolver::new(
        broker_client(config)?,
        config.user_name.clone(),
        config.channel_name.clone(),
        attempts,
        DEFAULT_PROBE_TIMEOUT,
    );
    resolver
        .resolve(credentials)
        .await
        .context("no signaling host")
}

/// One line per server. Credentials never leave the process.
fn describe_server(server: &TraversalServer) -> String {
    format!(
        "{:<6} {}  user={}  credential={}",
        format!("{:?}", server.protocol).to_lowercase(),
        server.urls.join(","),
        server.username.as_deref().unwrap_or("-"),
        if server.credential.is_some() { "<redacted>" } else { "-" },
    )
}

fn servers_json(servers: &[TraversalServer]) -> serde_json::Value {
    let list: Vec<_> = servers
        .iter()
        .map(|s| {
            json!({
                "urls": s.urls,
                "username": s.username,
                "credential": s.credential.as_ref().map(|_| "<redacted>"),
            })
        })
        .collect();
    json!({ "iceServers": list })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ProbeReport {
    frames: u64,
    timeouts: u64,
    pings: u64,
    closed_by_broker: bool,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} timeouts={} pings={} closed_by_broker={}",
            self.frames, self.timeouts, self.pings, self.closed_by_broker
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeOptions {
    receive_timeout: Duration,
    active_ping: bool,
    duration: Option<Duration>,
}

/// Bounded receive loop: logs every frame and every timeout until the broker closes
/// the channel, the duration elapses or `stop` resolves.
async fn run_probe(
    channel: &mut SignalingChannel,
    opts: ProbeOptions,
    stop: impl Future<Output = ()>,
) -> Result<ProbeReport> {
    let deadline = opts.duration.map(|d| Instant::now() + d);
    let mut report = ProbeReport::default();
    tokio::pin!(stop);

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("probe duration elapsed");
            break;
        }
        tokio::select! {
            _ = &mut stop => {
                info!("interrupt received, stopping probe");
                break;
            }
            frame = channel.receive(opts.receive_timeout) => match frame? {
                Frame::Text(text) => {
                    report.frames += 1;
                    info!(%text, "frame received");
                }
                Frame::TimedOut => {
                    report.timeouts += 1;
                    debug!("receive timeout");
                    if opts.active_ping {
                        channel.ping().await?;
                        report.pings += 1;
                    }
                }
                Frame::Closed => {
                    error!("signaling channel closed");
                    report.closed_by_broker = true;
                    break;
                }
            },
        }
    }

    channel.close().await;
    Ok(report)
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Ice { broker, ttl, json } => {
            let config = broker.config()?;
            let creds = acquire(&config, Duration::from_secs(ttl.max(1))).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&servers_json(&creds.servers))?);
            } else {
                for server in &creds.servers {
                    println!("{}", describe_server(server));
                }
                println!("token:   <redacted> ({} chars)", creds.token.len());
                println!("expires: in {}s", creds.ttl.as_secs());
            }
        }
        Command::Host { broker, attempts } => {
            let config = broker.config()?;
            let creds = acquire(&config, config.credential_ttl).await?;
            let endpoint = resolve(&config, &creds, attempts).await?;
            println!("{endpoint}");
        }
        Command::Probe {
            broker,
            active_ping,
            duration,
            receive_timeout_ms,
        } => {
            let config = broker.config()?;
            let creds = acquire(&config, config.credential_ttl).await?;
            let endpoint = resolve(&config, &creds, config.resolve_attempts).await?;
            let keep_alive = if active_ping {
                KeepAliveMode::Caller
            } else {
                KeepAliveMode::Disabled
            };

            info!(%endpoint, active_ping, "starting signaling probe");
            let mut channel = SignalingChannel::connect(&endpoint, keep_alive).await?;
            let opts = ProbeOptions {
                receive_timeout: Duration::from_millis(receive_timeout_ms.max(1)),
                active_ping,
                duration: duration.map(Duration::from_secs),
            };
            let stop = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let report = run_probe(&mut channel, opts, stop).await?;
            println!("{report}");
        }
        Command::Version => {
            println!("relaylink {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    relaylink_common::init_tracing_with_default(if args.verbose { "debug" } else { "info" });

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(args.command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use relaylink_client::{SignalingEndpoint, TraversalProtocol};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_parse_probe() {
        let args = Args::parse_from([
            "relaylink",
            "probe",
            "https://b.example/xirsys",
            "bob",
            "-a",
            "--duration",
            "30",
        ]);
        match args.command {
            Command::Probe {
                broker,
                active_ping,
                duration,
                receive_timeout_ms,
            } => {
                assert_eq!(broker.channel, DEFAULT_CHANNEL);
                assert!(active_ping);
                assert_eq!(duration, Some(30));
                assert_eq!(receive_timeout_ms, 1000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_broker_url_must_be_http() {
        let args = Args::parse_from(["relaylink", "ice", "wss://b.example", "bob"]);
        let Command::Ice { broker, .. } = args.command else {
            panic!("expected ice");
        };
        assert!(broker.config().is_err());
    }

    #[test]
    fn test_server_description_hides_credential() {
        let server = TraversalServer {
            urls: vec!["turn:x".into()],
            protocol: TraversalProtocol::Turn,
            username: Some("u".into()),
            credential: Some("secret".into()),
        };
        let line = describe_server(&server);
        assert!(line.starts_with("turn"));
        assert!(line.contains("user=u"));
        assert!(!line.contains("secret"));

        let value = servers_json(&[server]);
        assert_eq!(value["iceServers"][0]["credential"], "<redacted>");
        assert_eq!(value["iceServers"][0]["urls"][0], "turn:x");
    }

    /// Accepts one websocket, sends `frames`, then closes if `close` is set.
    async fn broker_stub(frames: Vec<&'static str>, close: bool) -> SignalingEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            if close {
                let _ = ws.close(None).await;
            } else {
                while ws.next().await.is_some() {}
            }
        });
        SignalingEndpoint::from_host(&format!("ws://{addr}"), "tok").unwrap()
    }

    #[tokio::test]
    async fn test_probe_counts_frames_until_close() {
        let endpoint = broker_stub(vec!["{\"m\":{\"o\":\"peers\"}}", "hello"], true).await;
        let mut channel = SignalingChannel::connect(&endpoint, KeepAliveMode::Disabled)
            .await
            .unwrap();
        let opts = ProbeOptions {
            receive_timeout: Duration::from_millis(200),
            active_ping: false,
            duration: None,
        };

        let report = run_probe(&mut channel, opts, std::future::pending())
            .await
            .unwrap();
        assert_eq!(report.frames, 2);
        assert!(report.closed_by_broker);
    }

    #[tokio::test]
    async fn test_probe_pings_on_timeouts_until_duration() {
        let endpoint = broker_stub(Vec::new(), false).await;
        let mut channel = SignalingChannel::connect(&endpoint, KeepAliveMode::Caller)
            .await
            .unwrap();
        let opts = ProbeOptions {
            receive_timeout: Duration::from_millis(50),
            active_ping: true,
            duration: Some(Duration::from_millis(400)),
        };

        let report = run_probe(&mut channel, opts, std::future::pending())
            .await
            .unwrap();
        assert!(report.timeouts >= 2, "{report}");
        assert_eq!(report.pings, report.timeouts);
        assert!(!report.closed_by_broker);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_probe_stops_on_signal() {
        let endpoint = broker_stub(Vec::new(), false).await;
        let mut channel = SignalingChannel::connect(&endpoint, KeepAliveMode::Disabled)
            .await
            .unwrap();
        let opts = ProbeOptions {
            receive_timeout: Duration::from_secs(5),
            active_ping: false,
            duration: None,
        };

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            run_probe(&mut channel, opts, async {}),
        )
        .await
        .expect("probe ignored the stop signal")
        .unwrap();
        assert_eq!(report, ProbeReport::default());
    }
}
