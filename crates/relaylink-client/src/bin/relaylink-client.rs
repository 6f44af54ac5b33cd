use clap::Parser;
use relaylink_client::types::{DEFAULT_CHANNEL, DEFAULT_COMMAND_TIMEOUT};
use relaylink_client::{
    run_client, ClientConfig, ClosePolicy, CommandPolicy, KeepAliveMode, NegotiationRole,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relaylink-client", version, about = "Broker signaling client")]
struct Args {
    /// URL prefix under which getice.php, gethost.php and gettoken.php live
    #[arg(env = "RELAYLINK_BROKER_URL")]
    broker_url: String,
    /// User name announced on the signaling channel
    #[arg(env = "RELAYLINK_USER")]
    user_name: String,
    #[arg(short, long, env = "RELAYLINK_CHANNEL", default_value = DEFAULT_CHANNEL)]
    channel: String,
    /// VP8 IVF file to stream; a test pattern is sent when absent or unreadable
    #[arg(short = 'f', long)]
    video_file: Option<PathBuf>,
    /// Seconds of silence before the channel pings the broker
    #[arg(long, default_value_t = 20)]
    keepalive_interval: u64,
    /// Never send keep-alive pings
    #[arg(short = 'p', long, conflicts_with = "active_ping")]
    disable_keepalive: bool,
    /// Ping on every receive timeout instead of when idle
    #[arg(short, long)]
    active_ping: bool,
    /// Requested credential lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    credential_ttl: u64,
    /// What to do when the broker closes the signaling channel
    #[arg(long, value_enum, default_value_t = ClosePolicy::Terminate)]
    on_close: ClosePolicy,
    #[arg(long, value_enum, default_value_t = NegotiationRole::Responder)]
    role: NegotiationRole,
    /// Program that remote peers may run (repeatable); commands are disabled without one
    #[arg(long = "allow-command", value_name = "PROGRAM")]
    allow_commands: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    command_timeout: u64,
    /// Accept invalid broker TLS certificates
    #[arg(long, env = "RELAYLINK_INSECURE")]
    insecure: bool,
    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn keep_alive(&self) -> KeepAliveMode {
        if self.disable_keepalive {
            KeepAliveMode::Disabled
        } else if self.active_ping {
            KeepAliveMode::Caller
        } else {
            KeepAliveMode::Automatic {
                interval: Duration::from_secs(self.keepalive_interval.max(1)),
            }
        }
    }

    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::new(self.broker_url.clone(), self.user_name.clone());
        config.keep_alive = self.keep_alive();
        config.channel_name = self.channel;
        config.video_file = self.video_file;
        config.credential_ttl = Duration::from_secs(self.credential_ttl.max(1));
        config.close_policy = self.on_close;
        config.role = self.role;
        config.insecure_tls = self.insecure;
        if !self.allow_commands.is_empty() {
            let mut policy = CommandPolicy::new(self.allow_commands);
            policy.timeout = Duration::from_secs(self.command_timeout.max(1));
            config.commands = Some(policy);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    relaylink_common::init_tracing_with_default(if args.verbose { "debug" } else { "info" });

    let config = args.into_config();
    if let Err(e) = config.validate() {
        error!("{e}, exiting");
        std::process::exit(1);
    }
    info!(
        user = %config.user_name,
        broker = %config.broker_base(),
        "fetching traversal servers and a session token"
    );

    report(run(config))
}

fn run(config: ClientConfig) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_client(config))?;
    Ok(())
}

/// Logs how the client stopped. Only argument validation affects the exit status.
fn report(result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Ok(()) => info!("relaylink client finished"),
        Err(e) => error!(error = %format!("{e:#}"), "relaylink client stopped with an error"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let config = Args::parse_from(["relaylink-client", "https://b.example/xirsys", "bob"])
            .into_config();
        assert_eq!(config.channel_name, DEFAULT_CHANNEL);
        assert_eq!(config.keep_alive, KeepAliveMode::default());
        assert_eq!(config.close_policy, ClosePolicy::Terminate);
        assert!(config.commands.is_none());
    }

    #[test]
    fn test_keepalive_flags() {
        let config = Args::parse_from(["relaylink-client", "http://b", "bob", "-p"]).into_config();
        assert_eq!(config.keep_alive, KeepAliveMode::Disabled);
        let config = Args::parse_from(["relaylink-client", "http://b", "bob", "-a"]).into_config();
        assert_eq!(config.keep_alive, KeepAliveMode::Caller);
        assert!(Args::try_parse_from(["relaylink-client", "http://b", "bob", "-a", "-p"]).is_err());
    }

    #[test]
    fn test_command_allow_list_and_policies() {
        let config = Args::parse_from([
            "relaylink-client",
            "http://b",
            "bob",
            "--allow-command",
            "echo",
            "--allow-command",
            "uptime",
            "--on-close",
            "recycle",
            "--role",
            "caller",
        ])
        .into_config();
        let commands = config.commands.unwrap();
        assert_eq!(commands.allowed_programs, vec!["echo", "uptime"]);
        assert_eq!(config.close_policy, ClosePolicy::Recycle);
        assert_eq!(config.role, NegotiationRole::Caller);
    }

    #[test]
    fn test_runtime_errors_do_not_change_exit_status() {
        assert!(report(Err(anyhow::anyhow!("signaling send failed"))).is_ok());
        assert!(report(Ok(())).is_ok());
    }

    #[test]
    fn test_non_http_url_fails_validation() {
        let config = Args::parse_from(["relaylink-client", "ws://b", "bob"]).into_config();
        assert!(config.validate().is_err());
    }
}
