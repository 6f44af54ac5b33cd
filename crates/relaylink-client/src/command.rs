//! Remote command requests carried as bare text messages.
//!
//! Only programs on the configured allow-list run. The reply is always a single line of
//! text: stdout with newlines replaced by `<BR>`, or a `can not execute ...` notice.

use relaylink_common::helpers::mark_line_breaks;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time;
use tracing::{info, warn};

use crate::types::CommandPolicy;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    policy: CommandPolicy,
}

impl CommandExecutor {
    pub fn new(policy: CommandPolicy) -> Self {
        Self { policy }
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.policy.allowed_programs.iter().any(|p| p == program)
    }

    /// Runs `command_line` and renders the reply text. Never fails.
    pub async fn execute(&self, command_line: &str) -> String {
        let mut argv = command_line.split_whitespace();
        let Some(program) = argv.next() else {
            return "can not execute an empty command".to_string();
        };
        if !self.is_allowed(program) {
            warn!(%program, "remote command not on the allow-list");
            return format!("can not execute {command_line}: not allowed");
        }

        info!(%command_line, "executing remote command");
        let child = Command::new(program)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match time::timeout(self.policy.timeout, child).await {
            Err(_) => {
                warn!(%command_line, timeout = ?self.policy.timeout, "remote command timed out");
                format!("can not execute {command_line}: timed out")
            }
            Ok(Err(e)) => {
                warn!(%command_line, error = %e, "remote command failed to start");
                format!("can not execute {command_line}: {e}")
            }
            Ok(Ok(output)) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(%command_line, status = %output.status, stderr = %stderr.trim(), "remote command failed");
                format!("can not execute {command_line}: {}", output.status)
            }
            Ok(Ok(output)) => mark_line_breaks(&String::from_utf8_lossy(&output.stdout)),
        }
    }
}
