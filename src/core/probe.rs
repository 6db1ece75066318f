//! Environment discovery: local tools on `PATH` and remote reachability.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::Remote;
use crate::error::ReachabilityError;

/// Default bound on the reachability round trip.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(8);

/// Token echoed by the remote side; anything else counts as failure.
const REACHABILITY_MARKER: &str = "bkstream-ok";

#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Whether `name` resolves to an executable. Never runs the tool.
    fn tool_available(&self, name: &str) -> bool;

    /// Minimal authenticated round trip to the remote host.
    async fn remote_reachable(
        &self,
        remote: &Remote,
        timeout: Duration,
    ) -> Result<(), ReachabilityError>;

    /// Block device listing for the operator, if a listing tool is present.
    async fn list_block_devices(&self) -> Option<Vec<String>>;
}

/// Probe backed by the real `PATH` and `ssh`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait]
impl EnvironmentProbe for SystemProbe {
    fn tool_available(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    async fn remote_reachable(
        &self,
        remote: &Remote,
        timeout: Duration,
    ) -> Result<(), ReachabilityError> {
        let connect_timeout = timeout.as_secs().max(1);
        let mut cmd = Command::new("ssh");
        cmd.args(ssh_transport_args(remote.port))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", connect_timeout))
            .arg(remote.destination())
            .arg("echo")
            .arg(REACHABILITY_MARKER)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(remote = %remote, "Probing remote reachability");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ReachabilityError::Timeout(timeout.as_secs())),
        };

        if !output.status.success() {
            return Err(ReachabilityError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim() != REACHABILITY_MARKER {
            return Err(ReachabilityError::UnexpectedOutput(stdout.trim().to_string()));
        }

        Ok(())
    }

    async fn list_block_devices(&self) -> Option<Vec<String>> {
        let output = Command::new("lsblk")
            .args(["-o", "NAME,SIZE,TYPE,MODEL"])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        Some(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(|l| l.to_string())
                .collect(),
        )
    }
}

/// Options shared by every ssh invocation. `BatchMode` keeps ssh from
/// prompting on the terminal the TUI owns.
pub fn ssh_transport_args(port: u16) -> Vec<String> {
    vec![
        "-p".to_string(),
        port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_shell_but_not_nonsense() {
        let probe = SystemProbe;
        assert!(probe.tool_available("sh"));
        assert!(!probe.tool_available("definitely-not-a-real-tool-4f2a"));
    }

    #[test]
    fn transport_args_carry_port() {
        let args = ssh_transport_args(2222);
        assert_eq!(args[..2], ["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }
}
