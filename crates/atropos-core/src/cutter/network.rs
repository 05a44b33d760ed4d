//! Remote-shell cutter.
//!
//! Claims `ssh_*` actions and runs the strategy's command on the node over
//! SSH. Authentication is agent-only: keys come from the socket named by
//! `SSH_AUTH_SOCK`, never from prompts or key files. The remote host key is
//! checked against a known-hosts file; unknown or changed keys fail the cut.
//!
//! The blocking SSH session runs on a dedicated blocking task. When the
//! engine's deadline fires, the caller drops this future and returns without
//! waiting for the remote side; the detached task finishes on its own.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use tracing::info;

use super::{CutError, CutParams, Cutter};

/// Per-operation timeout applied to the libssh2 session (handshake, auth,
/// channel I/O). Mirrors the connect timeout, not the overall cut deadline.
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NetworkCutter;

impl NetworkCutter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkCutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cutter for NetworkCutter {
    fn name(&self) -> &str {
        "network"
    }

    fn can_handle(&self, action: &str) -> bool {
        action.starts_with("ssh_")
    }

    async fn execute(&self, target: &str, params: &CutParams) -> Result<(), CutError> {
        let host = params.get("host").cloned().unwrap_or_default();
        let command = params.get("command").cloned().unwrap_or_default();
        let user = params
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .unwrap_or_else(|| "root".to_string());
        let port = params
            .get("port")
            .filter(|p| !p.is_empty())
            .cloned()
            .unwrap_or_else(|| "22".to_string());
        let known_hosts = params.get("known_hosts").cloned().unwrap_or_default();

        if host.is_empty() {
            return Err(CutError::Usage(format!(
                "shell cutter requires host for target {target}"
            )));
        }
        if command.is_empty() {
            return Err(CutError::Usage("shell cutter requires command".to_string()));
        }

        info!(
            target = %target,
            host = %host,
            command = %command,
            op = "network_cut",
            "shell cut"
        );

        tokio::task::spawn_blocking(move || run_remote(&user, &host, &port, &known_hosts, &command))
            .await
            .map_err(|e| CutError::Backend(format!("ssh task: {e}")))?
    }
}

/// Connect, authenticate via the agent, verify the host key, and run the
/// command. Non-zero exit status fails with the combined remote output.
fn run_remote(
    user: &str,
    host: &str,
    port: &str,
    known_hosts: &str,
    command: &str,
) -> Result<(), CutError> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Err(CutError::Backend(
            "no SSH auth available; start ssh-agent".to_string(),
        ));
    }

    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr)
        .map_err(|e| CutError::Backend(format!("ssh connect {addr}: {e}")))?;

    let mut session =
        Session::new().map_err(|e| CutError::Backend(format!("ssh session: {e}")))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(SESSION_TIMEOUT.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| CutError::Backend(format!("ssh handshake: {e}")))?;

    verify_host_key(&session, host, port, known_hosts)?;

    session
        .userauth_agent(user)
        .map_err(|e| CutError::Backend(format!("ssh agent auth as {user}: {e}")))?;

    let mut channel = session
        .channel_session()
        .map_err(|e| CutError::Backend(format!("ssh channel: {e}")))?;
    channel
        .exec(command)
        .map_err(|e| CutError::Backend(format!("ssh exec: {e}")))?;

    let mut output = String::new();
    channel.read_to_string(&mut output).ok();
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();

    let status = channel
        .exit_status()
        .map_err(|e| CutError::Backend(format!("ssh exit status: {e}")))?;
    if status != 0 {
        return Err(CutError::Backend(format!(
            "command failed with status {status}, output: {output}{stderr}"
        )));
    }

    Ok(())
}

/// Pin the remote host key against a known-hosts file. The node policy may
/// name one; otherwise `~/.ssh/known_hosts` is used.
fn verify_host_key(
    session: &Session,
    host: &str,
    port: &str,
    known_hosts_override: &str,
) -> Result<(), CutError> {
    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| CutError::Backend(format!("no host key offered by {host}")))?;

    let path = if known_hosts_override.is_empty() {
        default_known_hosts_path()
    } else {
        PathBuf::from(known_hosts_override)
    };

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| CutError::Backend(format!("known_hosts init: {e}")))?;
    known_hosts
        .read_file(&path, KnownHostFileKind::OpenSSH)
        .map_err(|e| {
            CutError::Backend(format!("read known_hosts {}: {e}", path.display()))
        })?;

    let port: u16 = port.parse().unwrap_or(22);
    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(CutError::Backend(format!(
            "host key mismatch for {host}; refusing to connect"
        ))),
        CheckResult::NotFound => Err(CutError::Backend(format!(
            "host {host} not present in {}",
            path.display()
        ))),
        CheckResult::Failure => Err(CutError::Backend(format!(
            "host key check failed for {host}"
        ))),
    }
}

fn default_known_hosts_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ssh").join("known_hosts"),
        None => PathBuf::from("/etc/ssh/ssh_known_hosts"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> CutParams {
        let mut params = CutParams::new();
        params.insert("action".to_string(), "ssh_isolate_network".to_string());
        params.insert("host".to_string(), "10.0.0.21".to_string());
        params.insert(
            "command".to_string(),
            "systemctl stop wireguard@wg0".to_string(),
        );
        params
    }

    #[test]
    fn claims_ssh_prefix_only() {
        let cutter = NetworkCutter::new();
        assert!(cutter.can_handle("ssh_isolate_network"));
        assert!(!cutter.can_handle("docker_stop_all"));
    }

    #[tokio::test]
    async fn missing_host_is_usage_error() {
        let cutter = NetworkCutter::new();
        let mut params = base_params();
        params.remove("host");

        let err = cutter.execute("athena", &params).await.unwrap_err();
        assert!(matches!(err, CutError::Usage(_)));
        assert!(err.to_string().contains("athena"));
    }

    #[tokio::test]
    async fn missing_command_is_usage_error() {
        let cutter = NetworkCutter::new();
        let mut params = base_params();
        params.remove("command");

        let err = cutter.execute("athena", &params).await.unwrap_err();
        assert!(matches!(err, CutError::Usage(_)));
        assert!(err.to_string().contains("command"));
    }
}
