//! SSH session management on top of the `ssh` binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::{ExecError, StartError};

/// Connection timeout passed to the ssh client.
const CONNECT_TIMEOUT_SECS: u32 = 5;

/// Where to reach a target and how to authenticate.
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: PathBuf,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, key: PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            key,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Base ssh invocation shared by long-running sessions and one-shot execs.
///
/// Key-only batch mode: a host that would prompt for a password fails fast
/// instead of hanging the controller.
fn base_command(endpoint: &SshEndpoint) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-o").arg("BatchMode=yes");
    cmd.arg("-o").arg("StrictHostKeyChecking=no");
    cmd.arg("-o")
        .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
    cmd.arg("-p").arg(endpoint.port.to_string());
    cmd.arg("-i").arg(&endpoint.key);
    cmd.arg(endpoint.destination());
    cmd
}

/// One authenticated remote session running one command.
pub struct SshSession {
    child: Child,
}

impl SshSession {
    /// Open a session to `endpoint` and start `command` on it.
    ///
    /// stdout and stderr are piped and can each be taken exactly once.
    pub fn run(endpoint: &SshEndpoint, command: &str) -> Result<Self, StartError> {
        let mut cmd = base_command(endpoint);
        cmd.arg(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| StartError::Session {
            host: endpoint.host.clone(),
            source,
        })?;

        Ok(Self { child })
    }

    /// Take the remote command's stdout stream.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the remote command's stderr stream.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Terminate the session.
    ///
    /// Kills the local ssh client, which takes the remote command with it
    /// unless that command has detached from the remote shell.
    pub async fn close(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Run a short command on a fresh session and collect its stdout.
    ///
    /// Used for the kill-by-pid escape hatch and for target probing; never
    /// for the capture stream itself.
    pub async fn exec(
        endpoint: &SshEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let mut cmd = base_command(endpoint);
        cmd.arg(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => Err(ExecError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(source)) => Err(ExecError::Spawn(source)),
            Err(_) => Err(ExecError::Timeout(timeout)),
        }
    }
}
