//! tcpdump-based capturer.
//!
//! Runs `tcpdump -U -w - -i any` on the target over SSH, pumps its stdout
//! into the output fan-out and its stderr through the pid sniffer. An
//! elevated sniffer detaches from the remote shell, so stopping it takes a
//! second short-lived session issuing a `kill` by pid.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::capture::stderr::{PidSniffer, PID_MARKER};
use crate::capture::{Capturer, CapturerEvent, CapturerEventKind, CapturerEventSender};
use crate::error::{SinkError, StartError, StopError};
use crate::output::{FanOut, OutputerFactory};
use crate::remote::{SshEndpoint, SshSession};

/// How long a stopped sniffer gets to flush and EOF its stdout before the
/// session is closed underneath it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Bound on the kill-by-pid session.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Elevation settings for the remote sniffer.
#[derive(Debug, Clone, Default)]
pub struct SudoConfig {
    pub enabled: bool,
    /// Sudo target user; root when unset.
    pub user: Option<String>,
}

/// Capture filter settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterConfig {
    /// Restrict the capture to one TCP/UDP port.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Starting,
    Running,
    Stopping,
    Terminal,
}

/// One managed tcpdump capture for one target.
pub struct TcpdumpCapturer {
    name: String,
    endpoint: SshEndpoint,
    sudo: SudoConfig,
    filter: FilterConfig,
    fanout: Arc<FanOut>,
    events: CapturerEventSender,
    pid: Arc<PidSniffer>,
    state: Arc<Mutex<State>>,
    session: Arc<Mutex<Option<SshSession>>>,
    stdout_eof_tx: Arc<watch::Sender<bool>>,
    stdout_eof_rx: watch::Receiver<bool>,
}

impl TcpdumpCapturer {
    pub fn new(
        name: impl Into<String>,
        endpoint: SshEndpoint,
        sudo: SudoConfig,
        filter: FilterConfig,
        fanout: Arc<FanOut>,
        events: CapturerEventSender,
    ) -> Self {
        let (stdout_eof_tx, stdout_eof_rx) = watch::channel(false);
        Self {
            name: name.into(),
            endpoint,
            sudo,
            filter,
            fanout,
            events,
            pid: Arc::new(PidSniffer::new()),
            state: Arc::new(Mutex::new(State::Init)),
            session: Arc::new(Mutex::new(None)),
            stdout_eof_tx: Arc::new(stdout_eof_tx),
            stdout_eof_rx,
        }
    }
}

/// Remote command line for the sniffer.
///
/// The shell announces its own pid on stderr and then execs tcpdump, so
/// the announced pid is the sniffer's. Under sudo the announcing shell
/// itself runs elevated, keeping the pid valid for the later kill.
fn capture_command(sudo: &SudoConfig, filter: &FilterConfig) -> String {
    let mut sniffer = String::from("tcpdump -U -w - -i any");
    if let Some(port) = filter.port {
        let _ = write!(sniffer, " port {port}");
    }

    let announce_and_exec = format!("echo \"{PID_MARKER}$$\" 1>&2 && exec {sniffer}");

    if !sudo.enabled {
        return announce_and_exec;
    }

    match &sudo.user {
        Some(user) => format!("sudo -n -u {user} sh -c '{announce_and_exec}'"),
        None => format!("sudo -n sh -c '{announce_and_exec}'"),
    }
}

/// Kill command issued over the second session on the sudo stop path.
fn kill_command(pid: i32, sudo: &SudoConfig) -> String {
    if sudo.enabled {
        format!("sudo -n kill {pid}")
    } else {
        format!("kill {pid}")
    }
}

#[async_trait]
impl Capturer for TcpdumpCapturer {
    async fn start(&self) -> Result<(), StartError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Init {
                return Err(StartError::AlreadyStarted);
            }
            *state = State::Starting;
        }

        let command = capture_command(&self.sudo, &self.filter);
        tracing::info!(name = %self.name, %command, "starting remote capture");

        let mut session = match SshSession::run(&self.endpoint, &command) {
            Ok(session) => session,
            Err(e) => {
                *self.state.lock().unwrap() = State::Terminal;
                self.fanout.close().await;
                return Err(e);
            }
        };

        let (Some(mut stdout), Some(mut stderr)) = (session.take_stdout(), session.take_stderr())
        else {
            session.close().await;
            *self.state.lock().unwrap() = State::Terminal;
            self.fanout.close().await;
            return Err(StartError::Streams);
        };

        *self.session.lock().unwrap() = Some(session);

        // stderr carries the pid announcement and nothing of interest
        // afterwards; keep draining it so the remote end never blocks.
        let sniffer = self.pid.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sniffer.write(&buf[..n]),
                }
            }
        });

        // stdout is the capture stream. EOF means the remote command is
        // gone; whoever owns the state transition at that point finishes
        // the teardown and emits the one lifecycle event.
        let fanout = self.fanout.clone();
        let state = self.state.clone();
        let session = self.session.clone();
        let events = self.events.clone();
        let stdout_eof = self.stdout_eof_tx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Err(e) => {
                        tracing::warn!(name = %name, error = %e, "remote stdout read failed");
                        break;
                    }
                    Ok(n) => fanout.write(&buf[..n]),
                }
            }

            let _ = stdout_eof.send(true);

            let unexpected = {
                let mut state = state.lock().unwrap();
                match *state {
                    State::Stopping | State::Terminal => false,
                    _ => {
                        *state = State::Terminal;
                        true
                    }
                }
            };

            if unexpected {
                tracing::error!(name = %name, "remote capture ended unexpectedly");
                let session = session.lock().unwrap().take();
                if let Some(mut session) = session {
                    session.close().await;
                }
                fanout.close().await;
                let _ = events.send(CapturerEvent {
                    name,
                    kind: CapturerEventKind::Dead,
                });
            }
        });

        *self.state.lock().unwrap() = State::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), StopError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Running => *state = State::Stopping,
                // Stopping, Terminal, or never started: nothing to do.
                _ => return Ok(()),
            }
        }

        let mut kill_err = None;

        if self.sudo.enabled {
            // The elevated sniffer survives its shell; reconnect and
            // signal it by pid before pulling the session away.
            let pid = self.pid.pid();
            if pid > 0 {
                let command = kill_command(pid, &self.sudo);
                tracing::info!(name = %self.name, pid, "signalling remote sniffer");
                match SshSession::exec(&self.endpoint, &command, KILL_TIMEOUT).await {
                    Ok(_) => {
                        let mut rx = self.stdout_eof_rx.clone();
                        let eof_seen = *rx.borrow();
                        if !eof_seen {
                            let _ = tokio::time::timeout(STOP_GRACE, rx.changed()).await;
                        }
                    }
                    Err(e) => {
                        kill_err = Some(StopError::Kill {
                            pid,
                            reason: e.to_string(),
                        });
                    }
                }
            } else {
                kill_err = Some(StopError::PidUnknown);
            }
        }

        let session = self.session.lock().unwrap().take();
        if let Some(mut session) = session {
            session.close().await;
        }

        self.fanout.close().await;

        let _ = self.events.send(CapturerEvent {
            name: self.name.clone(),
            kind: CapturerEventKind::Stopped,
        });

        *self.state.lock().unwrap() = State::Terminal;

        match kill_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn add_outputer(&self, factory: &OutputerFactory) -> Result<(), SinkError> {
        self.fanout.add_sink(factory)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_capture_command() {
        let command = capture_command(&SudoConfig::default(), &FilterConfig::default());

        assert_eq!(
            command,
            "echo \"REMCAP_PID:$$\" 1>&2 && exec tcpdump -U -w - -i any"
        );
    }

    #[test]
    fn filter_port_appended_to_sniffer() {
        let filter = FilterConfig { port: Some(443) };
        let command = capture_command(&SudoConfig::default(), &filter);

        assert!(command.ends_with("exec tcpdump -U -w - -i any port 443"));
    }

    #[test]
    fn sudo_wraps_the_announcing_shell() {
        let sudo = SudoConfig {
            enabled: true,
            user: None,
        };
        let command = capture_command(&sudo, &FilterConfig::default());

        assert_eq!(
            command,
            "sudo -n sh -c 'echo \"REMCAP_PID:$$\" 1>&2 && exec tcpdump -U -w - -i any'"
        );
    }

    #[test]
    fn sudo_user_selects_the_target_account() {
        let sudo = SudoConfig {
            enabled: true,
            user: Some("pcap".to_string()),
        };
        let command = capture_command(&sudo, &FilterConfig::default());

        assert!(command.starts_with("sudo -n -u pcap sh -c '"));
    }

    #[test]
    fn sudo_kill_goes_through_sudo() {
        let sudo = SudoConfig {
            enabled: true,
            user: None,
        };

        assert_eq!(kill_command(4711, &sudo), "sudo -n kill 4711");
    }

    #[test]
    fn plain_kill_without_sudo() {
        assert_eq!(kill_command(4711, &SudoConfig::default()), "kill 4711");
    }
}
