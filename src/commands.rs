//! Shell command handlers.
//!
//! The interactive shell parses lines and calls into here; everything the
//! user sees goes through the injected [`Feedback`] so the handlers stay
//! testable and the core stays quiet on stdout.

use std::sync::Arc;
use std::time::Duration;

use crate::capture::{Capturer, FilterConfig, Registry, SudoConfig, TcpdumpCapturer};
use crate::config::{Config, TargetSpec};
use crate::feedback::Feedback;
use crate::output::{FanOut, FileOutput, Outputer, OutputerFactory, WiresharkOutput};
use crate::remote::{SshEndpoint, SshSession};

/// Bound on the per-target probe run by the targets command.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn endpoint_of(target: &TargetSpec) -> SshEndpoint {
    SshEndpoint::new(
        target.host.clone(),
        target.port,
        target.user.clone(),
        target.key.clone(),
    )
}

fn sudo_of(target: &TargetSpec) -> SudoConfig {
    SudoConfig {
        enabled: target.use_sudo,
        user: target.sudo_user.clone(),
    }
}

/// Start a capturer for every configured target.
///
/// Aborts on the first target that fails; targets already started keep
/// running and can be stopped with the stop command.
pub async fn cmd_start(registry: &Registry, config: &Config, feedback: &Feedback) {
    if !registry.is_empty() {
        feedback.emit("There is already a running capture");
        return;
    }

    tracing::info!("start command");

    for target in &config.targets {
        let file = match FileOutput::new(
            &target.destination,
            &target.file_pattern,
            target.file_rotation_count,
        ) {
            Ok(file) => file,
            Err(e) => {
                feedback.emit(&format!(
                    "Can't create file output for target <{}>: {}",
                    target.name, e
                ));
                return;
            }
        };

        let fanout = FanOut::new(vec![Box::new(file) as Box<dyn Outputer>]);
        let capturer: Arc<dyn Capturer> = Arc::new(TcpdumpCapturer::new(
            target.name.clone(),
            endpoint_of(target),
            sudo_of(target),
            FilterConfig {
                port: target.filter_port,
            },
            fanout,
            registry.event_sender(),
        ));

        if let Err(e) = capturer.start().await {
            feedback.emit(&format!("{e}"));
            return;
        }

        if let Err(e) = registry.add(capturer) {
            feedback.emit(&format!("Error adding capturer: {e}"));
        }
    }
}

/// Stop every running capturer.
pub async fn cmd_stop(registry: &Registry, feedback: &Feedback) {
    if registry.is_empty() {
        feedback.emit("There are no running captures.");
        return;
    }

    tracing::info!("stop command");
    registry.stop_all().await;
}

/// Open a Wireshark window on the named targets (all of them when `names`
/// is empty).
pub fn cmd_wireshark(registry: &Registry, names: &[String]) {
    tracing::info!(?names, "wireshark command");

    let factory: OutputerFactory =
        Arc::new(|events| WiresharkOutput::spawn(events).map(|s| Box::new(s) as Box<dyn Outputer>));

    registry.broadcast(&factory, names);
}

/// Probe every configured target: can we log in, and is tcpdump usable
/// with the configured privileges?
pub async fn cmd_targets(config: &Config, feedback: &Feedback) {
    tracing::info!("targets command");

    for target in &config.targets {
        feedback.emit(&format!("=== Running checks for target <{}> ===", target.name));

        let probe = if target.use_sudo {
            "sudo -n tcpdump --version"
        } else {
            "tcpdump --version"
        };

        match SshSession::exec(&endpoint_of(target), probe, PROBE_TIMEOUT).await {
            Ok(output) => {
                let version = output.lines().next().unwrap_or("tcpdump found");
                feedback.emit(version);
            }
            Err(e) => feedback.emit(&format!("{e}")),
        }
    }
}
