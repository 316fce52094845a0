//! Remote capture sessions.
//!
//! This module defines the `Capturer` trait and provides the tcpdump-based
//! implementation plus the registry holding the active capturers. The
//! trait keeps the registry and the shell commands independent of the
//! concrete sniffer; other backends (tshark, dumpcap) would slot in behind
//! the same contract.

mod registry;
mod stderr;
mod tcpdump;

pub use registry::Registry;
pub use stderr::{PidSniffer, PID_MARKER};
pub use tcpdump::{FilterConfig, SudoConfig, TcpdumpCapturer};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SinkError, StartError, StopError};
use crate::output::OutputerFactory;

/// What ended a capturer's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturerEventKind {
    /// Stopped on command.
    Stopped,
    /// The remote sniffer exited on its own.
    Dead,
}

/// Lifecycle event sent from a capturer to the registry.
///
/// The target name doubles as the capturer's identity; it is the key the
/// registry removes on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturerEvent {
    pub name: String,
    pub kind: CapturerEventKind,
}

/// Sender half of the registry's lifecycle event channel.
pub type CapturerEventSender = mpsc::UnboundedSender<CapturerEvent>;

/// One managed remote capture for one target.
///
/// Exactly one [`CapturerEvent`] is emitted per capturer, always after all
/// of its sinks have been closed.
#[async_trait]
pub trait Capturer: Send + Sync {
    /// Open the remote session and start streaming.
    async fn start(&self) -> Result<(), StartError>;

    /// Tear the capture down. Idempotent; a second call is a no-op.
    async fn stop(&self) -> Result<(), StopError>;

    /// Attach another output sink to the running capture.
    fn add_outputer(&self, factory: &OutputerFactory) -> Result<(), SinkError>;

    /// Target name; unique within a registry.
    fn name(&self) -> &str;
}
