//! Capture byte sinks.
//!
//! This module defines the `Outputer` trait and the fan-out that feeds one
//! inbound capture stream to any number of sinks. Sinks are created through
//! factory callables that receive the fan-out's event sender, so the
//! orchestration layer never learns how a sink is built (or that building
//! one forks a child process).

mod fanout;
mod file;
mod viewer;

pub use fanout::FanOut;
pub use file::FileOutput;
pub use viewer::WiresharkOutput;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::SinkError;

/// Length of the fixed pcap file header.
///
/// The header is opaque to this crate; it is captured verbatim from the
/// start of the stream and replayed at the head of every late-attached sink
/// and every rotated file.
pub const PCAP_HEADER_LEN: usize = 24;

/// Opaque identity token for a sink.
///
/// Events carry this token instead of a reference back into the fan-out, so
/// sinks and their owner never form a reference cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputerId(u64);

impl OutputerId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Event sent from a sink back to the fan-out that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputerEvent {
    /// The sink's backing process exited; the sink is to be detached.
    Dead(OutputerId),
}

/// Sender half of a fan-out's event channel, handed to sink factories.
pub type OutputerEventSender = mpsc::UnboundedSender<OutputerEvent>;

/// A byte consumer attached to a [`FanOut`].
///
/// Writes are assumed bounded: a sink may touch the disk or a pipe (OS
/// buffering absorbs short stalls) but must not wait for a slow peer.
/// Write errors are swallowed by the fan-out; they never reach the
/// producer.
pub trait Outputer: Send {
    /// Identity token used in [`OutputerEvent`]s.
    fn id(&self) -> OutputerId;

    /// Consume the next chunk of the capture stream.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush and release the sink's resources.
    fn close(&mut self);
}

/// Factory creating a sink wired to the fan-out's event channel.
pub type OutputerFactory =
    Arc<dyn Fn(OutputerEventSender) -> Result<Box<dyn Outputer>, SinkError> + Send + Sync>;
