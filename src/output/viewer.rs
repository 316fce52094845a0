//! Live viewer sink.
//!
//! Spawns a local Wireshark reading the capture stream from its stdin. The
//! user can close the window at any moment; the capture itself must keep
//! running, so a dead viewer only produces one detach event and swallows
//! everything written to it afterwards.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SinkError;
use crate::output::{Outputer, OutputerEvent, OutputerEventSender, OutputerId};

const WIRESHARK_BIN: &str = "wireshark";

/// Arguments putting Wireshark into live-capture-from-stdin mode.
const WIRESHARK_ARGS: [&str; 3] = ["-k", "-i", "-"];

/// Sink forwarding the capture stream to a spawned viewer process.
pub struct WiresharkOutput {
    id: OutputerId,
    child_pid: u32,
    stdin: Option<ChildStdin>,
    dead: Arc<AtomicBool>,
}

impl WiresharkOutput {
    /// Spawn a Wireshark window wired to this sink.
    ///
    /// The exit watcher emits [`OutputerEvent::Dead`] on `events` exactly
    /// once, whether the viewer exits on its own or because the sink was
    /// closed.
    pub fn spawn(events: OutputerEventSender) -> Result<Self, SinkError> {
        Self::spawn_program(WIRESHARK_BIN, &WIRESHARK_ARGS, events)
    }

    fn spawn_program(
        program: &str,
        args: &[&str],
        events: OutputerEventSender,
    ) -> Result<Self, SinkError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SinkError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SinkError::Stdin)?;
        let child_pid = child.id();
        let id = OutputerId::next();
        let dead = Arc::new(AtomicBool::new(false));

        Self::watch(child, id, dead.clone(), events);

        Ok(Self {
            id,
            child_pid,
            stdin: Some(stdin),
            dead,
        })
    }

    /// Wait for the viewer to exit and report it exactly once.
    fn watch(mut child: Child, id: OutputerId, dead: Arc<AtomicBool>, events: OutputerEventSender) {
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => tracing::info!(sink = id.0, %status, "viewer process exited"),
                Err(e) => tracing::warn!(error = %e, "can't wait for viewer process"),
            }
            dead.store(true, Ordering::SeqCst);
            let _ = events.send(OutputerEvent::Dead(id));
        });
    }
}

impl Outputer for WiresharkOutput {
    fn id(&self) -> OutputerId {
        self.id
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            // The detach event is already on its way; drop the bytes.
            return Ok(());
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };

        match stdin.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // Viewer is going away; the watcher will announce it.
                self.stdin = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        self.stdin.take();
        if !self.dead.load(Ordering::SeqCst) && self.child_pid != 0 {
            // Wireshark keeps its window open after stdin EOF; nudge it so
            // the watcher can reap it and the fan-out can drain.
            unsafe {
                libc::kill(self.child_pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn spawn_failure_is_a_sink_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WiresharkOutput::spawn_program("remcap-no-such-viewer", &[], tx);

        assert!(matches!(result, Err(SinkError::Spawn { .. })));
    }

    #[tokio::test]
    async fn viewer_exit_emits_exactly_one_dead_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // `cat` stands in for the viewer: consumes stdin, exits on EOF.
        let mut sink = WiresharkOutput::spawn_program("cat", &[], tx).unwrap();
        let id = sink.id();

        sink.write(b"capture bytes").unwrap();
        sink.close();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the exit")
            .expect("channel open");
        assert_eq!(event, OutputerEvent::Dead(id));

        // No second event; the channel just closes when the watcher drops
        // its sender.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writes_after_death_are_discarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = WiresharkOutput::spawn_program("cat", &[], tx).unwrap();

        sink.close();
        let _ = rx.recv().await;

        // The viewer is gone; writes must neither error nor block.
        sink.write(b"late bytes").unwrap();
        sink.write(b"more late bytes").unwrap();
    }
}
