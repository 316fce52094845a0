//! Stream fan-out with header replay.
//!
//! One capture stream in, N sinks out. The first 24 bytes of the stream
//! are buffered once and written to every sink attached later, so a viewer
//! opened mid-capture still receives a well-formed pcap stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::SinkError;
use crate::output::{Outputer, OutputerEvent, OutputerFactory, PCAP_HEADER_LEN};

struct Members {
    /// Attached sinks, in registration order.
    sinks: Vec<Box<dyn Outputer>>,
    /// The stream header. Grows to [`PCAP_HEADER_LEN`] once, then never
    /// changes.
    header: Vec<u8>,
}

/// Multiplexes one inbound byte stream to a dynamic set of sinks.
pub struct FanOut {
    members: Mutex<Members>,
    /// Sender handed to sink factories; dropped on close to end the event
    /// loop.
    events_tx: Mutex<Option<mpsc::UnboundedSender<OutputerEvent>>>,
    /// Number of attached sinks that will eventually report their death.
    outstanding: AtomicUsize,
    drained: Notify,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl FanOut {
    /// Create a fan-out over an initial set of sinks and start its event
    /// loop.
    ///
    /// Initial sinks (the file output) are owned until [`close`]; only
    /// sinks attached through [`add_sink`] report death events.
    ///
    /// [`close`]: FanOut::close
    /// [`add_sink`]: FanOut::add_sink
    pub fn new(sinks: Vec<Box<dyn Outputer>>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let fanout = Arc::new(Self {
            members: Mutex::new(Members {
                sinks,
                header: Vec::with_capacity(PCAP_HEADER_LEN),
            }),
            events_tx: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn({
            let fanout = fanout.clone();
            async move {
                while let Some(event) = rx.recv().await {
                    fanout.handle_event(event);
                }
            }
        });
        *fanout.event_loop.lock().unwrap() = Some(handle);

        fanout
    }

    /// Deliver a chunk of the capture stream to every attached sink.
    ///
    /// The whole chunk is always reported as consumed; individual sink
    /// failures are logged and never stall or kill the other sinks.
    pub fn write(&self, buf: &[u8]) {
        let mut failures = Vec::new();

        {
            let mut members = self.members.lock().unwrap();

            if members.header.len() < PCAP_HEADER_LEN {
                let missing = PCAP_HEADER_LEN - members.header.len();
                let take = missing.min(buf.len());
                members.header.extend_from_slice(&buf[..take]);
            }

            for sink in members.sinks.iter_mut() {
                if let Err(e) = sink.write(buf) {
                    failures.push(e);
                }
            }
        }

        for e in failures {
            tracing::warn!(error = %e, "sink write failed");
        }
    }

    /// Build a sink through `factory` and attach it.
    ///
    /// The captured header bytes are replayed to the newcomer before it
    /// joins the membership, so it observes the same stream prefix as every
    /// other sink.
    pub fn add_sink(&self, factory: &OutputerFactory) -> Result<(), SinkError> {
        let events_tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(SinkError::Closed)?;

        let replay_failure;
        {
            let mut members = self.members.lock().unwrap();

            let mut sink = factory(events_tx)?;

            replay_failure = if members.header.is_empty() {
                None
            } else {
                sink.write(&members.header).err()
            };

            self.outstanding.fetch_add(1, Ordering::SeqCst);
            members.sinks.push(sink);
        }

        if let Some(e) = replay_failure {
            tracing::warn!(error = %e, "can't replay stream header to new sink");
        }
        Ok(())
    }

    /// Detach the sink named by a death event. Unknown ids are ignored.
    fn handle_event(&self, event: OutputerEvent) {
        let OutputerEvent::Dead(id) = event;

        let mut members = self.members.lock().unwrap();
        let Some(pos) = members.sinks.iter().position(|s| s.id() == id) else {
            return;
        };
        members.sinks.remove(pos);
        drop(members);

        tracing::info!("viewer sink detached");
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Close every sink, drain the pending death events and stop the event
    /// loop.
    pub async fn close(&self) {
        {
            let mut members = self.members.lock().unwrap();
            for sink in members.sinks.iter_mut() {
                sink.close();
            }
        }

        // Every closed viewer exits and reports back; wait until the event
        // loop has seen them all. The waiter is registered before the
        // counter is re-checked so a concurrent notify can't be lost.
        loop {
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        self.events_tx.lock().unwrap().take();

        let handle = self.event_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Snapshot of the captured header, for tests and diagnostics.
    #[cfg(test)]
    fn header(&self) -> Vec<u8> {
        self.members.lock().unwrap().header.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputerEventSender, OutputerId};
    use std::io;
    use std::time::Duration;

    const HEADER: [u8; 24] = [
        0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xff, 0xff, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    ];

    /// Sink recording everything it sees, with shared handles for
    /// assertions after ownership moves into the fan-out.
    struct RecordingSink {
        id: OutputerId,
        data: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
        events: Option<OutputerEventSender>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
            let data = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(Mutex::new(false));
            let sink = Self {
                id: OutputerId::next(),
                data: data.clone(),
                closed: closed.clone(),
                events: None,
            };
            (sink, data, closed)
        }
    }

    impl Outputer for RecordingSink {
        fn id(&self) -> OutputerId {
            self.id
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
            // A real viewer exits once its input closes; emulate the
            // watcher announcing it.
            if let Some(events) = self.events.take() {
                let id = self.id;
                let _ = events.send(OutputerEvent::Dead(id));
            }
        }
    }

    fn recording_factory() -> (OutputerFactory, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
        let (sink, data, closed) = RecordingSink::new();
        let slot = Mutex::new(Some(sink));
        let factory: OutputerFactory = Arc::new(move |events: OutputerEventSender| {
            let mut sink = slot.lock().unwrap().take().expect("factory used once");
            sink.events = Some(events);
            Ok(Box::new(sink) as Box<dyn Outputer>)
        });
        (factory, data, closed)
    }

    #[tokio::test]
    async fn header_replayed_to_late_sink() {
        // Stream: 24-byte header, then 100 bytes of 0xAA; the viewer
        // attaches after byte 80.
        let (first, first_data, _) = RecordingSink::new();
        let fanout = FanOut::new(vec![Box::new(first)]);

        fanout.write(&HEADER);
        fanout.write(&[0xaa; 56]); // bytes 24..80

        let (factory, late_data, _) = recording_factory();
        fanout.add_sink(&factory).unwrap();

        fanout.write(&[0xaa; 44]); // bytes 80..124

        let late = late_data.lock().unwrap().clone();
        assert_eq!(&late[..24], &HEADER);
        assert_eq!(&late[24..], &[0xaa; 44]);

        let first = first_data.lock().unwrap().clone();
        assert_eq!(first.len(), 124);

        fanout.close().await;
    }

    #[tokio::test]
    async fn header_capture_spans_small_writes() {
        let fanout = FanOut::new(vec![]);

        fanout.write(&HEADER[..7]);
        fanout.write(&HEADER[7..20]);
        fanout.write(&HEADER[20..]);
        fanout.write(&[0x11; 8]);

        assert_eq!(fanout.header(), HEADER.to_vec());

        let (factory, late_data, _) = recording_factory();
        fanout.add_sink(&factory).unwrap();
        fanout.write(&[0x22; 4]);

        let late = late_data.lock().unwrap().clone();
        assert_eq!(&late[..24], &HEADER);
        assert_eq!(&late[24..], &[0x22; 4]);

        fanout.close().await;
    }

    #[tokio::test]
    async fn sink_attached_before_any_input_sees_the_header_once() {
        let fanout = FanOut::new(vec![]);

        let (factory, data, _) = recording_factory();
        fanout.add_sink(&factory).unwrap();

        fanout.write(&HEADER);
        fanout.write(&[0x33; 10]);

        let seen = data.lock().unwrap().clone();
        assert_eq!(&seen[..24], &HEADER);
        assert_eq!(seen.len(), 34);

        fanout.close().await;
    }

    #[tokio::test]
    async fn dead_event_detaches_only_that_sink() {
        let (resident, resident_data, _) = RecordingSink::new();
        let fanout = FanOut::new(vec![Box::new(resident)]);

        let (factory, viewer_data, _) = recording_factory();
        fanout.add_sink(&factory).unwrap();

        fanout.write(&HEADER);

        // Viewer dies mid-stream.
        {
            let members = fanout.members.lock().unwrap();
            let id = members.sinks[1].id();
            drop(members);
            let tx = fanout.events_tx.lock().unwrap().clone().unwrap();
            tx.send(OutputerEvent::Dead(id)).unwrap();
        }

        // Wait for the event loop to process the detach.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fanout.outstanding.load(Ordering::SeqCst) != 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fanout.write(&[0x44; 16]);

        // The file sink keeps receiving bytes; the dead viewer does not.
        assert_eq!(resident_data.lock().unwrap().len(), 40);
        assert_eq!(viewer_data.lock().unwrap().len(), 24);

        fanout.close().await;
    }

    #[tokio::test]
    async fn unknown_dead_event_is_ignored() {
        let (resident, _, _) = RecordingSink::new();
        let fanout = FanOut::new(vec![Box::new(resident)]);

        let tx = fanout.events_tx.lock().unwrap().clone().unwrap();
        tx.send(OutputerEvent::Dead(OutputerId::next())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fanout.members.lock().unwrap().sinks.len(), 1);
        fanout.close().await;
    }

    #[tokio::test]
    async fn close_with_zero_sinks_returns_promptly() {
        let fanout = FanOut::new(vec![]);

        tokio::time::timeout(Duration::from_secs(1), fanout.close())
            .await
            .expect("close must not wait on anything");
    }

    #[tokio::test]
    async fn close_closes_members_and_drains_viewers() {
        let (resident, _, resident_closed) = RecordingSink::new();
        let fanout = FanOut::new(vec![Box::new(resident)]);

        let (factory, _, viewer_closed) = recording_factory();
        fanout.add_sink(&factory).unwrap();

        fanout.close().await;

        assert!(*resident_closed.lock().unwrap());
        assert!(*viewer_closed.lock().unwrap());
        assert!(fanout.events_tx.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn add_sink_after_close_fails() {
        let fanout = FanOut::new(vec![]);
        fanout.close().await;

        let (factory, _, _) = recording_factory();
        assert!(matches!(fanout.add_sink(&factory), Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn factory_failure_surfaces_and_leaves_membership_intact() {
        let fanout = FanOut::new(vec![]);

        let failing: OutputerFactory = Arc::new(|_events| {
            Err(SinkError::Spawn {
                program: "viewer".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "missing"),
            })
        });

        assert!(fanout.add_sink(&failing).is_err());
        assert_eq!(fanout.members.lock().unwrap().sinks.len(), 0);
        assert_eq!(fanout.outstanding.load(Ordering::SeqCst), 0);

        fanout.close().await;
    }
}
