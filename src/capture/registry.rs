//! Process-wide container for active capturers.
//!
//! One registry per running controller, constructed at shell start and
//! injected into the command handlers. The map lock is only ever held for
//! bookkeeping; stopping a capturer (which blocks on network teardown)
//! happens outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::capture::{Capturer, CapturerEvent, CapturerEventSender};
use crate::error::RegistryError;
use crate::feedback::Feedback;
use crate::output::OutputerFactory;

/// Thread-safe map of target name to running capturer.
pub struct Registry {
    capturers: Mutex<HashMap<String, Arc<dyn Capturer>>>,
    events_tx: Mutex<Option<CapturerEventSender>>,
    /// Capturers added but not yet reaped by the event handler.
    outstanding: AtomicUsize,
    drained: Notify,
    handler: Mutex<Option<JoinHandle<()>>>,
    feedback: Feedback,
}

impl Registry {
    /// Create the registry and start its lifecycle event handler.
    pub fn new(feedback: Feedback) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            capturers: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            handler: Mutex::new(None),
            feedback,
        });

        let handle = tokio::spawn({
            let registry = registry.clone();
            async move {
                while let Some(event) = rx.recv().await {
                    registry.handle_event(event);
                }
                tracing::info!("all capturers are stopped; event handler exiting");
            }
        });
        *registry.handler.lock().unwrap() = Some(handle);

        registry
    }

    /// Sender capturers use to report their lifecycle events.
    pub fn event_sender(&self) -> CapturerEventSender {
        self.events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("registry is closed")
    }

    /// Register a started capturer. Fails on a duplicate name.
    pub fn add(&self, capturer: Arc<dyn Capturer>) -> Result<(), RegistryError> {
        let mut capturers = self.capturers.lock().unwrap();

        let name = capturer.name().to_string();
        if capturers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        capturers.insert(name, capturer);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// True when no capturer is registered.
    pub fn is_empty(&self) -> bool {
        self.capturers.lock().unwrap().is_empty()
    }

    /// Stop every registered capturer.
    pub async fn stop_all(&self) {
        tracing::info!("stopping every capturer");

        let capturers: Vec<Arc<dyn Capturer>> =
            self.capturers.lock().unwrap().values().cloned().collect();

        for capturer in capturers {
            if let Err(e) = capturer.stop().await {
                let msg = format!("Can't stop {}. {}", capturer.name(), e);
                tracing::error!("{msg}");
                self.feedback.emit(&msg);
            }
        }
    }

    /// Attach a new sink to the named capturers, or to all of them when
    /// `names` is empty.
    pub fn broadcast(&self, factory: &OutputerFactory, names: &[String]) {
        if names.is_empty() {
            let capturers: Vec<Arc<dyn Capturer>> =
                self.capturers.lock().unwrap().values().cloned().collect();

            if capturers.is_empty() {
                tracing::error!("viewer requested without arguments, but no capturers are running");
                self.feedback
                    .emit("There are no running capturers. Use start first.");
                return;
            }

            for capturer in capturers {
                if let Err(e) = capturer.add_outputer(factory) {
                    tracing::error!(name = capturer.name(), error = %e, "error adding outputer");
                }
            }
            return;
        }

        for name in names {
            let capturer = self.capturers.lock().unwrap().get(name).cloned();
            match capturer {
                Some(capturer) => {
                    if let Err(e) = capturer.add_outputer(factory) {
                        tracing::error!(name = capturer.name(), error = %e, "error adding outputer");
                    }
                }
                None => {
                    let msg = format!("Target <{name}> doesn't exist.");
                    tracing::error!("{msg}");
                    self.feedback.emit(&msg);
                }
            }
        }
    }

    /// Remove the capturer a lifecycle event names. A second event for the
    /// same name is a no-op.
    fn handle_event(&self, event: CapturerEvent) {
        tracing::info!(name = %event.name, kind = ?event.kind, "capturer lifecycle event");

        let removed = self.capturers.lock().unwrap().remove(&event.name);
        if removed.is_some() {
            if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.drained.notify_waiters();
            }
        }
    }

    /// Stop everything, wait for all lifecycle events, shut the handler
    /// down.
    pub async fn close(&self) {
        tracing::info!("terminating registry");

        self.stop_all().await;

        loop {
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        self.events_tx.lock().unwrap().take();

        let handle = self.handler.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        tracing::info!("registry terminated");
    }
}
