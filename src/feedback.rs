//! User-visible feedback channel.
//!
//! The core never prints to the terminal directly. The hosting shell hands
//! it a [`Feedback`] callback at construction time and every user-facing
//! one-liner goes through it. Structured records go to `tracing` instead.
//! Neither is ever invoked while a lock is held.

use std::sync::Arc;

/// Callback used by the core to surface one-line messages to the user.
#[derive(Clone)]
pub struct Feedback(Arc<dyn Fn(&str) + Send + Sync>);

impl Feedback {
    /// Wrap an arbitrary callback.
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Feedback that prints each message as a line on stdout.
    pub fn stdout() -> Self {
        Self::new(|msg| println!("{msg}"))
    }

    /// Emit a message to the user.
    pub fn emit(&self, msg: &str) {
        (self.0)(msg);
    }
}

impl std::fmt::Debug for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Feedback")
    }
}
