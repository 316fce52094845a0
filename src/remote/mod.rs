//! Remote shell transport.
//!
//! The transport is the OpenSSH client binary driven as a child process:
//! one `ssh` invocation per remote command, with piped standard streams.
//! Killing the child tears the session (and a non-elevated remote command)
//! down; elevated commands additionally need a kill by pid over a separate
//! session, which [`SshSession::exec`] provides.

mod ssh;

pub use ssh::{SshEndpoint, SshSession};
