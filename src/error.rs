//! Error types for the capture controller.
//!
//! Construction failures bubble up synchronously as one of the enums below.
//! Runtime read/write failures are absorbed at the nearest boundary and
//! surface only as a log line or a lifecycle event.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading {path}: {source}. Run the init subcommand to generate a sample config or provide a path to an existing one with -c")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no targets defined in config")]
    NoTargets,

    #[error("target {0} is defined more than once")]
    DuplicateTarget(String),

    #[error("invalid filter_port for target <{name}>: expected a value between 1 and 65535")]
    InvalidFilterPort { name: String },

    #[error("{0} already exists. Will not overwrite existing config")]
    SampleExists(PathBuf),

    #[error("error writing sample configuration: {0}")]
    SampleWrite(#[source] io::Error),
}

/// Failure to bring a capture session up.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("can't open SSH session to {host}: {source}")]
    Session {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("remote command streams unavailable")]
    Streams,

    #[error("capturer has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Failure while tearing a capture session down.
///
/// A `StopError` never prevents the capturer from reaching its terminal
/// state; it only reports that the remote sniffer may have been left behind.
#[derive(Error, Debug)]
pub enum StopError {
    #[error("remote kill of pid {pid} failed: {reason}")]
    Kill { pid: i32, reason: String },

    #[error("remote pid unknown; can't signal the elevated sniffer")]
    PidUnknown,
}

/// Failure to construct or attach an output sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("can't spawn viewer process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("viewer stdin unavailable")]
    Stdin,

    #[error("can't create capture file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output fan-out is closed")]
    Closed,
}

/// Failure of a one-shot remote command.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("can't spawn ssh: {0}")]
    Spawn(#[source] io::Error),

    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote command failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// Registry bookkeeping failures.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("capturer [{0}] already exists")]
    Duplicate(String),
}
