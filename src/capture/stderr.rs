//! Remote pid announcement scanner.
//!
//! The remote command line prints a single `REMCAP_PID:<pid>` line on
//! stderr before the sniffer takes over the stream. This sink consumes the
//! stderr bytes, extracts that pid and swallows everything else.

use std::sync::Mutex;

/// Marker prefix of the pid announcement line.
pub const PID_MARKER: &str = "REMCAP_PID:";

/// Pid not announced yet.
const PID_UNSEEN: i32 = 0;
/// The announcement line was malformed; no pid will ever be known.
const PID_MALFORMED: i32 = -1;

struct SnifferState {
    pid: i32,
    /// Bytes of the current, not yet terminated line.
    line: Vec<u8>,
}

/// Extracts the remote sniffer's pid from its stderr stream.
///
/// The first complete line decides the value: a well-formed marker line
/// sets the pid, anything else pins it to -1. Later lines are consumed and
/// ignored, so a chatty remote command can never block on a full stderr
/// pipe. The value never leaves a non-zero state again.
pub struct PidSniffer {
    state: Mutex<SnifferState>,
}

impl PidSniffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SnifferState {
                pid: PID_UNSEEN,
                line: Vec::new(),
            }),
        }
    }

    /// Consume a chunk of stderr. Chunk boundaries are arbitrary; lines
    /// are reassembled internally.
    pub fn write(&self, buf: &[u8]) {
        let mut state = self.state.lock().unwrap();

        for &byte in buf {
            if byte != b'\n' {
                state.line.push(byte);
                continue;
            }

            let line = std::mem::take(&mut state.line);
            if state.pid != PID_UNSEEN {
                continue;
            }
            state.pid = parse_marker_line(&line);
        }
    }

    /// Current pid value: 0 while unseen, -1 after a malformed first line,
    /// the announced pid otherwise.
    pub fn pid(&self) -> i32 {
        self.state.lock().unwrap().pid
    }
}

impl Default for PidSniffer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_marker_line(line: &[u8]) -> i32 {
    let Ok(text) = std::str::from_utf8(line) else {
        return PID_MALFORMED;
    };

    let Some(value) = text.strip_prefix(PID_MARKER) else {
        return PID_MALFORMED;
    };

    match value.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => pid,
        _ => PID_MALFORMED,
    }
}
