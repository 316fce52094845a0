//! Rotating pcap file sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::SinkError;
use crate::output::{Outputer, OutputerId, PCAP_HEADER_LEN};

/// Bytes written to one file before rotating to the next.
///
/// The value is a process-wide choice; tests shrink it through
/// [`FileOutput::with_rotate_threshold`].
const ROTATE_THRESHOLD: u64 = 10 * 1024 * 1024;

const PCAP_EXT: &str = ".pcap";

/// Splits a capture stream into rotated `<pattern><index>.pcap` files.
///
/// The first up-to-24 bytes ever written are recorded as the stream header
/// and prepended to every file after the first, so each rotated file is a
/// well-formed capture file on its own. Retention keeps the newest
/// `rotation_count + 1` files; older ones are unlinked as rotation
/// advances.
pub struct FileOutput {
    id: OutputerId,
    dir: PathBuf,
    pattern: String,
    rotation_count: u32,
    threshold: u64,
    index: u64,
    file: Option<BufWriter<File>>,
    written: u64,
    header: Vec<u8>,
}

impl FileOutput {
    /// Create the sink and open the first capture file (`<pattern>0.pcap`).
    pub fn new(dir: &Path, pattern: &str, rotation_count: u32) -> Result<Self, SinkError> {
        let mut sink = Self {
            id: OutputerId::next(),
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
            rotation_count,
            threshold: ROTATE_THRESHOLD,
            index: 0,
            file: None,
            written: 0,
            header: Vec::with_capacity(PCAP_HEADER_LEN),
        };

        let path = sink.file_path(0);
        let file = File::create(&path).map_err(|source| SinkError::File { path, source })?;
        sink.file = Some(BufWriter::new(file));

        Ok(sink)
    }

    /// Override the rotation threshold. Intended for tests.
    pub fn with_rotate_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    fn file_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", self.pattern, index, PCAP_EXT))
    }

    /// Close the current file, open the next index and replay the header.
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        self.index += 1;
        let file = File::create(self.file_path(self.index))?;
        let mut file = BufWriter::new(file);
        file.write_all(&self.header)?;
        self.written = self.header.len() as u64;
        self.file = Some(file);

        self.prune();
        Ok(())
    }

    /// Unlink the file that just fell out of the retention window.
    ///
    /// Each rotation creates exactly one file, so removing one stale index
    /// per rotation keeps the window at `rotation_count + 1`.
    fn prune(&self) {
        let keep = u64::from(self.rotation_count) + 1;
        if self.index + 1 > keep {
            let stale = self.file_path(self.index - keep);
            if let Err(e) = std::fs::remove_file(&stale) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %stale.display(), error = %e, "can't unlink rotated capture file");
                }
            }
        }
    }
}

impl Outputer for FileOutput {
    fn id(&self) -> OutputerId {
        self.id
    }

    fn write(&mut self, mut buf: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            // Closed; the stream is draining.
            return Ok(());
        }

        if self.header.len() < PCAP_HEADER_LEN {
            let missing = PCAP_HEADER_LEN - self.header.len();
            let take = missing.min(buf.len());
            self.header.extend_from_slice(&buf[..take]);
        }

        while !buf.is_empty() {
            if self.written >= self.threshold {
                self.rotate()?;
            }

            // max(1) guarantees progress if the threshold is smaller than
            // the replayed header.
            let room = self.threshold.saturating_sub(self.written).max(1) as usize;
            let take = room.min(buf.len());

            if let Some(file) = self.file.as_mut() {
                file.write_all(&buf[..take])?;
            }
            self.written += take as u64;
            buf = &buf[take..];
        }

        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(error = %e, "can't flush capture file on close");
            }
        }
    }
}
