//! Log Stream Reader
//!
//! Follows a log file written by another process. Each poll reads at most
//! `max_read_bytes` past the remembered offset and hands back the complete
//! lines found there. A trailing line without its newline stays unread until
//! the writer finishes it.
//!
//! Rotation (the path now names a different file) and truncation (the file
//! shrank below the offset) both reset the offset to zero.

use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default read bound per poll
pub const DEFAULT_MAX_READ_BYTES: usize = 256 * 1024;

/// One line of log text and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLine {
    pub text: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    /// The log file does not exist or cannot be opened yet
    NotInitialized,
    Active,
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub status: ReaderStatus,
    pub lines: Vec<RawLine>,
    pub rotated: bool,
    pub truncated: bool,
    /// More data is already on disk beyond this poll's read bound
    pub more_pending: bool,
}

impl PollOutcome {
    fn idle(status: ReaderStatus) -> Self {
        Self {
            status,
            lines: Vec::new(),
            rotated: false,
            truncated: false,
            more_pending: false,
        }
    }
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
impl FileIdentity {
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    created: std::time::SystemTime,
}

#[cfg(not(unix))]
impl FileIdentity {
    fn of(meta: &Metadata) -> Option<Self> {
        meta.created().ok().map(|created| Self { created })
    }
}

#[derive(Debug)]
pub struct LogStreamReader {
    path: PathBuf,
    offset: u64,
    identity: Option<FileIdentity>,
    max_read_bytes: usize,
    status: ReaderStatus,
    /// The file went away after being read; whatever appears next is new
    vanished: bool,
}

impl LogStreamReader {
    pub fn new(path: impl Into<PathBuf>, max_read_bytes: usize) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            identity: None,
            max_read_bytes: max_read_bytes.max(1),
            status: ReaderStatus::NotInitialized,
            vanished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn status(&self) -> ReaderStatus {
        self.status
    }

    /// Read whatever complete lines were appended since the last poll.
    pub fn poll(&mut self) -> PollOutcome {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => return self.not_initialized(&e),
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => return self.not_initialized(&e),
        };

        if self.status == ReaderStatus::NotInitialized {
            info!("Following log file {}", self.path.display());
            self.status = ReaderStatus::Active;
        }

        let mut outcome = PollOutcome::idle(ReaderStatus::Active);

        if self.vanished {
            info!("Log file {} reappeared, reading from the beginning", self.path.display());
            self.vanished = false;
            outcome.rotated = true;
        }

        let identity = FileIdentity::of(&meta);
        if self.identity.is_some() && identity.is_some() && self.identity != identity {
            info!("Log file {} rotated, restarting from the beginning", self.path.display());
            self.offset = 0;
            outcome.rotated = true;
        }
        self.identity = identity;

        let len = meta.len();
        if len < self.offset {
            info!(
                "Log file {} truncated ({} < {}), restarting from the beginning",
                self.path.display(),
                len,
                self.offset
            );
            self.offset = 0;
            outcome.truncated = true;
        }
        if len == self.offset {
            return outcome;
        }

        let available = len - self.offset;
        let to_read = available.min(self.max_read_bytes as u64);
        let mut buf = Vec::with_capacity(to_read as usize);
        let read = file
            .seek(SeekFrom::Start(self.offset))
            .and_then(|_| (&mut file).take(to_read).read_to_end(&mut buf));
        if let Err(e) = read {
            warn!("Failed to read {}: {}", self.path.display(), e);
            return outcome;
        }

        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            // A line longer than the read bound is handed out in pieces
            None if buf.len() >= self.max_read_bytes => buf.len(),
            None => 0,
        };

        let mut start = 0;
        while start < consumed {
            let end = buf[start..consumed]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| start + p)
                .unwrap_or(consumed);
            let mut text = &buf[start..end];
            if text.last() == Some(&b'\r') {
                text = &text[..text.len() - 1];
            }
            outcome.lines.push(RawLine {
                text: String::from_utf8_lossy(text).into_owned(),
                offset: self.offset + start as u64,
            });
            start = end + 1;
        }

        self.offset += consumed as u64;
        outcome.more_pending = to_read < available && consumed > 0;
        debug!(
            lines = outcome.lines.len(),
            offset = self.offset,
            more_pending = outcome.more_pending,
            "log poll"
        );
        outcome
    }

    fn not_initialized(&mut self, err: &std::io::Error) -> PollOutcome {
        if self.status == ReaderStatus::Active {
            warn!("Log file {} unavailable: {}", self.path.display(), err);
        }
        // The inode may be reused by a recreated file, so identity alone
        // cannot tell the next file apart from this one
        if self.identity.is_some() || self.offset > 0 {
            self.vanished = true;
        }
        self.offset = 0;
        self.identity = None;
        self.status = ReaderStatus::NotInitialized;
        PollOutcome::idle(ReaderStatus::NotInitialized)
    }
}
