//! Error Ledger - bounded in-memory history of classified errors.
//!
//! One writer (the log-watch loop), any number of readers. Readers copy out a
//! snapshot under a short read lock, so they never see a half-written entry and
//! never hold the writer up for longer than the copy.

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::record::{ClassifiedError, Diagnosis, ErrorRecord};

/// Default number of errors kept
pub const DEFAULT_LEDGER_CAPACITY: usize = 50;

#[derive(Debug)]
struct LedgerInner {
    entries: VecDeque<ClassifiedError>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct ErrorLedger {
    inner: RwLock<LedgerInner>,
    capacity: usize,
}

impl ErrorLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(LedgerInner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest entry when full. Returns the
    /// sequence number assigned to it.
    pub fn record(&self, record: ErrorRecord, diagnosis: Diagnosis) -> u64 {
        let mut inner = self.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        while inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(ClassifiedError {
            seq,
            record,
            diagnosis,
        });
        seq
    }

    /// Up to `count` most recent entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<ClassifiedError> {
        self.read().entries.iter().rev().take(count).cloned().collect()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<ClassifiedError> {
        self.read().entries.back().cloned()
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<ClassifiedError> {
        self.read().entries.iter().cloned().collect()
    }

    /// Remove every entry. Sequence numbers keep increasing.
    pub fn clear(&self) {
        self.write().entries.clear();
    }

    /// `recent(count)` and `clear()` as one step, so no entry recorded in
    /// between is lost.
    pub fn drain_recent(&self, count: usize) -> Vec<ClassifiedError> {
        let mut inner = self.write();
        let out = inner.entries.iter().rev().take(count).cloned().collect();
        inner.entries.clear();
        out
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ErrorLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn record(message: &str) -> ErrorRecord {
        ErrorRecord {
            timestamp: Utc::now(),
            kind: "ValueError".to_string(),
            message: message.to_string(),
            file: None,
            line: None,
            owning_node: None,
            node_class: None,
            frames: Vec::new(),
            chain: Vec::new(),
            raw: String::new(),
        }
    }

    #[test]
    fn test_ledger_new() {
        let ledger = ErrorLedger::default();
        assert!(ledger.is_empty());
        assert_eq!(ledger.capacity(), DEFAULT_LEDGER_CAPACITY);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let ledger = ErrorLedger::new(10);
        for i in 0..3 {
            ledger.record(record(&format!("e{}", i)), Diagnosis::unclassified());
        }
        let recent = ledger.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record.message, "e2");
        assert_eq!(recent[1].record.message, "e1");
        assert_eq!(ledger.last().unwrap().seq, 3);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let capacity = 5;
        let extra = 3;
        let ledger = ErrorLedger::new(capacity);
        for i in 0..capacity + extra {
            ledger.record(record(&format!("e{}", i)), Diagnosis::unclassified());
            assert!(ledger.len() <= capacity);
        }
        let recent = ledger.recent(capacity);
        assert_eq!(recent.len(), capacity);
        let messages: Vec<&str> = recent.iter().map(|e| e.record.message.as_str()).collect();
        assert_eq!(messages, vec!["e7", "e6", "e5", "e4", "e3"]);
        assert_eq!(ledger.snapshot()[0].record.message, "e3");
    }

    #[test]
    fn test_clear_and_drain() {
        let ledger = ErrorLedger::new(4);
        ledger.record(record("a"), Diagnosis::unclassified());
        ledger.record(record("b"), Diagnosis::unclassified());
        let drained = ledger.drain_recent(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].record.message, "b");
        assert!(ledger.is_empty());

        let seq = ledger.record(record("c"), Diagnosis::unclassified());
        assert_eq!(seq, 3);
        ledger.clear();
        assert!(ledger.recent(10).is_empty());
    }

    #[test]
    fn test_concurrent_readers() {
        let ledger = Arc::new(ErrorLedger::new(8));
        let writer = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for i in 0..200 {
                    ledger.record(record(&format!("e{}", i)), Diagnosis::unclassified());
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let recent = ledger.recent(8);
                        assert!(recent.len() <= 8);
                        assert!(recent.windows(2).all(|w| w[0].seq > w[1].seq));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(ledger.len(), 8);
        assert_eq!(ledger.last().unwrap().seq, 200);
    }
}
