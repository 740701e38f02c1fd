//! Daemon state management.
//!
//! Everything here is written by the background tasks and read by queries.
//! Each piece sits behind its own lock and readers only clone out of it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use nodescope_common::{ErrorLedger, NodeRegistry, RawLine, ReaderStatus, WorkflowGraph};
use serde::Serialize;

use crate::changes::FileChange;
use crate::config::Config;

/// What the log-watch loop last saw.
#[derive(Debug, Clone, Serialize)]
pub struct ReaderSnapshot {
    pub path: PathBuf,
    pub status: ReaderStatus,
    /// False until the first poll has run
    pub polled: bool,
    pub offset: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub rotations: u64,
    pub discarded_tracebacks: u64,
}

impl ReaderSnapshot {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            status: ReaderStatus::NotInitialized,
            polled: false,
            offset: 0,
            last_poll: None,
            rotations: 0,
            discarded_tracebacks: 0,
        }
    }
}

/// Latest graph pushed by the UI.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub graph: WorkflowGraph,
    pub received_at: DateTime<Utc>,
}

/// Fixed-size ring of recent items, oldest first.
#[derive(Debug)]
struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

/// Shared daemon state
pub struct DaemonState {
    pub ledger: ErrorLedger,
    tail: RwLock<Ring<RawLine>>,
    changes: RwLock<Ring<FileChange>>,
    workflow: RwLock<Option<WorkflowSnapshot>>,
    registry: RwLock<Arc<NodeRegistry>>,
    reader: RwLock<ReaderSnapshot>,
    pub started_at: Instant,
}

pub type SharedState = Arc<DaemonState>;

impl DaemonState {
    pub fn new(config: &Config) -> Self {
        Self {
            ledger: ErrorLedger::new(config.errors.ledger_capacity),
            tail: RwLock::new(Ring::new(config.log.tail_lines)),
            changes: RwLock::new(Ring::new(config.nodes.file_change_capacity)),
            workflow: RwLock::new(None),
            registry: RwLock::new(Arc::new(NodeRegistry::new())),
            reader: RwLock::new(ReaderSnapshot::new(config.log.path.clone().unwrap_or_default())),
            started_at: Instant::now(),
        }
    }

    pub fn push_lines(&self, lines: &[RawLine]) {
        let mut tail = write(&self.tail);
        for line in lines {
            tail.push(line.clone());
        }
    }

    /// Raw lines kept for log queries, oldest first.
    pub fn tail(&self) -> Vec<RawLine> {
        read(&self.tail).items.iter().cloned().collect()
    }

    pub fn tail_len(&self) -> usize {
        read(&self.tail).items.len()
    }

    pub fn record_change(&self, change: FileChange) {
        write(&self.changes).push(change);
    }

    /// Up to `count` most recent file changes, newest first.
    pub fn recent_changes(&self, count: usize) -> Vec<FileChange> {
        read(&self.changes).items.iter().rev().take(count).cloned().collect()
    }

    /// Changes under one plugin directory, newest first.
    pub fn changes_for(&self, owning_node: &str) -> Vec<FileChange> {
        read(&self.changes)
            .items
            .iter()
            .rev()
            .filter(|c| c.owning_node.as_deref() == Some(owning_node))
            .cloned()
            .collect()
    }

    pub fn set_workflow(&self, graph: WorkflowGraph) {
        *write(&self.workflow) = Some(WorkflowSnapshot {
            graph,
            received_at: Utc::now(),
        });
    }

    pub fn workflow(&self) -> Option<WorkflowSnapshot> {
        read(&self.workflow).clone()
    }

    pub fn set_registry(&self, registry: NodeRegistry) {
        *write(&self.registry) = Arc::new(registry);
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&read(&self.registry))
    }

    pub fn update_reader(&self, update: impl FnOnce(&mut ReaderSnapshot)) {
        update(&mut write(&self.reader));
    }

    pub fn reader(&self) -> ReaderSnapshot {
        read(&self.reader).clone()
    }
}

/// Create shared state
pub fn create_shared_state(config: &Config) -> SharedState {
    Arc::new(DaemonState::new(config))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeKind;

    fn config() -> Config {
        let mut config = Config::default();
        config.log.tail_lines = 3;
        config.nodes.file_change_capacity = 2;
        config
    }

    fn line(text: &str) -> RawLine {
        RawLine {
            text: text.to_string(),
            offset: 0,
        }
    }

    fn change(path: &str, node: Option<&str>) -> FileChange {
        FileChange {
            path: path.to_string(),
            kind: ChangeKind::Modified,
            timestamp: Utc::now(),
            owning_node: node.map(str::to_string),
        }
    }

    #[test]
    fn test_tail_is_bounded() {
        let state = DaemonState::new(&config());
        state.push_lines(&[line("a"), line("b"), line("c"), line("d")]);
        let texts: Vec<_> = state.tail().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_changes_newest_first_and_bounded() {
        let state = DaemonState::new(&config());
        state.record_change(change("a.py", Some("pack-a")));
        state.record_change(change("b.py", Some("pack-b")));
        state.record_change(change("c.py", Some("pack-a")));

        let recent = state.recent_changes(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "c.py");
        assert_eq!(state.changes_for("pack-a").len(), 1);
        assert!(state.changes_for("pack-z").is_empty());
    }

    #[test]
    fn test_workflow_snapshot() {
        let state = DaemonState::new(&config());
        assert!(state.workflow().is_none());
        state.set_workflow(WorkflowGraph::new());
        assert!(state.workflow().unwrap().graph.is_empty());
    }

    #[test]
    fn test_reader_update() {
        let state = DaemonState::new(&config());
        assert!(!state.reader().polled);
        state.update_reader(|r| {
            r.polled = true;
            r.status = ReaderStatus::Active;
        });
        assert_eq!(state.reader().status, ReaderStatus::Active);
    }
}
