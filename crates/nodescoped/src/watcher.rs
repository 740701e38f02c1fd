//! Log Watcher - follows the host log and fills the error ledger
//!
//! One task owns the reader and the traceback assembler. Every tick it reads
//! what was appended, keeps the raw lines for log queries, and records each
//! completed traceback with its diagnosis.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nodescope_common::{
    ErrorClassifier, ErrorRecord, LogStreamReader, PluginRoot, ReaderStatus, TracebackAssembler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::state::SharedState;

/// Bound on back-to-back polls while a backlog drains, so one tick never
/// monopolises the runtime.
const MAX_POLLS_PER_TICK: usize = 64;

/// What one poll produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub lines: usize,
    pub errors: usize,
    pub more_pending: bool,
}

pub struct LogWatcher {
    reader: LogStreamReader,
    assembler: TracebackAssembler,
    classifier: Arc<ErrorClassifier>,
    state: SharedState,
    poll_interval: Duration,
}

impl LogWatcher {
    pub fn new(config: &Config, state: SharedState, classifier: Arc<ErrorClassifier>) -> Self {
        let path = config.log.path.clone().unwrap_or_default();
        let plugins = PluginRoot::new(config.nodes.plugin_root.as_deref());
        Self {
            reader: LogStreamReader::new(path, config.log.max_read_bytes),
            assembler: TracebackAssembler::new(plugins, config.log.max_traceback_lines),
            classifier,
            state,
            poll_interval: config.poll_interval(),
        }
    }

    /// Poll once and process everything read.
    pub fn tick(&mut self) -> TickSummary {
        let outcome = self.reader.poll();
        let mut summary = TickSummary {
            lines: outcome.lines.len(),
            errors: 0,
            more_pending: outcome.more_pending,
        };

        if outcome.rotated || outcome.truncated {
            if let Some(record) = self.assembler.reset() {
                self.record(record);
                summary.errors += 1;
            }
        }

        self.state.push_lines(&outcome.lines);
        for line in &outcome.lines {
            if let Some(record) = self.assembler.feed(&line.text) {
                self.record(record);
                summary.errors += 1;
            }
        }

        // A traceback never spans an idle gap in practice; emit what is held
        if !outcome.more_pending && outcome.status == ReaderStatus::Active {
            if let Some(record) = self.assembler.flush() {
                self.record(record);
                summary.errors += 1;
            }
        }

        let offset = self.reader.offset();
        let discarded = self.assembler.discarded();
        self.state.update_reader(|r| {
            r.status = outcome.status;
            r.polled = true;
            r.offset = offset;
            r.last_poll = Some(Utc::now());
            r.discarded_tracebacks = discarded;
            if outcome.rotated {
                r.rotations += 1;
            }
        });

        summary
    }

    fn record(&self, record: ErrorRecord) {
        let diagnosis = self.classifier.classify(&record);
        if diagnosis.is_classified() {
            info!(
                category = diagnosis.category.as_str(),
                node = record.owning_node.as_deref().unwrap_or("-"),
                "{}: {}",
                record.short_kind(),
                diagnosis.title
            );
        } else {
            warn!(
                node = record.owning_node.as_deref().unwrap_or("-"),
                "Unclassified error: {}",
                record.summary()
            );
        }
        self.state.ledger.record(record, diagnosis);
    }

    /// Start the polling loop (spawns a background task)
    pub fn spawn(mut self) -> WatcherHandle {
        let (shutdown, mut stop) = watch::channel(false);
        info!(
            "Starting log watcher on {} (every {:?})",
            self.reader.path().display(),
            self.poll_interval
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for _ in 0..MAX_POLLS_PER_TICK {
                            let summary = self.tick();
                            if summary.lines > 0 {
                                debug!("Read {} lines, {} errors", summary.lines, summary.errors);
                            }
                            if !summary.more_pending {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Log watcher stopped");
        });

        WatcherHandle { shutdown, task }
    }
}

/// Running log watcher.
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Log watcher task failed: {}", e);
        }
    }
}
