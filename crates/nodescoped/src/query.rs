//! Query surface - what agents and the UI ask the daemon.
//!
//! Every query answers from snapshots of the shared state. The log watcher
//! starts on first use, so a query made before startup finished still sees
//! the log as of that moment.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use nodescope_common::{
    check_workflow_health, ClassifiedError, ErrorClassifier, HealthReport, NodeRegistry,
    NodescopeError, PatternCatalog, ReaderStatus, WorkflowGraph, VERSION,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::changes::FileChange;
use crate::coalescer::SyncCoalescer;
use crate::config::Config;
use crate::state::{create_shared_state, ReaderSnapshot, SharedState};
use crate::watcher::{LogWatcher, WatcherHandle};

/// File changes attached to one error report
const MAX_RELATED_CHANGES: usize = 10;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Log file not initialized: {0}")]
    NotInitialized(String),

    #[error("No workflow received yet")]
    NoWorkflow,

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid node registry: {0}")]
    InvalidRegistry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Stable condition tag reported alongside the message.
    pub fn condition(&self) -> &'static str {
        match self {
            QueryError::NotInitialized(_) => "not_initialized",
            QueryError::NoWorkflow => "no_workflow",
            QueryError::InvalidWorkflow(_) => "invalid_workflow",
            QueryError::InvalidRegistry(_) => "invalid_registry",
            QueryError::Internal(_) => "internal",
        }
    }
}

impl From<NodescopeError> for QueryError {
    fn from(e: NodescopeError) -> Self {
        match e {
            NodescopeError::InvalidWorkflow(msg) => QueryError::InvalidWorkflow(msg),
            NodescopeError::InvalidRegistry(msg) => QueryError::InvalidRegistry(msg),
            other => QueryError::Internal(format!("{} [{}]", other, other.condition())),
        }
    }
}

/// A classified error plus the edits made to the node it is blamed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(flatten)]
    pub error: ClassifiedError,
    pub summary: String,
    pub related_changes: Vec<FileChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: String,
    pub uptime_seconds: u64,
    pub watching: bool,
    pub reader: ReaderSnapshot,
    pub ledger_len: usize,
    pub ledger_capacity: usize,
    pub pattern_count: usize,
    pub registry_types: usize,
    pub has_workflow: bool,
    pub tail_lines: usize,
}

/// Log search: a case-insensitive regex, or a plain substring when the
/// pattern does not compile.
enum LineFilter {
    Regex(Regex),
    Substring(String),
}

impl LineFilter {
    fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => LineFilter::Regex(re),
            Err(e) => {
                debug!("Search pattern is not a regex ({}), matching as text", e);
                LineFilter::Substring(pattern.to_lowercase())
            }
        }
    }

    fn matches(&self, line: &str) -> bool {
        match self {
            LineFilter::Regex(re) => re.is_match(line),
            LineFilter::Substring(needle) => line.to_lowercase().contains(needle),
        }
    }
}

pub struct DiagnosticsService {
    config: Config,
    state: SharedState,
    classifier: Arc<ErrorClassifier>,
    watcher: Mutex<Option<WatcherHandle>>,
    coalescer: Mutex<Option<SyncCoalescer<WorkflowGraph>>>,
}

impl DiagnosticsService {
    /// Build the service. Fails only on configuration the daemon cannot run with.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let mut catalog = PatternCatalog::builtin();
        if let Some(dir) = &config.errors.patterns_dir {
            let loaded = catalog.extend_from_dir(dir);
            info!("Loaded {} custom patterns from {}", loaded, dir.display());
        }

        let state = create_shared_state(&config);
        if let Some(path) = &config.nodes.registry_path {
            match NodeRegistry::load(path) {
                Ok(registry) => {
                    info!("Loaded {} node types from {}", registry.len(), path.display());
                    state.set_registry(registry);
                }
                Err(e) => warn!("Node registry unavailable ({}): {}", path.display(), e),
            }
        }

        Ok(Self {
            config,
            state,
            classifier: Arc::new(ErrorClassifier::new(catalog)),
            watcher: Mutex::new(None),
            coalescer: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the log watcher unless it is already running. The first poll
    /// happens before this returns.
    pub fn ensure_watching(&self) -> Result<(), QueryError> {
        let mut slot = lock(&self.watcher);
        if slot.as_ref().is_some_and(WatcherHandle::is_running) {
            return Ok(());
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| QueryError::Internal(format!("no async runtime: {}", e)))?;

        let mut watcher = LogWatcher::new(&self.config, Arc::clone(&self.state), Arc::clone(&self.classifier));
        watcher.tick();
        *slot = Some(watcher.spawn());
        Ok(())
    }

    /// Stop background tasks. A workflow still inside its quiet period is dropped.
    pub async fn shutdown(&self) {
        let watcher = lock(&self.watcher).take();
        if let Some(handle) = watcher {
            handle.stop().await;
        }
        let coalescer = lock(&self.coalescer).take();
        if let Some(coalescer) = coalescer {
            coalescer.shutdown().await;
        }
    }

    fn touch(&self) {
        if let Err(e) = self.ensure_watching() {
            debug!("Log watcher not started: {}", e);
        }
    }

    fn not_initialized(&self) -> Option<QueryError> {
        let reader = self.state.reader();
        (reader.status != ReaderStatus::Active)
            .then(|| QueryError::NotInitialized(reader.path.display().to_string()))
    }

    /// Up to `count` most recent errors, newest first. `clear` empties the
    /// ledger in the same step.
    pub fn get_errors(&self, count: usize, clear: bool) -> Result<Vec<ErrorReport>, QueryError> {
        self.touch();
        let entries = if clear {
            self.state.ledger.drain_recent(count)
        } else {
            self.state.ledger.recent(count)
        };
        if entries.is_empty() {
            if let Some(e) = self.not_initialized() {
                return Err(e);
            }
        }
        Ok(entries.into_iter().map(|e| self.report(e)).collect())
    }

    fn report(&self, error: ClassifiedError) -> ErrorReport {
        let related_changes = error
            .record
            .owning_node
            .as_deref()
            .map(|node| {
                let mut changes = self.state.changes_for(node);
                changes.truncate(MAX_RELATED_CHANGES);
                changes
            })
            .unwrap_or_default();
        ErrorReport {
            summary: error.record.summary(),
            error,
            related_changes,
        }
    }

    /// The last `count` log lines matching `search`, oldest first.
    pub fn get_logs(&self, count: usize, search: Option<&str>) -> Result<Vec<String>, QueryError> {
        self.touch();
        let tail = self.state.tail();
        if tail.is_empty() {
            if let Some(e) = self.not_initialized() {
                return Err(e);
            }
        }

        let filter = search.filter(|s| !s.is_empty()).map(LineFilter::new);
        let mut lines: Vec<String> = tail
            .into_iter()
            .rev()
            .map(|l| l.text)
            .filter(|text| filter.as_ref().map_or(true, |f| f.matches(text)))
            .take(count)
            .collect();
        lines.reverse();
        Ok(lines)
    }

    pub fn get_workflow(&self) -> Result<WorkflowGraph, QueryError> {
        self.state
            .workflow()
            .map(|snapshot| snapshot.graph)
            .ok_or(QueryError::NoWorkflow)
    }

    /// Replace the workflow snapshot now. Returns the node count.
    pub fn set_workflow(&self, payload: &Value) -> Result<usize, QueryError> {
        let graph = WorkflowGraph::from_json(payload)?;
        let nodes = graph.len();
        self.state.set_workflow(graph);
        info!("Workflow updated ({} nodes)", nodes);
        Ok(nodes)
    }

    /// Queue a workflow snapshot; bursts of edits settle into one update.
    pub fn workflow_changed(&self, payload: &Value) -> Result<(), QueryError> {
        let graph = WorkflowGraph::from_json(payload)?;

        let mut slot = lock(&self.coalescer);
        if slot.is_none() {
            tokio::runtime::Handle::try_current()
                .map_err(|e| QueryError::Internal(format!("no async runtime: {}", e)))?;
            let state = Arc::clone(&self.state);
            *slot = Some(SyncCoalescer::spawn(self.config.quiet_period(), move |graph: WorkflowGraph| {
                info!("Workflow synced ({} nodes)", graph.len());
                state.set_workflow(graph);
            }));
        }

        if slot.as_ref().is_some_and(|coalescer| coalescer.notify(graph)) {
            Ok(())
        } else {
            *slot = None;
            Err(QueryError::Internal("workflow sync stopped".to_string()))
        }
    }

    /// Check `graph`, or the current snapshot when none is given.
    pub fn check_workflow_health(&self, graph: Option<&WorkflowGraph>) -> Result<HealthReport, QueryError> {
        let registry = self.state.registry();
        match graph {
            Some(graph) => Ok(check_workflow_health(graph, &registry)),
            None => {
                let snapshot = self.state.workflow().ok_or(QueryError::NoWorkflow)?;
                Ok(check_workflow_health(&snapshot.graph, &registry))
            }
        }
    }

    /// Up to `count` most recent plugin file changes, newest first.
    pub fn get_file_changes(&self, count: usize) -> Vec<FileChange> {
        self.state.recent_changes(count)
    }

    /// Replace the node registry from a node-info document. Returns the type count.
    pub fn set_registry(&self, object_info: &Value) -> Result<usize, QueryError> {
        let registry = NodeRegistry::from_object_info(object_info)?;
        let types = registry.len();
        self.state.set_registry(registry);
        info!("Node registry updated ({} types)", types);
        Ok(types)
    }

    pub fn status(&self) -> ServiceStatus {
        let watching = lock(&self.watcher).as_ref().is_some_and(WatcherHandle::is_running);
        ServiceStatus {
            version: VERSION.to_string(),
            uptime_seconds: self.state.started_at.elapsed().as_secs(),
            watching,
            reader: self.state.reader(),
            ledger_len: self.state.ledger.len(),
            ledger_capacity: self.state.ledger.capacity(),
            pattern_count: self.classifier.catalog().len(),
            registry_types: self.state.registry().len(),
            has_workflow: self.state.workflow().is_some(),
            tail_lines: self.state.tail_len(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn service() -> DiagnosticsService {
        let mut config = Config::default();
        config.log.path = Some(PathBuf::from("/nonexistent/comfyui.log"));
        DiagnosticsService::new(config).unwrap()
    }

    #[test]
    fn test_new_requires_log_path() {
        assert!(DiagnosticsService::new(Config::default()).is_err());
    }

    #[test]
    fn test_condition_codes() {
        assert_eq!(QueryError::NoWorkflow.condition(), "no_workflow");
        assert_eq!(
            QueryError::from(NodescopeError::InvalidWorkflow("x".into())).condition(),
            "invalid_workflow"
        );
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = QueryError::from(NodescopeError::from(json));
        assert_eq!(err.condition(), "internal");
        assert!(err.to_string().ends_with("[json]"), "{}", err);
    }

    #[test]
    fn test_line_filter() {
        let re = LineFilter::new("cuda.*memory");
        assert!(re.matches("CUDA out of memory"));
        assert!(!re.matches("loading model"));

        let text = LineFilter::new("[unclosed");
        assert!(matches!(text, LineFilter::Substring(_)));
        assert!(text.matches("value was [UNCLOSED here"));
    }

    #[test]
    fn test_errors_before_log_exists() {
        let svc = service();
        let err = svc.get_errors(5, false).unwrap_err();
        assert_eq!(err.condition(), "not_initialized");
        assert_eq!(svc.get_logs(5, None).unwrap_err().condition(), "not_initialized");
    }

    #[test]
    fn test_workflow_round_trip() {
        let svc = service();
        assert!(matches!(svc.get_workflow(), Err(QueryError::NoWorkflow)));
        assert!(matches!(svc.check_workflow_health(None), Err(QueryError::NoWorkflow)));

        let payload = json!({"prompt": {
            "1": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
            "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}}
        }});
        assert_eq!(svc.set_workflow(&payload).unwrap(), 2);
        assert_eq!(svc.get_workflow().unwrap().len(), 2);
        assert!(svc.status().has_workflow);

        let err = svc.set_workflow(&json!([1, 2])).unwrap_err();
        assert_eq!(err.condition(), "invalid_workflow");
    }

    #[test]
    fn test_health_uses_registry() {
        let svc = service();
        let info = json!({
            "SaveImage": {"input": {"required": {"images": [["IMAGE"]]}}, "output_node": true}
        });
        assert_eq!(svc.set_registry(&info).unwrap(), 1);

        let graph = WorkflowGraph::from_json(&json!({
            "1": {"class_type": "NotARealNode", "inputs": {}},
            "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}}
        }))
        .unwrap();
        let report = svc.check_workflow_health(Some(&graph)).unwrap();
        assert!(!report.healthy);
        assert!(report.render().contains("NotARealNode"));
    }

    #[test]
    fn test_status_counts_patterns() {
        let svc = service();
        let status = svc.status();
        assert!(!status.watching);
        assert_eq!(status.pattern_count, PatternCatalog::builtin().len());
        assert_eq!(status.ledger_len, 0);
    }
}
