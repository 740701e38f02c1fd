//! Nodescope common library - the diagnostics core.
//!
//! Log lines flow through [`LogStreamReader`] → [`TracebackAssembler`] →
//! [`ErrorClassifier`] → [`ErrorLedger`]. Graph snapshots are checked by
//! [`health::check_workflow_health`]. Nothing in this crate spawns tasks; the
//! daemon owns scheduling.

pub mod classifier;
pub mod error;
pub mod health;
pub mod ledger;
pub mod log_reader;
pub mod patterns;
pub mod record;
pub mod registry;
pub mod traceback;
pub mod workflow;

pub use classifier::ErrorClassifier;
pub use error::{NodescopeError, Result};
pub use health::{check_workflow_health, HealthIssue, HealthReport, IssueKind, Severity};
pub use ledger::{ErrorLedger, DEFAULT_LEDGER_CAPACITY};
pub use log_reader::{LogStreamReader, PollOutcome, RawLine, ReaderStatus, DEFAULT_MAX_READ_BYTES};
pub use patterns::{Pattern, PatternCatalog};
pub use record::{Category, ClassifiedError, Confidence, Diagnosis, ErrorRecord, StackFrame};
pub use registry::{NodeRegistry, NodeTypeInfo};
pub use traceback::{PluginRoot, TracebackAssembler, DEFAULT_MAX_TRACEBACK_LINES};
pub use workflow::{InputValue, LinkRef, NodeId, NodeSpec, WorkflowGraph};

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
