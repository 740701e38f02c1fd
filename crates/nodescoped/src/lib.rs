//! nodescoped - diagnostics daemon for a node-graph host.
//!
//! Follows the host log, classifies tracebacks, keeps plugin file changes
//! and the latest workflow snapshot, and answers queries about all of it
//! through [`query::DiagnosticsService`].

pub mod changes;
pub mod coalescer;
pub mod config;
pub mod query;
pub mod state;
pub mod watcher;

pub use config::Config;
pub use query::{DiagnosticsService, ErrorReport, QueryError, ServiceStatus};
