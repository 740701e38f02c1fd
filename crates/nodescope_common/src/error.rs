//! Error types for the diagnostics core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodescopeError {
    #[error("Invalid pattern '{id}': {reason}")]
    InvalidPattern { id: String, reason: String },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid node registry: {0}")]
    InvalidRegistry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl NodescopeError {
    /// Stable condition tag for callers that report failures as data.
    pub fn condition(&self) -> &'static str {
        match self {
            NodescopeError::InvalidPattern { .. } => "invalid_pattern",
            NodescopeError::InvalidWorkflow(_) => "invalid_workflow",
            NodescopeError::InvalidRegistry(_) => "invalid_registry",
            NodescopeError::Io(_) => "io",
            NodescopeError::Json(_) => "json",
            NodescopeError::Regex(_) => "regex",
        }
    }
}

pub type Result<T> = std::result::Result<T, NodescopeError>;
