//! Error records produced by the traceback assembler and the classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One call frame of a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// An earlier exception in a chained traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedCause {
    pub kind: String,
    pub message: String,
}

/// A completed traceback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Exception kind as printed, e.g. `torch.cuda.OutOfMemoryError`
    pub kind: String,
    pub message: String,
    /// File of the innermost frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Line of the innermost frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Plugin directory owning the innermost plugin frame
    pub owning_node: Option<String>,
    /// Node class named by the host right before the traceback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_class: Option<String>,
    /// Outermost first
    pub frames: Vec<StackFrame>,
    /// Earlier tracebacks of the same chain, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<ChainedCause>,
    pub raw: String,
}

impl ErrorRecord {
    /// Last segment of the exception kind (`OutOfMemoryError` for
    /// `torch.cuda.OutOfMemoryError`).
    pub fn short_kind(&self) -> &str {
        short_kind(&self.kind)
    }

    /// One-paragraph summary for agents and logs.
    pub fn summary(&self) -> String {
        let mut out = if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        };
        if let Some(file) = &self.file {
            out.push_str(&format!("\nLocation: {} line {}", file, self.line.unwrap_or(0)));
        }
        if let Some(class) = &self.node_class {
            out.push_str(&format!("\nNode class: {}", class));
        }
        if let Some(owner) = &self.owning_node {
            out.push_str(&format!("\nCustom node: {}", owner));
        }
        for cause in &self.chain {
            out.push_str(&format!("\nWhile handling: {}: {}", cause.kind, cause.message));
        }
        out
    }
}

pub(crate) fn short_kind(kind: &str) -> &str {
    kind.rsplit('.').next().unwrap_or(kind)
}

/// Failure class a diagnosis belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// GPU/CPU memory exhausted
    ResourceExhaustion,
    /// Python module or package missing
    MissingDependency,
    /// Tensor shape or dimension mismatch
    ShapeMismatch,
    /// fp16/fp32 dtype conflict
    DtypeMismatch,
    /// Node type not registered with the host
    MissingNodeType,
    /// NaN/inf values in outputs
    NumericInstability,
    /// Driver, CUDA or cuDNN failure
    Hardware,
    /// Model weights could not be loaded
    ModelFile,
    FileNotFound,
    Permission,
    Network,
    /// Version mismatch between models or plugins
    Compatibility,
    /// Malformed prompt or workflow JSON
    WorkflowFormat,
    /// Bug inside a node implementation
    NodeImplementation,
    Unclassified,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ResourceExhaustion => "resource_exhaustion",
            Category::MissingDependency => "missing_dependency",
            Category::ShapeMismatch => "shape_mismatch",
            Category::DtypeMismatch => "dtype_mismatch",
            Category::MissingNodeType => "missing_node_type",
            Category::NumericInstability => "numeric_instability",
            Category::Hardware => "hardware",
            Category::ModelFile => "model_file",
            Category::FileNotFound => "file_not_found",
            Category::Permission => "permission",
            Category::Network => "network",
            Category::Compatibility => "compatibility",
            Category::WorkflowFormat => "workflow_format",
            Category::NodeImplementation => "node_implementation",
            Category::Unclassified => "unclassified",
        }
    }
}

/// How much a matched pattern is trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Classifier verdict attached to an ErrorRecord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: Category,
    pub title: String,
    pub suggested_fix: Option<String>,
    pub pattern_id: Option<String>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
}

impl Diagnosis {
    pub fn unclassified() -> Self {
        Self {
            category: Category::Unclassified,
            title: "Unclassified error".to_string(),
            suggested_fix: None,
            pattern_id: None,
            confidence: Confidence::None,
            matched_text: None,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.category != Category::Unclassified
    }
}

/// A record with its diagnosis, as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Ledger sequence number, increasing per recorded error
    pub seq: u64,
    pub record: ErrorRecord,
    pub diagnosis: Diagnosis,
}
