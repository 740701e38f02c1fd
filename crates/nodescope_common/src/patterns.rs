//! Pattern Catalog
//!
//! Ordered table of known failure signatures. Position in the catalog is the
//! priority: the classifier walks it top to bottom and the first pattern whose
//! checks all pass wins, so specific signatures sit above generic ones for the
//! same exception kind.
//!
//! Extra patterns can be dropped into a directory as JSON arrays; they are
//! appended after the built-ins.

use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NodescopeError, Result};
use crate::record::{Category, Confidence, ErrorRecord};

/// Placeholder in fix text replaced by the first captured group
pub const MATCH_PLACEHOLDER: &str = "{match}";

/// One predicate over an error record. A pattern passes when all its checks do.
#[derive(Debug, Clone)]
pub enum Check {
    /// Exception kind equals one of these (full dotted name or last segment)
    Kind(Vec<String>),
    /// Case-insensitive regex over the terminal line `Kind: message`
    Message(Regex),
    /// Case-insensitive substring of any frame's file path
    FramePath(String),
}

/// Evidence from a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub matched_text: String,
    pub capture: Option<String>,
}

impl Check {
    fn evaluate(&self, record: &ErrorRecord, terminal: &str) -> Option<PatternMatch> {
        match self {
            Check::Kind(kinds) => {
                let short = record.short_kind();
                kinds
                    .iter()
                    .any(|k| k == &record.kind || k == short)
                    .then(|| PatternMatch {
                        matched_text: record.kind.clone(),
                        capture: None,
                    })
            }
            Check::Message(regex) => {
                let caps = regex.captures(terminal)?;
                Some(PatternMatch {
                    matched_text: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
                    capture: caps
                        .iter()
                        .skip(1)
                        .flatten()
                        .next()
                        .map(|m| m.as_str().to_string()),
                })
            }
            Check::FramePath(needle) => record
                .frames
                .iter()
                .map(|f| f.file.replace('\\', "/"))
                .find(|file| file.to_lowercase().contains(needle.as_str()))
                .map(|file| PatternMatch {
                    matched_text: file,
                    capture: None,
                }),
        }
    }
}

/// A failure signature with its remedy.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: String,
    pub title: String,
    pub category: Category,
    pub fix: String,
    pub confidence: Confidence,
    checks: Vec<Check>,
}

impl Pattern {
    pub fn new(
        id: &str,
        title: &str,
        category: Category,
        confidence: Confidence,
        fix: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            category,
            fix: fix.to_string(),
            confidence,
            checks: Vec::new(),
        }
    }

    pub fn kind(mut self, kinds: &[&str]) -> Self {
        self.checks
            .push(Check::Kind(kinds.iter().map(|k| k.to_string()).collect()));
        self
    }

    pub fn message(mut self, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.checks.push(Check::Message(regex));
        Ok(self)
    }

    pub fn frame_path(mut self, needle: &str) -> Self {
        self.checks
            .push(Check::FramePath(needle.replace('\\', "/").to_lowercase()));
        self
    }

    /// Evaluate every check; the message check's evidence is preferred.
    pub fn matches(&self, record: &ErrorRecord) -> Option<PatternMatch> {
        if self.checks.is_empty() {
            return None;
        }
        let terminal = terminal_line(record);
        let mut evidence: Option<PatternMatch> = None;
        for check in &self.checks {
            let found = check.evaluate(record, &terminal)?;
            let replace = match (&evidence, check) {
                (None, _) => true,
                (Some(_), Check::Message(_)) => true,
                _ => false,
            };
            if replace {
                evidence = Some(found);
            }
        }
        evidence
    }

    /// Fix text with the placeholder substituted.
    pub fn render_fix(&self, found: &PatternMatch) -> String {
        match &found.capture {
            Some(capture) => self.fix.replace(MATCH_PLACEHOLDER, capture),
            None => self.fix.clone(),
        }
    }
}

fn terminal_line(record: &ErrorRecord) -> String {
    if record.message.is_empty() {
        record.kind.clone()
    } else {
        format!("{}: {}", record.kind, record.message)
    }
}

/// User-supplied pattern as stored in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDef {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_def_category")]
    pub category: Category,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub frame_path: Option<String>,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default = "default_def_confidence")]
    pub confidence: Confidence,
}

fn default_def_category() -> Category {
    Category::NodeImplementation
}

fn default_def_confidence() -> Confidence {
    Confidence::Medium
}

impl TryFrom<PatternDef> for Pattern {
    type Error = NodescopeError;

    fn try_from(def: PatternDef) -> Result<Self> {
        let title = def.title.as_deref().unwrap_or(&def.id).to_string();
        let mut pattern = Pattern::new(&def.id, &title, def.category, def.confidence, &def.suggestion);
        if !def.kinds.is_empty() {
            let kinds: Vec<&str> = def.kinds.iter().map(String::as_str).collect();
            pattern = pattern.kind(&kinds);
        }
        if let Some(regex) = &def.pattern {
            pattern = pattern.message(regex).map_err(|e| NodescopeError::InvalidPattern {
                id: def.id.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(needle) = &def.frame_path {
            pattern = pattern.frame_path(needle);
        }
        if pattern.checks.is_empty() {
            return Err(NodescopeError::InvalidPattern {
                id: def.id,
                reason: "pattern has no checks".to_string(),
            });
        }
        Ok(pattern)
    }
}

/// Ordered set of patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    patterns: Vec<Pattern>,
}

impl PatternCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the built-in signatures.
    pub fn builtin() -> Self {
        Self {
            patterns: builtin_patterns(),
        }
    }

    pub fn push(&mut self, pattern: Pattern) {
        self.patterns.push(pattern);
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Append every pattern found in `*.json` files under `dir`, in file name
    /// order. Unreadable files and invalid patterns are skipped.
    pub fn extend_from_dir(&mut self, dir: &Path) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No custom patterns at {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        files.sort();

        let mut loaded = 0;
        for path in files {
            let defs: Vec<PatternDef> = match fs::read_to_string(&path)
                .map_err(NodescopeError::from)
                .and_then(|s| serde_json::from_str(&s).map_err(NodescopeError::from))
            {
                Ok(defs) => defs,
                Err(e) => {
                    warn!("Skipping pattern file {}: {}", path.display(), e);
                    continue;
                }
            };
            for def in defs {
                match Pattern::try_from(def) {
                    Ok(pattern) => {
                        self.patterns.push(pattern);
                        loaded += 1;
                    }
                    Err(e) => warn!("Skipping pattern in {}: {}", path.display(), e),
                }
            }
        }
        loaded
    }
}

fn builtin(
    id: &str,
    title: &str,
    category: Category,
    confidence: Confidence,
    fix: &str,
) -> Pattern {
    Pattern::new(id, title, category, confidence, fix)
}

fn re(pattern: Pattern, regex: &str) -> Pattern {
    pattern.message(regex).expect("Invalid built-in pattern regex")
}

fn builtin_patterns() -> Vec<Pattern> {
    use Category::*;
    use Confidence::{High, Low, Medium};

    vec![
        // Memory
        re(
            builtin("cuda_oom", "CUDA Out of Memory", ResourceExhaustion, High,
                "Reduce batch size or image resolution, or enable CPU offloading. Starting the host with `--lowvram` (or `--novram`) trades speed for memory.")
                .kind(&["OutOfMemoryError", "RuntimeError"]),
            r"CUDA out of memory",
        ),
        re(
            builtin("mps_oom", "MPS Out of Memory (Apple Silicon)", ResourceExhaustion, High,
                "Reduce image resolution or batch size. `--force-fp16` lowers memory use on Apple Silicon."),
            r"MPS backend out of memory",
        ),
        re(
            builtin("gpu_alloc_failed", "GPU Allocation Failed", ResourceExhaustion, Medium,
                "The GPU ran out of memory during allocation. Close other GPU applications, lower resolution, or use tiled nodes."),
            r"out of memory on device|CUBLAS_STATUS_ALLOC_FAILED|CUDA out of memory",
        ),
        builtin("host_oom", "System RAM Exhausted", ResourceExhaustion, Medium,
            "The process ran out of system memory. Close other applications, load smaller models, or add swap.")
            .kind(&["MemoryError"]),
        // Dependencies
        re(
            builtin("insightface_missing", "InsightFace Not Installed", MissingDependency, High,
                "Install InsightFace with `pip install insightface`. Face nodes also need the 'buffalo_l' model downloaded.")
                .kind(&["ModuleNotFoundError", "ImportError"]),
            r"insightface|buffalo_l",
        ),
        re(
            builtin("module_not_found", "Missing Python Module", MissingDependency, High,
                "Install the missing module into the host's Python environment: `pip install {match}`.")
                .kind(&["ModuleNotFoundError"]),
            r"No module named '([\w.\-]+)'",
        ),
        re(
            builtin("import_name", "Incompatible Package Version", Compatibility, Medium,
                "`{match}` no longer exists in the installed package. Update the custom node or pin the package version it expects.")
                .kind(&["ImportError"]),
            r"cannot import name '(\w+)'",
        ),
        // Graph / node registry
        re(
            builtin("missing_node_type", "Node Type Not Registered", MissingNodeType, High,
                "Node type `{match}` is not registered. Install the custom node that provides it (or check its import errors at startup) and restart the host."),
            r"Cannot execute because (?:a )?node (?:type )?'?([\w.\- ]+?)'? does not exist",
        ),
        re(
            builtin("unknown_class_type", "Unknown Node Class", MissingNodeType, Medium,
                "The workflow references node class `{match}` which the host does not know. Install or update the plugin that defines it."),
            r"(?:class_type|node type) '?(\w+)'? (?:not found|is not registered|is unknown)",
        ),
        re(
            builtin("invalid_prompt", "Invalid Prompt Format", WorkflowFormat, Medium,
                "The workflow JSON is malformed. Check for missing connections or invalid node configuration."),
            r"invalid prompt|prompt.*json.*error|Prompt outputs failed validation",
        ),
        // Tensors
        re(
            builtin("dtype_mismatch", "Float Type Mismatch (fp16/fp32)", DtypeMismatch, High,
                "Connected nodes disagree on precision. Load models in the same dtype, or add a conversion step. `--force-fp32` rules out half-precision issues."),
            r"expected .*(Float|Half|BFloat16).*(?:got|found).*(?:Half|Float|BFloat16)|Input type \(.*\) and weight type \(.*\) should be the same",
        ),
        re(
            builtin("controlnet_mismatch", "ControlNet Model Mismatch", Compatibility, Medium,
                "The ControlNet model does not match the base model. Use a ControlNet trained for your base model family (SD1.5, SDXL, ...)."),
            r"ControlNet.*mismatch|control.*dimension",
        ),
        re(
            builtin("lora_incompatible", "LoRA Incompatibility", Compatibility, Medium,
                "The LoRA was trained for a different base model. Match the LoRA to your checkpoint family."),
            r"LoRA.*incompatible|lora.*key.*missing",
        ),
        re(
            builtin("shape_mismatch", "Tensor Dimension Mismatch", ShapeMismatch, High,
                "Tensor shapes do not match between connected nodes. Check that resolutions, batch sizes and latent channels agree across the workflow.")
                .kind(&["RuntimeError", "ValueError"]),
            r"size mismatch|shape mismatch|shapes cannot be multiplied|must match the size of tensor|dimension",
        ),
        re(
            builtin("nan_output", "NaN / Inf Values in Output", NumericInstability, Medium,
                "Outputs contain NaN or infinite values, which shows up as black images. Use an fp32 VAE (`--fp32-vae`), lower CFG, or avoid half precision for this model."),
            r"invalid value encountered in cast|contains? (?:NaN|inf)\b|\bnan values",
        ),
        // Hardware
        re(
            builtin("torch_not_cuda", "PyTorch Built Without CUDA", Hardware, High,
                "The installed PyTorch has no CUDA support. Reinstall PyTorch with the CUDA build matching your driver, or start the host with `--cpu`.")
                .kind(&["AssertionError"]),
            r"Torch not compiled with CUDA enabled",
        ),
        re(
            builtin("cudnn_error", "cuDNN Error", Hardware, Medium,
                "CUDA/cuDNN configuration issue. Update the NVIDIA driver or reinstall PyTorch with the correct CUDA version."),
            r"cuDNN error|CUDNN_STATUS",
        ),
        re(
            builtin("cuda_device_error", "CUDA Device Error", Hardware, Medium,
                "The GPU reported a device-level fault. Restart the host; if it persists, update the driver and check for overclocking or overheating."),
            r"CUDA error: (?:device-side assert|an illegal memory access|no kernel image|unspecified launch failure)",
        ),
        // Files
        re(
            builtin("safetensors_error", "SafeTensors Loading Error", ModelFile, Medium,
                "The model file may be corrupted or incomplete. Re-download it and check it is the right format for this node."),
            r"safetensors.*error|Error loading.*\.safetensors|HeaderTooLarge|MetadataIncompleteBuffer",
        ),
        re(
            builtin("file_not_found", "File Not Found", FileNotFound, Medium,
                "Check that the path exists. Models must be in the matching models subdirectory of the host."),
            r"FileNotFoundError|No such file or directory",
        ),
        re(
            builtin("permission_denied", "Permission Denied", Permission, Medium,
                "The host cannot access this file or directory. Check ownership and permissions of the models and output directories."),
            r"PermissionError|Permission denied",
        ),
        re(
            builtin("connection_refused", "Connection Refused", Network, Medium,
                "A network connection failed. Check the internet connection and the API endpoint used by the node."),
            r"Connection refused|ConnectionRefusedError|Max retries exceeded",
        ),
        // Model / plugin specific
        re(
            builtin("vae_decode_error", "VAE Decode Error", ModelFile, Low,
                "Try a different VAE or the checkpoint's built-in VAE. Some models need a specific VAE file."),
            r"VAE.*decode|vae.*error",
        ),
        re(
            builtin("animatediff_error", "AnimateDiff Error", Compatibility, Low,
                "Check that the motion module is installed and compatible with the base model."),
            r"AnimateDiff|motion.*module",
        ),
        builtin("ipadapter_error", "IPAdapter Error", Compatibility, Low,
            "Make sure the IPAdapter models are in the right directory and match the base model version.")
            .frame_path("ipadapter"),
        re(
            builtin("key_error", "Missing Key", Compatibility, Medium,
                "The workflow expects key '{match}' which does not exist. This usually means a model or custom node version mismatch.")
                .kind(&["KeyError"]),
            r"'([\w.\-]+)'",
        ),
        re(
            builtin("attribute_error", "Attribute Error", Compatibility, Medium,
                "A '{match}' object lacks an expected attribute. Custom nodes are likely out of date relative to the host; update them.")
                .kind(&["AttributeError"]),
            r"'(\w+)' object has no attribute '\w+'",
        ),
        re(
            builtin("torch_no_grad", "Gradient Computation Error", NodeImplementation, Low,
                "A node computes gradients on a tensor that does not require them. This is a bug in the node implementation."),
            r"element 0 of tensors does not require grad",
        ),
    ]
}
