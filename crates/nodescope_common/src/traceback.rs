//! Traceback Assembler
//!
//! Turns a stream of log lines into completed [`ErrorRecord`]s. The assembler is
//! a two-state machine (`Scanning`, `Accumulating`) advanced one line at a time,
//! so memory stays bounded by `max_lines` no matter what the log contains.
//!
//! Chained tracebacks ("During handling of the above exception ...") are folded:
//! a completed record waits in a one-slot buffer until the next non-blank line.
//! If that line is a chain marker, the record becomes a [`ChainedCause`] of the
//! next traceback instead of being emitted on its own.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::record::{ChainedCause, ErrorRecord, StackFrame};

/// Header line that opens every traceback
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Default bound on buffered lines for one traceback
pub const DEFAULT_MAX_TRACEBACK_LINES: usize = 400;

/// Path segment that marks the plugin tree when no explicit root is configured
pub const DEFAULT_PLUGIN_MARKER: &str = "custom_nodes";

const CHAIN_MARKERS: [&str; 2] = [
    "During handling of the above exception",
    "The above exception was the direct cause",
];

const BARE_KIND_SUFFIXES: [&str; 5] = ["Error", "Exception", "Interrupt", "Exit", "Warning"];

struct Matchers {
    timestamp: Regex,
    frame: Regex,
    terminal: Regex,
    context: Regex,
}

fn matchers() -> &'static Matchers {
    static MATCHERS: OnceLock<Matchers> = OnceLock::new();
    MATCHERS.get_or_init(|| Matchers {
        timestamp: Regex::new(r"^\[(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:\.\d+)?)\]\s?")
            .expect("timestamp regex"),
        frame: Regex::new(r#"^\s*File "([^"]+)", line (\d+)(?:, in (.+))?\s*$"#)
            .expect("frame regex"),
        terminal: Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)(?::\s?(.*))?$")
            .expect("terminal regex"),
        context: Regex::new(r"Error occurred when executing (\w+)").expect("context regex"),
    })
}

/// Resolves which plugin directory a source file belongs to.
#[derive(Debug, Clone, Default)]
pub struct PluginRoot {
    /// Normalized root with a trailing slash
    root: Option<String>,
}

impl PluginRoot {
    pub fn new(root: Option<&Path>) -> Self {
        let root = root.map(|p| {
            let mut s = normalize(&p.to_string_lossy());
            if !s.ends_with('/') {
                s.push('/');
            }
            s
        });
        Self { root }
    }

    /// Name of the plugin directory `path` lives under, if any.
    pub fn owning_node(&self, path: &str) -> Option<String> {
        let path = normalize(path);
        let rest = match &self.root {
            Some(root) => path.strip_prefix(root.as_str())?,
            None => {
                let marker = format!("/{}/", DEFAULT_PLUGIN_MARKER);
                let idx = path.find(&marker)?;
                &path[idx + marker.len()..]
            }
        };
        let first = rest.split('/').next()?;
        let name = first.strip_suffix(".py").unwrap_or(first);
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Traceback being accumulated.
#[derive(Debug, Default)]
struct Partial {
    lines: Vec<String>,
    frames: Vec<StackFrame>,
    timestamp: Option<DateTime<Utc>>,
    node_class: Option<String>,
    chain: Vec<ChainedCause>,
}

#[derive(Debug)]
enum State {
    Scanning,
    Accumulating(Partial),
}

/// Line-by-line traceback state machine.
#[derive(Debug)]
pub struct TracebackAssembler {
    state: State,
    plugin_root: PluginRoot,
    max_lines: usize,
    last_timestamp: Option<DateTime<Utc>>,
    node_class: Option<String>,
    pending: Option<ErrorRecord>,
    awaiting_chain: bool,
    discarded: u64,
}

impl TracebackAssembler {
    pub fn new(plugin_root: PluginRoot, max_lines: usize) -> Self {
        Self {
            state: State::Scanning,
            plugin_root,
            max_lines: max_lines.max(1),
            last_timestamp: None,
            node_class: None,
            pending: None,
            awaiting_chain: false,
            discarded: 0,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, State::Accumulating(_))
    }

    /// Number of partial tracebacks dropped for exceeding the line bound
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Feed one line. Returns a record when one is ready to be emitted.
    pub fn feed(&mut self, line: &str) -> Option<ErrorRecord> {
        let m = matchers();
        let (timestamp, body) = split_timestamp(line);
        if timestamp.is_some() {
            self.last_timestamp = timestamp;
        }

        match std::mem::replace(&mut self.state, State::Scanning) {
            State::Scanning => self.scan(line, body),
            State::Accumulating(mut partial) => {
                if body.trim_end() == TRACEBACK_HEADER {
                    // Restart without emitting the unfinished outer traceback
                    debug!("traceback restarted before completion");
                    self.state = State::Accumulating(Partial {
                        lines: vec![line.to_string()],
                        timestamp: self.last_timestamp.take(),
                        node_class: partial.node_class.take(),
                        chain: std::mem::take(&mut partial.chain),
                        ..Partial::default()
                    });
                    return None;
                }

                partial.lines.push(line.to_string());
                if partial.timestamp.is_none() {
                    partial.timestamp = timestamp;
                }

                if let Some(caps) = m.frame.captures(body) {
                    partial.frames.push(StackFrame {
                        file: caps[1].to_string(),
                        line: caps[2].parse().unwrap_or(0),
                        function: caps
                            .get(3)
                            .map(|f| f.as_str().trim().to_string())
                            .unwrap_or_else(|| "<unknown>".to_string()),
                    });
                } else if let Some((kind, message)) = parse_terminal(body) {
                    self.last_timestamp = None;
                    self.pending = Some(self.complete(partial, kind, message));
                    return None;
                }

                if partial.lines.len() > self.max_lines {
                    debug!(lines = partial.lines.len(), "discarding overlong traceback");
                    self.discarded += 1;
                    self.last_timestamp = None;
                    return None;
                }

                self.state = State::Accumulating(partial);
                None
            }
        }
    }

    /// The reader has no more data for now: release a completed record that
    /// was waiting for a possible chain marker. Partial tracebacks are kept.
    pub fn flush(&mut self) -> Option<ErrorRecord> {
        self.awaiting_chain = false;
        self.pending.take()
    }

    /// Forget everything tied to the current file (used after rotation).
    /// A completed record still waiting is returned rather than lost.
    pub fn reset(&mut self) -> Option<ErrorRecord> {
        if self.is_accumulating() {
            debug!("dropping partial traceback on reset");
        }
        self.state = State::Scanning;
        self.node_class = None;
        self.last_timestamp = None;
        self.flush()
    }

    fn scan(&mut self, line: &str, body: &str) -> Option<ErrorRecord> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return None;
        }

        if CHAIN_MARKERS.iter().any(|marker| trimmed.starts_with(marker)) {
            if self.pending.is_some() {
                self.awaiting_chain = true;
            }
            return None;
        }

        if trimmed == TRACEBACK_HEADER {
            let mut partial = Partial {
                lines: vec![line.to_string()],
                timestamp: self.last_timestamp.take(),
                node_class: self.node_class.take(),
                ..Partial::default()
            };
            let mut emitted = None;
            if let Some(previous) = self.pending.take() {
                if self.awaiting_chain {
                    partial.chain = previous.chain;
                    partial.chain.push(ChainedCause {
                        kind: previous.kind,
                        message: previous.message,
                    });
                    if partial.node_class.is_none() {
                        partial.node_class = previous.node_class;
                    }
                } else {
                    emitted = Some(previous);
                }
            }
            self.awaiting_chain = false;
            self.state = State::Accumulating(partial);
            return emitted;
        }

        if let Some(caps) = matchers().context.captures(trimmed) {
            self.node_class = Some(caps[1].to_string());
        }
        // An unstamped line ends the span a stamp can be inherited across
        if line.len() == body.len() {
            self.last_timestamp = None;
        }

        self.awaiting_chain = false;
        self.pending.take()
    }

    fn complete(&mut self, partial: Partial, kind: String, message: String) -> ErrorRecord {
        let innermost = partial.frames.last();
        let owning_node = partial
            .frames
            .iter()
            .rev()
            .find_map(|frame| self.plugin_root.owning_node(&frame.file));

        ErrorRecord {
            timestamp: partial.timestamp.unwrap_or_else(Utc::now),
            kind,
            message,
            file: innermost.map(|f| f.file.clone()),
            line: innermost.map(|f| f.line),
            owning_node,
            node_class: partial.node_class,
            frames: partial.frames,
            chain: partial.chain,
            raw: partial.lines.join("\n"),
        }
    }
}

/// Strip a `[YYYY-MM-DD HH:MM:SS]` prefix, returning its parsed value.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let Some(caps) = matchers().timestamp.captures(line) else {
        return (None, line);
    };
    let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
    let raw = caps[1].replace('T', " ");
    let parsed = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc());
    (parsed, &line[whole..])
}

/// Match the closing `Kind: message` line of a traceback.
fn parse_terminal(body: &str) -> Option<(String, String)> {
    if body.starts_with(char::is_whitespace) {
        return None;
    }
    let body = body.trim_end();
    let caps = matchers().terminal.captures(body)?;
    let kind = caps[1].to_string();
    match caps.get(2) {
        Some(message) => Some((kind, message.as_str().trim().to_string())),
        None => {
            let short = crate::record::short_kind(&kind);
            if BARE_KIND_SUFFIXES.iter().any(|suffix| short.ends_with(*suffix)) {
                Some((kind, String::new()))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OOM: &str = r#"Traceback (most recent call last):
  File "/srv/app/execution.py", line 151, in recursive_execute
    output_data = get_output_data(obj, input_data_all)
  File "/srv/app/custom_nodes/UltimateUpscale/nodes.py", line 88, in upscale
    return model(image)
  File "/usr/lib/python3.11/site-packages/torch/nn/modules/module.py", line 1501, in _call_impl
    return forward_call(*args, **kwargs)
torch.cuda.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB"#;

    fn assembler() -> TracebackAssembler {
        TracebackAssembler::new(PluginRoot::default(), DEFAULT_MAX_TRACEBACK_LINES)
    }

    fn feed_all(asm: &mut TracebackAssembler, text: &str) -> Vec<ErrorRecord> {
        let mut out: Vec<ErrorRecord> = text.lines().filter_map(|l| asm.feed(l)).collect();
        out.extend(asm.flush());
        out
    }

    #[test]
    fn test_well_formed_traceback() {
        let mut asm = assembler();
        let records = feed_all(&mut asm, OOM);
        assert_eq!(records.len(), 1);

        let rec = &records[0];
        assert_eq!(rec.kind, "torch.cuda.OutOfMemoryError");
        assert_eq!(rec.message, "CUDA out of memory. Tried to allocate 2.00 GiB");
        assert_eq!(rec.frames.len(), 3);
        assert_eq!(rec.frames[0].file, "/srv/app/execution.py");
        assert_eq!(rec.frames[0].line, 151);
        assert_eq!(rec.frames[0].function, "recursive_execute");
        assert_eq!(rec.frames[2].function, "_call_impl");
        assert_eq!(rec.line, Some(1501));
        assert_eq!(rec.owning_node.as_deref(), Some("UltimateUpscale"));
        assert_eq!(rec.raw.lines().count(), 8);
        assert!(!asm.is_accumulating());
    }

    #[test]
    fn test_truncated_traceback_never_emits() {
        let mut asm = assembler();
        let truncated: Vec<&str> = OOM.lines().take(5).collect();
        let records = feed_all(&mut asm, &truncated.join("\n"));
        assert!(records.is_empty());
        assert!(asm.is_accumulating());
        assert!(asm.flush().is_none());
    }

    #[test]
    fn test_truncated_traceback_completes_later() {
        let mut asm = assembler();
        let lines: Vec<&str> = OOM.lines().collect();
        for line in &lines[..5] {
            assert!(asm.feed(line).is_none());
        }
        assert!(asm.flush().is_none());
        for line in &lines[5..] {
            assert!(asm.feed(line).is_none());
        }
        let rec = asm.flush().expect("completed record");
        assert_eq!(rec.frames.len(), 3);
    }

    #[test]
    fn test_overlong_traceback_is_discarded() {
        let mut asm = TracebackAssembler::new(PluginRoot::default(), 10);
        asm.feed(TRACEBACK_HEADER);
        for i in 0..20 {
            asm.feed(&format!("  File \"/x.py\", line {}, in f", i));
        }
        assert!(!asm.is_accumulating());
        assert_eq!(asm.discarded(), 1);
        // The orphaned terminal line is not a traceback on its own
        assert!(asm.feed("ValueError: boom").is_none());
        assert!(asm.flush().is_none());
    }

    #[test]
    fn test_header_restarts_accumulation() {
        let mut asm = assembler();
        asm.feed(TRACEBACK_HEADER);
        asm.feed("  File \"/outer.py\", line 1, in outer");
        let records = feed_all(
            &mut asm,
            "Traceback (most recent call last):\n  File \"/inner.py\", line 2, in inner\nKeyError: 'model'",
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frames.len(), 1);
        assert_eq!(records[0].frames[0].file, "/inner.py");
        assert_eq!(records[0].message, "'model'");
    }

    #[test]
    fn test_chained_traceback_keeps_cause() {
        let text = r#"Traceback (most recent call last):
  File "/a.py", line 1, in load
KeyError: 'state_dict'

During handling of the above exception, another exception occurred:

Traceback (most recent call last):
  File "/b.py", line 9, in load_checkpoint
RuntimeError: Error loading model.safetensors"#;
        let mut asm = assembler();
        let records = feed_all(&mut asm, text);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.kind, "RuntimeError");
        assert_eq!(rec.chain.len(), 1);
        assert_eq!(rec.chain[0].kind, "KeyError");
        assert_eq!(rec.chain[0].message, "'state_dict'");
    }

    #[test]
    fn test_independent_tracebacks_emit_separately() {
        let text = format!("{}\ngot prompt\n{}", OOM, OOM);
        let mut asm = assembler();
        let records = feed_all(&mut asm, &text);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.chain.is_empty()));
    }

    #[test]
    fn test_pending_record_released_by_next_line() {
        let mut asm = assembler();
        for line in OOM.lines() {
            assert!(asm.feed(line).is_none());
        }
        assert!(asm.feed("Prompt executed in 0.12 seconds").is_some());
    }

    #[test]
    fn test_reset_drops_partial_keeps_pending() {
        let mut asm = assembler();
        for line in OOM.lines() {
            asm.feed(line);
        }
        assert!(asm.reset().is_some());

        asm.feed(TRACEBACK_HEADER);
        assert!(asm.reset().is_none());
        assert!(!asm.is_accumulating());
    }

    #[test]
    fn test_node_class_context() {
        let text = format!("!!! Exception during processing !!!\nError occurred when executing KSampler:\n\n{}", OOM);
        let mut asm = assembler();
        let records = feed_all(&mut asm, &text);
        assert_eq!(records[0].node_class.as_deref(), Some("KSampler"));
    }

    #[test]
    fn test_timestamp_prefix() {
        let text = "[2024-05-01 10:20:30.500] Traceback (most recent call last):\n[2024-05-01 10:20:30.501]   File \"/x.py\", line 3, in run\n[2024-05-01 10:20:30.502] ValueError: bad value";
        let mut asm = assembler();
        let records = feed_all(&mut asm, text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frames.len(), 1);
        assert_eq!(records[0].kind, "ValueError");
        assert_eq!(
            records[0].timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-05-01 10:20:30"
        );
    }

    #[test]
    fn test_stamp_not_inherited_by_later_traceback() {
        let text = format!(
            "[2024-05-01 10:20:30] Error occurred when executing KSampler:\n\n{}\n\n{}",
            OOM, OOM
        );
        let before = Utc::now();
        let mut asm = assembler();
        let records = feed_all(&mut asm, &text);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-05-01 10:20:30"
        );
        assert!(records[1].timestamp >= before);
    }

    #[test]
    fn test_stamp_dropped_after_unstamped_output() {
        let text = format!("[2024-05-01 10:20:30] got prompt\nloading model\n{}", OOM);
        let before = Utc::now();
        let mut asm = assembler();
        let records = feed_all(&mut asm, &text);
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp >= before);
    }

    #[test]
    fn test_bare_exception_name_terminates() {
        let mut asm = assembler();
        let records = feed_all(
            &mut asm,
            "Traceback (most recent call last):\n  File \"/x.py\", line 1, in main\nKeyboardInterrupt",
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "KeyboardInterrupt");
        assert!(records[0].message.is_empty());
    }

    #[test]
    fn test_indented_source_with_colon_is_not_terminal() {
        let mut asm = assembler();
        asm.feed(TRACEBACK_HEADER);
        asm.feed("  File \"/x.py\", line 1, in main");
        assert!(asm.feed("    result: int = compute(x)").is_none());
        assert!(asm.is_accumulating());
    }

    #[test]
    fn test_plugin_root_resolution() {
        let root = PluginRoot::new(Some(Path::new("/opt/host/custom_nodes")));
        assert_eq!(
            root.owning_node("/opt/host/custom_nodes/ControlNetAux/src/util.py").as_deref(),
            Some("ControlNetAux")
        );
        assert_eq!(root.owning_node("/opt/host/custom_nodes/single.py").as_deref(), Some("single"));
        assert_eq!(root.owning_node("/opt/host/nodes.py"), None);

        let marker = PluginRoot::default();
        assert_eq!(
            marker.owning_node(r"C:\host\custom_nodes\IPAdapter\ip.py").as_deref(),
            Some("IPAdapter")
        );
    }
}
