//! Plugin Watcher - records file changes under the plugin tree
//!
//! Each change is tagged with the plugin directory it belongs to, so an error
//! blamed on a node can be shown next to the edits made to that node.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use nodescope_common::PluginRoot;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub owning_node: Option<String>,
}

pub struct PluginWatcher {
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn new(root: &Path, state: SharedState) -> Result<Self> {
        let plugins = PluginRoot::new(Some(root));
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for change in changes_from_event(&event, &plugins) {
                    debug!("Plugin file {:?}: {}", change.kind, change.path);
                    state.record_change(change);
                }
            }
            Err(e) => warn!("Watch error: {:?}", e),
        })?;

        watcher.watch(root, RecursiveMode::Recursive)?;
        info!("Plugin watcher initialized on {}", root.display());

        Ok(Self { _watcher: watcher })
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        _ => None,
    }
}

/// Bytecode caches churn on every import and say nothing about edits.
fn is_noise(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "__pycache__")
        || matches!(path.extension().and_then(|e| e.to_str()), Some("pyc" | "pyo"))
}

pub fn changes_from_event(event: &Event, plugins: &PluginRoot) -> Vec<FileChange> {
    let Some(kind) = change_kind(&event.kind) else {
        return Vec::new();
    };
    let timestamp = Utc::now();
    event
        .paths
        .iter()
        .filter(|p| !is_noise(p))
        .map(|p| {
            let path = p.to_string_lossy().into_owned();
            FileChange {
                owning_node: plugins.owning_node(&path),
                path,
                kind,
                timestamp,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_change_tagged_with_owning_node() {
        let plugins = PluginRoot::new(Some(Path::new("/srv/host/custom_nodes")));
        let changes = changes_from_event(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/srv/host/custom_nodes/ComfyUI-Impact-Pack/modules/impact/core.py",
            ),
            &plugins,
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].owning_node.as_deref(), Some("ComfyUI-Impact-Pack"));
    }

    #[test]
    fn test_kinds() {
        let plugins = PluginRoot::new(Some(Path::new("/n")));
        let created = changes_from_event(&event(EventKind::Create(CreateKind::File), "/n/a.py"), &plugins);
        assert_eq!(created[0].kind, ChangeKind::Created);
        assert_eq!(created[0].owning_node.as_deref(), Some("a"));

        let removed = changes_from_event(&event(EventKind::Remove(RemoveKind::Any), "/n/b/x.py"), &plugins);
        assert_eq!(removed[0].kind, ChangeKind::Removed);

        let meta = event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)), "/n/b/x.py");
        assert!(changes_from_event(&meta, &plugins).is_empty());
    }

    #[test]
    fn test_bytecode_ignored() {
        let plugins = PluginRoot::new(Some(Path::new("/n")));
        let ev = event(EventKind::Create(CreateKind::File), "/n/pack/__pycache__/x.cpython-311.pyc");
        assert!(changes_from_event(&ev, &plugins).is_empty());
    }

    #[test]
    fn test_watcher_records_changes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("pack")).unwrap();
        let state = crate::state::create_shared_state(&crate::config::Config::default());
        let _watcher = PluginWatcher::new(&root, state.clone()).unwrap();

        std::fs::write(root.join("pack").join("nodes.py"), "x = 1\n").unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while state.recent_changes(1).is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let changes = state.changes_for("pack");
        assert!(!changes.is_empty());
    }
}
