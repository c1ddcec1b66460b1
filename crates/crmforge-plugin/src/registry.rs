//! Plugin table — runtime records of loaded plugins.
//!
//! The table mirrors the manifest plus volatile state (load time, resolved
//! enabled flag, last error). It is never persisted; the engine rebuilds it
//! from the manifest on start and keeps it in sync on every reconciliation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::loader::{Loadable, PluginHandle};
use crate::manifest::{PluginDescriptor, PluginKind};

/// Stored state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Resolved and enabled.
    Loaded,
    /// Resolved, disabled in the manifest.
    Disabled,
    /// Could not be resolved; registered but non-functional.
    Error,
}

/// In-memory record for one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimePluginRecord {
    /// Descriptor exactly as last read from the manifest.
    pub descriptor: PluginDescriptor,
    /// Effective flag: the manifest's, forced to `false` while in `Error`.
    pub enabled: bool,
    pub state: PluginState,
    pub handle: Option<PluginHandle>,
    pub loaded_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl RuntimePluginRecord {
    /// Resolve `descriptor` through `loader` and build its record.
    ///
    /// Resolution failures never propagate; they produce an `Error` record.
    pub fn load(descriptor: PluginDescriptor, loader: &dyn Loadable) -> Self {
        let now = Utc::now();
        match loader.resolve(&descriptor) {
            Ok(handle) => {
                let state = if descriptor.enabled {
                    PluginState::Loaded
                } else {
                    PluginState::Disabled
                };
                Self {
                    enabled: descriptor.enabled,
                    descriptor,
                    state,
                    handle: Some(handle),
                    loaded_at: now,
                    last_error: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    plugin_id = %descriptor.id,
                    path = descriptor.path.as_deref().unwrap_or("-"),
                    "plugin could not be resolved, marking it disabled: {e}"
                );
                Self {
                    descriptor,
                    enabled: false,
                    state: PluginState::Error,
                    handle: None,
                    loaded_at: now,
                    last_error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Apply a toggle that has already been persisted.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.descriptor.enabled = enabled;
        if self.state != PluginState::Error {
            self.enabled = enabled;
            self.state = if enabled {
                PluginState::Loaded
            } else {
                PluginState::Disabled
            };
        }
    }

    /// Whether `other` differs in a way that warrants a reload.
    pub fn differs_from(&self, other: &PluginDescriptor) -> bool {
        let current = &self.descriptor;
        current.version != other.version
            || current.enabled != other.enabled
            || current.metadata != other.metadata
            || current.name != other.name
            || current.kind != other.kind
            || current.path != other.path
    }

    /// Descriptor carrying the effective `enabled` flag, for event payloads.
    pub fn effective_descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            enabled: self.enabled,
            ..self.descriptor.clone()
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            enabled: self.enabled,
            kind: self.descriptor.kind,
            state: self.state,
        }
    }
}

/// Map of plugin id → runtime record.
#[derive(Debug, Default)]
pub struct PluginTable {
    records: HashMap<String, RuntimePluginRecord>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RuntimePluginRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RuntimePluginRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Insert or replace; returns the previous record.
    pub fn insert(&mut self, record: RuntimePluginRecord) -> Option<RuntimePluginRecord> {
        self.records.insert(record.descriptor.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<RuntimePluginRecord> {
        self.records.remove(id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Ids sorted for deterministic iteration.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn records(&self) -> impl Iterator<Item = &RuntimePluginRecord> {
        self.records.values()
    }

    /// Summaries sorted by id.
    pub fn summaries(&self) -> Vec<PluginSummary> {
        let mut out: Vec<PluginSummary> = self.records.values().map(|r| r.summary()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

/// One line of the status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub kind: PluginKind,
    pub state: PluginState,
}

/// Engine status, for health and monitoring collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub watching: bool,
    pub plugin_count: usize,
    pub watcher_count: usize,
    pub plugins: Vec<PluginSummary>,
}

impl EngineStatus {
    pub fn plugin(&self, id: &str) -> Option<&PluginSummary> {
        self.plugins.iter().find(|p| p.id == id)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{DirectoryLoader, LoadError};

    struct RejectAll;

    impl Loadable for RejectAll {
        fn resolve(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, LoadError> {
            Err(LoadError::Rejected(descriptor.id.clone()))
        }
    }

    fn descriptor(id: &str, path: Option<&str>) -> PluginDescriptor {
        PluginDescriptor {
            id: id.into(),
            name: id.to_uppercase(),
            version: "1.0.0".into(),
            kind: PluginKind::GeneratedModule,
            path: path.map(str::to_string),
            enabled: true,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_load_resolvable_plugin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mods/a")).unwrap();
        let loader = DirectoryLoader::new(dir.path());

        let record = RuntimePluginRecord::load(descriptor("a", Some("mods/a")), &loader);
        assert_eq!(record.state, PluginState::Loaded);
        assert!(record.enabled);
        assert!(record.last_error.is_none());
        assert!(record.handle.is_some());
    }

    #[test]
    fn test_load_disabled_plugin() {
        let mut d = descriptor("a", None);
        d.enabled = false;
        let record = RuntimePluginRecord::load(d, &DirectoryLoader::new("."));
        assert_eq!(record.state, PluginState::Disabled);
        assert!(!record.enabled);
    }

    #[test]
    fn test_load_missing_path_degrades_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DirectoryLoader::new(dir.path());

        let record = RuntimePluginRecord::load(descriptor("a", Some("mods/gone")), &loader);
        assert_eq!(record.state, PluginState::Error);
        assert!(!record.enabled);
        // The manifest's flag is kept as seen.
        assert!(record.descriptor.enabled);
        assert!(record.last_error.unwrap().contains("mods/gone"));
    }

    #[test]
    fn test_load_rejected_by_custom_loader() {
        let record = RuntimePluginRecord::load(descriptor("a", None), &RejectAll);
        assert_eq!(record.state, PluginState::Error);
        assert_eq!(record.last_error.as_deref(), Some("loader rejected plugin: a"));
    }

    #[test]
    fn test_set_enabled_keeps_error_state() {
        let mut record = RuntimePluginRecord::load(descriptor("a", None), &RejectAll);
        record.set_enabled(false);
        assert_eq!(record.state, PluginState::Error);
        assert!(!record.descriptor.enabled);

        let mut ok = RuntimePluginRecord::load(descriptor("b", None), &DirectoryLoader::new("."));
        ok.set_enabled(false);
        assert_eq!(ok.state, PluginState::Disabled);
        ok.set_enabled(true);
        assert_eq!(ok.state, PluginState::Loaded);
        assert!(ok.enabled);
    }

    #[test]
    fn test_differs_from() {
        let record = RuntimePluginRecord::load(descriptor("a", None), &DirectoryLoader::new("."));
        assert!(!record.differs_from(&descriptor("a", None)));

        let mut bumped = descriptor("a", None);
        bumped.version = "1.0.1".into();
        assert!(record.differs_from(&bumped));

        let mut meta = descriptor("a", None);
        meta.metadata
            .insert("routes".into(), serde_json::json!(["/contacts"]));
        assert!(record.differs_from(&meta));

        let mut disabled = descriptor("a", None);
        disabled.enabled = false;
        assert!(record.differs_from(&disabled));
    }

    #[test]
    fn test_table_summaries_sorted() {
        let loader = DirectoryLoader::new(".");
        let mut table = PluginTable::new();
        for id in ["zeta", "alpha", "mid"] {
            table.insert(RuntimePluginRecord::load(descriptor(id, None), &loader));
        }
        let ids: Vec<_> = table.summaries().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert_eq!(table.ids(), vec!["alpha", "mid", "zeta"]);

        assert!(table.remove("mid").is_some());
        assert!(!table.contains("mid"));
        assert_eq!(table.len(), 2);
    }
}
