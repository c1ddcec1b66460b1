//! Plugin manifest document and its on-disk store.
//!
//! The manifest is one JSON document (`{"plugins": [...]}`) listing every
//! registered plugin. [`ManifestStore`] is the only component that writes it.
//! Writes replace the whole file through a temp file + rename, and every
//! read-modify-write of one store instance is serialized.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::PluginError;

/// Kind of a registered plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    /// Produced by the module scaffolder.
    #[default]
    GeneratedModule,
    /// Shipped with the host and registered by hand.
    StaticPlugin,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::GeneratedModule => f.write_str("generated-module"),
            PluginKind::StaticPlugin => f.write_str("static-plugin"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// The persisted, authoritative record for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type", default)]
    pub kind: PluginKind,
    /// Module root, relative to the engine's base directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PluginDescriptor {
    /// Check the fields serde cannot enforce.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("descriptor id must not be empty".into());
        }
        if self.name.trim().is_empty() {
            return Err(format!("descriptor '{}' has an empty name", self.id));
        }
        if matches!(self.path.as_deref(), Some(p) if p.trim().is_empty()) {
            return Err(format!("descriptor '{}' has an empty path", self.id));
        }
        Ok(())
    }
}

/// The whole manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub plugins: Vec<PluginDescriptor>,
}

impl ManifestDocument {
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.id == id)
    }

    /// Replace the entry with the same id in place, or append.
    /// Returns `true` when an existing entry was replaced.
    pub fn upsert(&mut self, descriptor: PluginDescriptor) -> bool {
        match self.plugins.iter_mut().find(|p| p.id == descriptor.id) {
            Some(existing) => {
                *existing = descriptor;
                true
            }
            None => {
                self.plugins.push(descriptor);
                false
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginDescriptor> {
        let index = self.plugins.iter().position(|p| p.id == id)?;
        Some(self.plugins.remove(index))
    }

    /// Parse a manifest leniently.
    ///
    /// Returns `None` when the text is not a `{"plugins": [...]}` JSON
    /// document. Individual entries that fail to parse, fail validation or
    /// repeat an earlier id are skipped.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let entries = value.get("plugins")?.as_array()?;

        let mut seen = HashSet::new();
        let mut plugins = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let descriptor = match serde_json::from_value::<PluginDescriptor>(entry.clone()) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(index, "skipping unparseable manifest entry: {e}");
                    continue;
                }
            };
            if let Err(reason) = descriptor.validate() {
                tracing::warn!(index, "skipping invalid manifest entry: {reason}");
                continue;
            }
            if !seen.insert(descriptor.id.clone()) {
                tracing::warn!(index, plugin_id = %descriptor.id, "skipping duplicate manifest entry");
                continue;
            }
            plugins.push(descriptor);
        }

        Some(Self { plugins })
    }
}

/// Write `bytes` to `path` through a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
pub(crate) fn validate_path_safety(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if p.is_absolute() || path.starts_with('/') {
        return Err(format!("path must be relative, got absolute: '{path}'"));
    }
    for component in p.components() {
        if matches!(
            component,
            std::path::Component::ParentDir | std::path::Component::Prefix(_)
        ) {
            return Err(format!("path must not escape the module root: '{path}'"));
        }
    }
    Ok(())
}

// ─── Store ──────────────────────────────────────────────────────────────

/// Owner of the manifest file.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest, creating an empty one if it is missing or corrupt.
    pub async fn load(&self) -> Result<ManifestDocument, PluginError> {
        let _guard = self.lock.lock().await;
        self.read_document().await
    }

    /// Replace the manifest with `document`.
    pub async fn save(&self, document: &ManifestDocument) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        self.write_document(document).await
    }

    /// Insert or replace one descriptor and persist.
    pub async fn upsert(&self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        let plugin_id = descriptor.id.clone();
        let replaced = document.upsert(descriptor);
        self.write_document(&document).await?;
        tracing::debug!(plugin_id = %plugin_id, replaced, "manifest entry upserted");
        Ok(())
    }

    /// Delete one descriptor and persist. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool, PluginError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        if document.remove(id).is_none() {
            return Ok(false);
        }
        self.write_document(&document).await?;
        tracing::debug!(plugin_id = %id, "manifest entry removed");
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<PluginDescriptor>, PluginError> {
        Ok(self.load().await?.get(id).cloned())
    }

    /// Flip one entry's `enabled` flag. Returns `false` without writing when
    /// the id is unknown.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, PluginError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        let Some(entry) = document.plugins.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        if entry.enabled != enabled {
            entry.enabled = enabled;
            self.write_document(&document).await?;
        }
        Ok(true)
    }

    /// Register a freshly scaffolded module: drop every entry that shares its
    /// id or its path, then append it. One write.
    pub async fn replace_module(&self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        let before = document.plugins.len();
        document.plugins.retain(|p| {
            p.id != descriptor.id && (descriptor.path.is_none() || p.path != descriptor.path)
        });
        let replaced = before - document.plugins.len();
        let plugin_id = descriptor.id.clone();
        document.plugins.push(descriptor);
        self.write_document(&document).await?;
        tracing::debug!(plugin_id = %plugin_id, replaced, "module registered in manifest");
        Ok(())
    }

    async fn read_document(&self) -> Result<ManifestDocument, PluginError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "manifest missing, creating empty manifest");
                let document = ManifestDocument::default();
                self.write_document(&document).await?;
                return Ok(document);
            }
            Err(e) => return Err(e.into()),
        };

        match ManifestDocument::parse_lenient(&raw) {
            Some(document) => Ok(document),
            None => {
                tracing::warn!(
                    path = %self.path.display(),
                    "manifest is malformed, discarding it and starting from an empty manifest"
                );
                let document = ManifestDocument::default();
                self.write_document(&document).await?;
                Ok(document)
            }
        }
    }

    async fn write_document(&self, document: &ManifestDocument) -> Result<(), PluginError> {
        persist_json(&self.path, document).await
    }
}

/// Pretty-print `value` and write it atomically to `path`.
pub(crate) async fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PluginError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> PluginDescriptor {
        PluginDescriptor {
            id: id.into(),
            name: format!("{id} plugin"),
            version: "1.0.0".into(),
            kind: PluginKind::GeneratedModule,
            path: Some(format!("generated-modules/{id}")),
            enabled: true,
            metadata: serde_json::Map::new(),
        }
    }

    // ── Document ────────────────────────────────────────────────────

    #[test]
    fn test_descriptor_json_shape() {
        let json = serde_json::to_value(descriptor("deals")).unwrap();
        assert_eq!(json["type"], "generated-module");
        assert_eq!(json["path"], "generated-modules/deals");
        assert_eq!(json["enabled"], true);
        assert!(json["metadata"].is_object());
    }

    #[test]
    fn test_descriptor_defaults() {
        let raw = r#"{"id":"core","name":"Core","version":"2"}"#;
        let d: PluginDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(d.kind, PluginKind::GeneratedModule);
        assert!(d.enabled);
        assert!(d.path.is_none());
        assert!(d.metadata.is_empty());
    }

    #[test]
    fn test_static_plugin_kind() {
        let raw = r#"{"id":"core","name":"Core","version":"2","type":"static-plugin"}"#;
        let d: PluginDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(d.kind, PluginKind::StaticPlugin);
        assert_eq!(d.kind.to_string(), "static-plugin");
    }

    #[test]
    fn test_document_upsert_replaces_in_place() {
        let mut doc = ManifestDocument::default();
        assert!(!doc.upsert(descriptor("a")));
        assert!(!doc.upsert(descriptor("b")));

        let mut updated = descriptor("a");
        updated.version = "2.0.0".into();
        assert!(doc.upsert(updated));

        assert_eq!(doc.plugins.len(), 2);
        assert_eq!(doc.plugins[0].id, "a");
        assert_eq!(doc.plugins[0].version, "2.0.0");
    }

    #[test]
    fn test_parse_lenient_rejects_non_manifest() {
        assert!(ManifestDocument::parse_lenient("not json {{").is_none());
        assert!(ManifestDocument::parse_lenient("[]").is_none());
        assert!(ManifestDocument::parse_lenient(r#"{"plugins": {}}"#).is_none());
    }

    #[test]
    fn test_parse_lenient_skips_bad_entries() {
        let raw = r#"{"plugins": [
            {"id": "good", "name": "Good", "version": "1.0.0"},
            {"name": "no id", "version": "1.0.0"},
            {"id": "", "name": "Empty id", "version": "1.0.0"},
            {"id": "good", "name": "Duplicate", "version": "9.9.9"},
            {"id": "also-good", "name": "Also good", "version": "0.1"}
        ]}"#;
        let doc = ManifestDocument::parse_lenient(raw).unwrap();
        let ids: Vec<_> = doc.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["good", "also-good"]);
        assert_eq!(doc.plugins[0].name, "Good");
    }

    // ── Path safety ─────────────────────────────────────────────────

    #[test]
    fn test_validate_path_safety() {
        assert!(validate_path_safety("components/Form.tsx").is_ok());
        assert!(validate_path_safety("index.ts").is_ok());
        assert!(validate_path_safety("../escape.ts").unwrap_err().contains("escape"));
        assert!(validate_path_safety("a/../../b.ts").is_err());
        assert!(validate_path_safety("/etc/passwd").unwrap_err().contains("absolute"));
    }

    // ── Store ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_load_creates_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("plugins.json"));

        let doc = store.load().await.unwrap();
        assert!(doc.plugins.is_empty());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let on_disk: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, serde_json::json!({"plugins": []}));
    }

    #[tokio::test]
    async fn test_load_resets_corrupt_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, "{ this is not json").unwrap();

        let store = ManifestStore::new(&path);
        let doc = store.load().await.unwrap();
        assert!(doc.plugins.is_empty());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"plugins\""));
    }

    #[tokio::test]
    async fn test_upsert_and_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("plugins.json"));

        store.upsert(descriptor("a")).await.unwrap();
        store.upsert(descriptor("b")).await.unwrap();

        let reopened = ManifestStore::new(store.path());
        let doc = reopened.load().await.unwrap();
        assert_eq!(doc.plugins.len(), 2);

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("plugins.json"));
        store.upsert(descriptor("a")).await.unwrap();

        assert!(store.set_enabled("a", false).await.unwrap());
        assert!(!store.get("a").await.unwrap().unwrap().enabled);
        assert!(!store.set_enabled("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_module_drops_same_id_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("plugins.json"));

        let mut legacy = descriptor("legacy-id");
        legacy.path = Some("generated-modules/deals".into());
        store.upsert(legacy).await.unwrap();
        store.upsert(descriptor("deals")).await.unwrap();
        store.upsert(descriptor("other")).await.unwrap();

        let mut fresh = descriptor("deals");
        fresh.version = "2.0.0".into();
        store.replace_module(fresh).await.unwrap();

        let doc = store.load().await.unwrap();
        let ids: Vec<_> = doc.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["other", "deals"]);
        assert_eq!(doc.get("deals").unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("plugins.json"));
        store.upsert(descriptor("a")).await.unwrap();
        store.upsert(descriptor("b")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["plugins.json"]);
    }
}
