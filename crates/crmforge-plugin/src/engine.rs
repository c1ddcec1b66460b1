//! Reload engine keeping the plugin table in sync with the manifest.
//!
//! Two file watches feed one forwarding task:
//! - the manifest's parent directory (non-recursive, filtered by file name so
//!   rename-based writes are seen), which triggers a reconciliation pass
//! - the generated-modules root (recursive), which is correlated with loaded
//!   plugins and published as `module-changed`
//!
//! Reconciliation passes, toggles and forced reloads share one async mutex.
//! The plugin table itself sits behind a `parking_lot` lock that is never held
//! across an `.await`, so `status()` stays synchronous.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::events::{
    EngineEvent, EventBus, FileChangeKind, ModuleChange, ReloadEvent, ReloadKind, SystemEvent,
};
use crate::loader::{DirectoryLoader, Loadable};
use crate::manifest::{ManifestStore, PluginDescriptor};
use crate::registry::{EngineStatus, PluginState, PluginTable, RuntimePluginRecord};

/// Result of [`ReloadEngine::toggle_plugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleOutcome {
    /// Flag flipped, persisted and announced.
    Changed,
    /// Already in the requested state; nothing written.
    Unchanged,
    /// No manifest entry with that id.
    NotFound,
}

/// Ids touched by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Raw watcher output, tagged by the watch that produced it.
enum WatchSignal {
    Manifest(notify::Result<Event>),
    Modules(notify::Result<Event>),
}

struct ActiveWatch {
    watcher: RecommendedWatcher,
    path: PathBuf,
}

#[derive(Default)]
struct WatchState {
    running: bool,
    watches: Vec<ActiveWatch>,
    task: Option<JoinHandle<()>>,
}

/// What the forwarding task needs to interpret raw events.
struct WatchRoots {
    manifest_name: Option<OsString>,
    modules_root: PathBuf,
}

struct Inner {
    config: EngineConfig,
    store: Arc<ManifestStore>,
    loader: Arc<dyn Loadable>,
    table: RwLock<PluginTable>,
    bus: EventBus,
    ops: tokio::sync::Mutex<()>,
    watch: Mutex<WatchState>,
}

/// Plugin registry and hot-reload engine.
pub struct ReloadEngine {
    inner: Arc<Inner>,
}

impl ReloadEngine {
    /// Engine resolving descriptor paths as directories under `base_dir`.
    pub fn new(config: EngineConfig, store: Arc<ManifestStore>) -> Self {
        let loader = Arc::new(DirectoryLoader::new(&config.base_dir));
        Self::with_loader(config, store, loader)
    }

    pub fn with_loader(
        config: EngineConfig,
        store: Arc<ManifestStore>,
        loader: Arc<dyn Loadable>,
    ) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                loader,
                table: RwLock::new(PluginTable::new()),
                bus,
                ops: tokio::sync::Mutex::new(()),
                watch: Mutex::new(WatchState::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    /// Load the manifest, populate the table, start watching.
    ///
    /// A corrupt manifest is reset by the store and a watcher that fails to
    /// start is skipped; neither fails startup. No-op when already running.
    pub async fn start(&self) -> Result<(), PluginError> {
        let _guard = self.inner.ops.lock().await;
        if self.inner.watch.lock().running {
            tracing::debug!("engine already running, ignoring start");
            return Ok(());
        }

        let document = self.inner.store.load().await?;
        let records: Vec<RuntimePluginRecord> = document
            .plugins
            .into_iter()
            .map(|d| RuntimePluginRecord::load(d, self.inner.loader.as_ref()))
            .collect();

        let mut events = Vec::new();
        {
            let mut table = self.inner.table.write();
            table.clear();
            for record in records {
                if record.enabled {
                    events.push(EngineEvent::PluginLoaded(ReloadEvent::new(
                        ReloadKind::Added,
                        record.effective_descriptor(),
                    )));
                }
                table.insert(record);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (watches, roots) = self.inner.start_watches(tx).await;
        let task = tokio::spawn(forward_events(Arc::clone(&self.inner), rx, roots));
        let watcher_count = watches.len();
        {
            let mut state = self.inner.watch.lock();
            state.running = true;
            state.watches = watches;
            state.task = Some(task);
        }

        for event in events {
            self.inner.bus.publish(event);
        }
        let started = self.inner.system_event();
        tracing::info!(
            plugins = started.plugin_count,
            watchers = watcher_count,
            manifest = %self.inner.store.path().display(),
            "reload engine started"
        );
        self.inner.bus.publish(EngineEvent::SystemStarted(started));
        Ok(())
    }

    /// Re-read the manifest and bring the table in line with it.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, PluginError> {
        self.inner.reconcile().await
    }

    /// Persist a new enabled flag for `id` and announce it.
    pub async fn toggle_plugin(&self, id: &str, enabled: bool) -> Result<ToggleOutcome, PluginError> {
        let _guard = self.inner.ops.lock().await;

        let Some(current) = self.inner.store.get(id).await? else {
            tracing::debug!(plugin_id = %id, "toggle requested for unknown plugin");
            return Ok(ToggleOutcome::NotFound);
        };
        if current.enabled == enabled {
            return Ok(ToggleOutcome::Unchanged);
        }

        self.inner.store.set_enabled(id, enabled).await?;

        let descriptor = {
            let mut table = self.inner.table.write();
            match table.get_mut(id) {
                Some(record) => {
                    record.set_enabled(enabled);
                    if record.state == PluginState::Error {
                        tracing::warn!(
                            plugin_id = %id,
                            enabled,
                            "flag persisted but plugin is still unresolved"
                        );
                    }
                    record.effective_descriptor()
                }
                None => PluginDescriptor { enabled, ..current },
            }
        };

        let kind = if enabled {
            ReloadKind::Enabled
        } else {
            ReloadKind::Disabled
        };
        tracing::info!(plugin_id = %id, enabled, "plugin toggled");
        self.inner
            .bus
            .publish(EngineEvent::PluginToggled(ReloadEvent::new(kind, descriptor)));
        Ok(ToggleOutcome::Changed)
    }

    /// Re-read one descriptor from the manifest and re-register it.
    pub async fn reload_plugin(&self, id: &str) -> Result<RuntimePluginRecord, PluginError> {
        let _guard = self.inner.ops.lock().await;

        let descriptor = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let record = RuntimePluginRecord::load(descriptor, self.inner.loader.as_ref());
        let payload = record.effective_descriptor();
        self.inner.table.write().insert(record.clone());

        tracing::info!(plugin_id = %id, state = ?record.state, "plugin reloaded");
        self.inner
            .bus
            .publish(EngineEvent::PluginReloaded(ReloadEvent::new(ReloadKind::Updated, payload)));
        Ok(record)
    }

    /// Drop every watch and the forwarding task. Never touches the manifest.
    pub async fn stop(&self) {
        let _guard = self.inner.ops.lock().await;

        let (watches, task, was_running) = {
            let mut state = self.inner.watch.lock();
            (
                std::mem::take(&mut state.watches),
                state.task.take(),
                std::mem::replace(&mut state.running, false),
            )
        };

        for mut active in watches {
            if let Err(e) = active.watcher.unwatch(&active.path) {
                tracing::warn!(path = %active.path.display(), "failed to unwatch: {e}");
            }
        }
        if let Some(task) = task {
            task.abort();
        }

        let stopped = self.inner.system_event();
        if was_running {
            tracing::info!(plugins = stopped.plugin_count, "reload engine stopped");
        }
        self.inner.bus.publish(EngineEvent::SystemStopped(stopped));
    }

    pub fn status(&self) -> EngineStatus {
        let (watching, watcher_count) = {
            let state = self.inner.watch.lock();
            (state.running, state.watches.len())
        };
        let table = self.inner.table.read();
        EngineStatus {
            watching,
            plugin_count: table.len(),
            watcher_count,
            plugins: table.summaries(),
        }
    }

    /// Snapshot of one runtime record.
    pub fn plugin(&self, id: &str) -> Option<RuntimePluginRecord> {
        self.inner.table.read().get(id).cloned()
    }
}

impl Drop for ReloadEngine {
    fn drop(&mut self) {
        if let Some(task) = self.inner.watch.lock().task.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn system_event(&self) -> SystemEvent {
        let watcher_count = self.watch.lock().watches.len();
        SystemEvent {
            plugin_count: self.table.read().len(),
            watcher_count,
            timestamp: Utc::now(),
        }
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, PluginError> {
        let _guard = self.ops.lock().await;
        let document = self.store.load().await?;

        let changes: Vec<(ReloadKind, PluginDescriptor)> = {
            let table = self.table.read();
            document
                .plugins
                .iter()
                .filter_map(|d| match table.get(&d.id) {
                    None => Some((ReloadKind::Added, d.clone())),
                    Some(record) if record.differs_from(d) => Some((ReloadKind::Updated, d.clone())),
                    Some(_) => None,
                })
                .collect()
        };
        let current: HashSet<&str> = document.plugins.iter().map(|d| d.id.as_str()).collect();

        // Resolution touches the filesystem; keep it outside the table lock.
        let loaded: Vec<(ReloadKind, RuntimePluginRecord)> = changes
            .into_iter()
            .map(|(kind, d)| (kind, RuntimePluginRecord::load(d, self.loader.as_ref())))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut events = Vec::new();
        {
            let mut table = self.table.write();
            for (kind, record) in loaded {
                let id = record.id().to_string();
                let event = ReloadEvent::new(kind, record.effective_descriptor());
                table.insert(record);
                if kind == ReloadKind::Added {
                    summary.added.push(id);
                    events.push(EngineEvent::PluginLoaded(event));
                } else {
                    summary.updated.push(id);
                    events.push(EngineEvent::PluginUpdated(event));
                }
            }
            for id in table.ids() {
                if current.contains(id.as_str()) {
                    continue;
                }
                if let Some(record) = table.remove(&id) {
                    events.push(EngineEvent::PluginRemoved(ReloadEvent::new(
                        ReloadKind::Removed,
                        record.descriptor,
                    )));
                    summary.removed.push(id);
                }
            }
        }

        for event in events {
            self.bus.publish(event);
        }

        if summary.is_empty() {
            tracing::debug!("manifest reconciled, no changes");
        } else {
            tracing::info!(
                added = summary.added.len(),
                updated = summary.updated.len(),
                removed = summary.removed.len(),
                "manifest reconciled"
            );
        }
        Ok(summary)
    }

    /// Publish `module-changed` for every plugin owning `relative`.
    fn publish_module_change(&self, relative: &Path, change: FileChangeKind) -> usize {
        let changes = correlate(&self.table.read(), relative, change);
        let count = changes.len();
        for c in changes {
            self.bus.publish(EngineEvent::ModuleChanged(c));
        }
        count
    }

    async fn start_watches(
        &self,
        tx: mpsc::UnboundedSender<WatchSignal>,
    ) -> (Vec<ActiveWatch>, WatchRoots) {
        let mut watches = Vec::new();

        let manifest_path = self.store.path();
        let manifest_dir = match manifest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let manifest_dir = canonical_or_given(&manifest_dir).await;
        match watch_path(&manifest_dir, RecursiveMode::NonRecursive, tx.clone(), WatchSignal::Manifest) {
            Ok(watcher) => watches.push(ActiveWatch {
                watcher,
                path: manifest_dir,
            }),
            Err(e) => tracing::warn!(
                path = %manifest_dir.display(),
                "manifest watch failed to start, continuing without it: {e}"
            ),
        }

        let modules_dir = &self.config.modules_dir;
        if let Err(e) = tokio::fs::create_dir_all(modules_dir).await {
            tracing::warn!(path = %modules_dir.display(), "cannot create modules root: {e}");
        }
        let modules_root = canonical_or_given(modules_dir).await;
        match watch_path(&modules_root, RecursiveMode::Recursive, tx, WatchSignal::Modules) {
            Ok(watcher) => watches.push(ActiveWatch {
                watcher,
                path: modules_root.clone(),
            }),
            Err(e) => tracing::warn!(
                path = %modules_root.display(),
                "modules watch failed to start, continuing without it: {e}"
            ),
        }

        let roots = WatchRoots {
            manifest_name: manifest_path.file_name().map(|n| n.to_os_string()),
            modules_root,
        };
        (watches, roots)
    }
}

async fn canonical_or_given(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

fn watch_path(
    path: &Path,
    mode: RecursiveMode,
    tx: mpsc::UnboundedSender<WatchSignal>,
    wrap: fn(notify::Result<Event>) -> WatchSignal,
) -> Result<RecommendedWatcher, PluginError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(wrap(res));
    })?;
    watcher.watch(path, mode)?;
    Ok(watcher)
}

/// Drain watcher output until the engine stops.
async fn forward_events(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<WatchSignal>,
    roots: WatchRoots,
) {
    while let Some(signal) = rx.recv().await {
        match signal {
            WatchSignal::Manifest(Ok(event)) => {
                if !touches_file(&event, roots.manifest_name.as_deref()) {
                    continue;
                }
                tracing::debug!(kind = ?event.kind, "manifest changed on disk");
                if let Err(e) = inner.reconcile().await {
                    tracing::warn!("reconciliation after manifest change failed: {e}");
                }
            }
            WatchSignal::Modules(Ok(event)) => {
                let Some(change) = change_kind(&event.kind) else {
                    continue;
                };
                for path in &event.paths {
                    if let Ok(relative) = path.strip_prefix(&roots.modules_root) {
                        inner.publish_module_change(relative, change);
                    }
                }
            }
            WatchSignal::Manifest(Err(e)) | WatchSignal::Modules(Err(e)) => {
                tracing::warn!("file watch error: {e}");
            }
        }
    }
}

fn touches_file(event: &Event, name: Option<&std::ffi::OsStr>) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let Some(name) = name else {
        return false;
    };
    event.paths.iter().any(|p| p.file_name() == Some(name))
}

fn change_kind(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(FileChangeKind::Modified),
        EventKind::Access(_) => None,
    }
}

/// Plugins owning a path relative to the modules root. The first segment is
/// the module slug; dot-prefixed segments (staging directories) are ignored.
fn correlate(table: &PluginTable, relative: &Path, change: FileChangeKind) -> Vec<ModuleChange> {
    let Some(Component::Normal(first)) = relative.components().next() else {
        return Vec::new();
    };
    let slug = first.to_string_lossy();
    if slug.starts_with('.') {
        return Vec::new();
    }

    let display = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let mut owners: Vec<&RuntimePluginRecord> = table
        .records()
        .filter(|r| {
            r.descriptor
                .path
                .as_deref()
                .is_some_and(|p| p.split('/').any(|segment| segment == slug))
        })
        .collect();
    owners.sort_by(|a, b| a.id().cmp(b.id()));

    owners
        .into_iter()
        .map(|r| ModuleChange {
            plugin: r.descriptor.clone(),
            path: display.clone(),
            change,
            timestamp: Utc::now(),
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginKind;

    fn descriptor(id: &str, path: Option<&str>) -> PluginDescriptor {
        PluginDescriptor {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            kind: PluginKind::GeneratedModule,
            path: path.map(str::to_string),
            enabled: true,
            metadata: serde_json::Map::new(),
        }
    }

    fn engine(dir: &Path) -> ReloadEngine {
        let config = EngineConfig::new(dir);
        let store = Arc::new(ManifestStore::new(&config.manifest_path));
        ReloadEngine::new(config, store)
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn names(events: &[EngineEvent]) -> Vec<(&'static str, Option<&str>)> {
        events.iter().map(|e| (e.name(), e.plugin_id())).collect()
    }

    // ── Startup ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_loads_manifest_and_announces() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut disabled = descriptor("off", None);
        disabled.enabled = false;
        engine.store().upsert(descriptor("on", None)).await.unwrap();
        engine.store().upsert(disabled).await.unwrap();

        let mut rx = engine.subscribe();
        engine.start().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            names(&events),
            vec![("plugin-loaded", Some("on")), ("system-started", None)]
        );

        let status = engine.status();
        assert!(status.watching);
        assert_eq!(status.plugin_count, 2);
        assert_eq!(status.plugin("off").unwrap().state, PluginState::Disabled);
        assert!(dir.path().join("generated-modules").is_dir());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.start().await.unwrap();

        let mut rx = engine.subscribe();
        engine.start().await.unwrap();
        assert!(drain(&mut rx).is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_start_survives_corrupt_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugins.json"), "{ not json").unwrap();
        let engine = engine(dir.path());

        engine.start().await.unwrap();
        assert_eq!(engine.status().plugin_count, 0);
        let raw = std::fs::read_to_string(dir.path().join("plugins.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["plugins"], serde_json::json!([]));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_missing_path_degrades_only_that_plugin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("generated-modules/present")).unwrap();
        let engine = engine(dir.path());
        engine
            .store()
            .upsert(descriptor("present", Some("generated-modules/present")))
            .await
            .unwrap();
        engine
            .store()
            .upsert(descriptor("gone", Some("generated-modules/gone")))
            .await
            .unwrap();

        engine.reconcile().await.unwrap();

        let gone = engine.plugin("gone").unwrap();
        assert_eq!(gone.state, PluginState::Error);
        assert!(!gone.enabled);
        assert!(gone.last_error.is_some());
        assert_eq!(engine.plugin("present").unwrap().state, PluginState::Loaded);
        // Not persisted.
        assert!(engine.store().get("gone").await.unwrap().unwrap().enabled);
    }

    // ── Reconciliation ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_reconcile_adds_before_removes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.store().upsert(descriptor("a", None)).await.unwrap();
        engine.reconcile().await.unwrap();

        let mut rx = engine.subscribe();
        let mut doc = engine.store().load().await.unwrap();
        doc.remove("a");
        doc.upsert(descriptor("b", None));
        engine.store().save(&doc).await.unwrap();

        let summary = engine.reconcile().await.unwrap();
        assert_eq!(summary.added, vec!["b"]);
        assert_eq!(summary.removed, vec!["a"]);
        assert!(summary.updated.is_empty());

        let events = drain(&mut rx);
        assert_eq!(
            names(&events),
            vec![("plugin-loaded", Some("b")), ("plugin-removed", Some("a"))]
        );
        assert_eq!(engine.status().plugin_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_detects_updates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.store().upsert(descriptor("a", None)).await.unwrap();
        engine.reconcile().await.unwrap();

        // Nothing changed on disk.
        assert!(engine.reconcile().await.unwrap().is_empty());

        let mut rx = engine.subscribe();
        let mut bumped = descriptor("a", None);
        bumped.version = "1.1.0".into();
        bumped
            .metadata
            .insert("routes".into(), serde_json::json!(["/deals"]));
        engine.store().upsert(bumped).await.unwrap();

        let summary = engine.reconcile().await.unwrap();
        assert_eq!(summary.updated, vec!["a"]);
        let events = drain(&mut rx);
        assert_eq!(names(&events), vec![("plugin-updated", Some("a"))]);
        assert_eq!(engine.plugin("a").unwrap().descriptor.version, "1.1.0");
    }

    // ── Toggle and reload ───────────────────────────────────────────

    #[tokio::test]
    async fn test_toggle_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.store().upsert(descriptor("a", None)).await.unwrap();
        engine.reconcile().await.unwrap();

        let mut rx = engine.subscribe();
        assert_eq!(
            engine.toggle_plugin("a", false).await.unwrap(),
            ToggleOutcome::Changed
        );
        assert_eq!(
            engine.toggle_plugin("a", false).await.unwrap(),
            ToggleOutcome::Unchanged
        );
        assert_eq!(
            engine.toggle_plugin("a", true).await.unwrap(),
            ToggleOutcome::Changed
        );
        assert_eq!(
            engine.toggle_plugin("a", true).await.unwrap(),
            ToggleOutcome::Unchanged
        );

        let events = drain(&mut rx);
        let kinds: Vec<_> = events
            .iter()
            .map(|e| e.reload().unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![ReloadKind::Disabled, ReloadKind::Enabled]);
        assert!(engine.status().plugin("a").unwrap().enabled);
        assert!(engine.store().get("a").await.unwrap().unwrap().enabled);

        // The manifest now matches the table: no spurious update.
        assert!(engine.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_unresolved_plugin_matches_status() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut gone = descriptor("gone", Some("generated-modules/gone"));
        gone.enabled = false;
        engine.store().upsert(gone).await.unwrap();
        engine.reconcile().await.unwrap();

        let mut rx = engine.subscribe();
        assert_eq!(
            engine.toggle_plugin("gone", true).await.unwrap(),
            ToggleOutcome::Changed
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let toggled = events[0].reload().unwrap();
        assert_eq!(toggled.kind, ReloadKind::Enabled);

        let status = engine.status();
        let summary = status.plugin("gone").unwrap();
        assert_eq!(summary.state, PluginState::Error);
        assert!(!summary.enabled);
        assert_eq!(toggled.plugin.enabled, summary.enabled);

        // The manifest keeps the requested flag.
        assert!(engine.store().get("gone").await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_unknown_ids_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut rx = engine.subscribe();

        assert_eq!(
            engine.toggle_plugin("ghost", true).await.unwrap(),
            ToggleOutcome::NotFound
        );
        let err = engine.reload_plugin("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(ref id) if id == "ghost"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_reload_plugin_rereads_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.store().upsert(descriptor("a", None)).await.unwrap();
        engine.reconcile().await.unwrap();

        let mut renamed = descriptor("a", None);
        renamed.name = "Renamed".into();
        engine.store().upsert(renamed).await.unwrap();

        let mut rx = engine.subscribe();
        let record = engine.reload_plugin("a").await.unwrap();
        assert_eq!(record.descriptor.name, "Renamed");

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec![("plugin-reloaded", Some("a"))]);
        assert_eq!(events[0].reload().unwrap().kind, ReloadKind::Updated);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut rx = engine.subscribe();

        engine.stop().await;

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec![("system-stopped", None)]);
        assert!(!engine.status().watching);
        assert!(!dir.path().join("plugins.json").exists());
    }

    #[tokio::test]
    async fn test_stop_releases_watches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.start().await.unwrap();
        assert_eq!(engine.status().watcher_count, 2);

        engine.stop().await;
        let status = engine.status();
        assert!(!status.watching);
        assert_eq!(status.watcher_count, 0);
    }

    // ── Module-change correlation ───────────────────────────────────

    #[test]
    fn test_correlate_by_slug_segment() {
        let loader = DirectoryLoader::new(".");
        let mut table = PluginTable::new();
        table.insert(RuntimePluginRecord::load(
            descriptor("contact-form", Some("generated-modules/contact-form")),
            &loader,
        ));
        table.insert(RuntimePluginRecord::load(
            descriptor("contact-form-1", Some("generated-modules/contact-form-1")),
            &loader,
        ));
        table.insert(RuntimePluginRecord::load(descriptor("static", None), &loader));

        let changes = correlate(
            &table,
            Path::new("contact-form-1/components/Form.tsx"),
            FileChangeKind::Modified,
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].plugin.id, "contact-form-1");
        assert_eq!(changes[0].path, "contact-form-1/components/Form.tsx");
        assert_eq!(changes[0].change, FileChangeKind::Modified);
    }

    #[test]
    fn test_correlate_ignores_staging_and_unknown() {
        let loader = DirectoryLoader::new(".");
        let mut table = PluginTable::new();
        table.insert(RuntimePluginRecord::load(
            descriptor("a", Some("generated-modules/a")),
            &loader,
        ));

        assert!(correlate(&table, Path::new(".staging-a-1f2e/index.ts"), FileChangeKind::Created)
            .is_empty());
        assert!(correlate(&table, Path::new("b/index.ts"), FileChangeKind::Created).is_empty());
        assert!(correlate(&table, Path::new(""), FileChangeKind::Deleted).is_empty());
    }

    #[test]
    fn test_change_kind_mapping() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::File)),
            Some(FileChangeKind::Created)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::Folder)),
            Some(FileChangeKind::Deleted)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Any)),
            Some(FileChangeKind::Modified)
        );
        assert_eq!(change_kind(&EventKind::Access(AccessKind::Any)), None);
    }

    #[test]
    fn test_touches_manifest_by_name() {
        let name = std::ffi::OsStr::new("plugins.json");
        let event = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/srv/crm/plugins.json"));
        assert!(touches_file(&event, Some(name)));

        let temp = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/srv/crm/.tmpA1b2C3"));
        assert!(!touches_file(&temp, Some(name)));
    }
}
