//! Engine event names, payloads and the broadcast bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::manifest::PluginDescriptor;

/// Every event name the engine emits.
pub const EVENT_NAMES: &[&str] = &[
    "plugin-loaded",
    "plugin-updated",
    "plugin-removed",
    "plugin-toggled",
    "plugin-reloaded",
    "module-changed",
    "system-started",
    "system-stopped",
];

/// What happened to a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadKind {
    Added,
    Updated,
    Removed,
    Enabled,
    Disabled,
}

/// One detected plugin transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadEvent {
    pub kind: ReloadKind,
    /// The affected descriptor; its last-known value for `Removed`.
    pub plugin: PluginDescriptor,
    pub timestamp: DateTime<Utc>,
}

impl ReloadEvent {
    pub fn new(kind: ReloadKind, plugin: PluginDescriptor) -> Self {
        Self {
            kind,
            plugin,
            timestamp: Utc::now(),
        }
    }
}

/// How a file under the generated-modules root changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A file change correlated with a loaded plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleChange {
    pub plugin: PluginDescriptor,
    /// Changed path, relative to the generated-modules root.
    pub path: String,
    pub change: FileChangeKind,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `system-started` / `system-stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub plugin_count: usize,
    pub watcher_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Everything the engine publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
    PluginLoaded(ReloadEvent),
    PluginUpdated(ReloadEvent),
    PluginRemoved(ReloadEvent),
    PluginToggled(ReloadEvent),
    PluginReloaded(ReloadEvent),
    ModuleChanged(ModuleChange),
    SystemStarted(SystemEvent),
    SystemStopped(SystemEvent),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PluginLoaded(_) => "plugin-loaded",
            EngineEvent::PluginUpdated(_) => "plugin-updated",
            EngineEvent::PluginRemoved(_) => "plugin-removed",
            EngineEvent::PluginToggled(_) => "plugin-toggled",
            EngineEvent::PluginReloaded(_) => "plugin-reloaded",
            EngineEvent::ModuleChanged(_) => "module-changed",
            EngineEvent::SystemStarted(_) => "system-started",
            EngineEvent::SystemStopped(_) => "system-stopped",
        }
    }

    /// The reload payload, for plugin lifecycle events.
    pub fn reload(&self) -> Option<&ReloadEvent> {
        match self {
            EngineEvent::PluginLoaded(e)
            | EngineEvent::PluginUpdated(e)
            | EngineEvent::PluginRemoved(e)
            | EngineEvent::PluginToggled(e)
            | EngineEvent::PluginReloaded(e) => Some(e),
            _ => None,
        }
    }

    /// Id of the plugin the event concerns, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ModuleChanged(c) => Some(c.plugin.id.as_str()),
            other => other.reload().map(|e| e.plugin.id.as_str()),
        }
    }
}

/// Fan-out of engine events to any number of subscribers.
///
/// Publishing never fails: with no subscribers the event is dropped, and a
/// subscriber that falls more than `capacity` events behind loses the
/// oldest ones.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::debug!(
            event = event.name(),
            plugin_id = event.plugin_id().unwrap_or("-"),
            "publishing engine event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
