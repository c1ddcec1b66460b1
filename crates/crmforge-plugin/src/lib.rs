//! crmforge plugin registry and hot-reload engine
//!
//! Generated CRM UI modules are scaffolded into per-module directories,
//! registered in a JSON manifest, and kept live by a reload engine that
//! watches the manifest and the module tree. Consumers react to changes
//! through a broadcast stream of engine events.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod registry;
pub mod scaffold;

pub use config::EngineConfig;
pub use engine::{ReconcileSummary, ReloadEngine, ToggleOutcome};
pub use error::PluginError;
pub use events::{
    EngineEvent, EventBus, FileChangeKind, ModuleChange, ReloadEvent, ReloadKind, SystemEvent,
    EVENT_NAMES,
};
pub use loader::{DirectoryLoader, LoadError, Loadable, PluginHandle};
pub use manifest::{ManifestDocument, ManifestStore, PluginDescriptor, PluginKind};
pub use module::{
    FileType, GeneratedModule, ModuleConfig, ModuleFile, ModuleMetadata, ModulePayload,
    ModuleStatus, RawModuleFile,
};
pub use registry::{EngineStatus, PluginState, PluginSummary, PluginTable, RuntimePluginRecord};
pub use scaffold::ModuleScaffolder;
