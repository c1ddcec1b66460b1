//! Engine configuration.

use std::path::{Component, Path, PathBuf};

/// Default broadcast capacity for engine events.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default generator identity stamped into module metadata.
pub const DEFAULT_GENERATOR: &str = "crmforge-scaffolder";

/// Locations and limits shared by the manifest store, scaffolder and engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory that relative descriptor paths are resolved against.
    pub base_dir: PathBuf,
    /// Manifest file (absolute, or joined onto `base_dir`).
    pub manifest_path: PathBuf,
    /// Root under which each generated module gets its own `<slug>/` directory.
    pub modules_dir: PathBuf,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Generator identity recorded in module metadata.
    pub generator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

impl EngineConfig {
    /// Config rooted at `base_dir` with the default file layout.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            manifest_path: base_dir.join("plugins.json"),
            modules_dir: base_dir.join("generated-modules"),
            base_dir,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            generator: DEFAULT_GENERATOR.to_string(),
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let base_dir =
            PathBuf::from(std::env::var("CRMFORGE_BASE_DIR").unwrap_or_else(|_| ".".to_string()));
        let manifest_path = std::env::var("CRMFORGE_MANIFEST_PATH")
            .unwrap_or_else(|_| "plugins.json".to_string());
        let modules_dir = std::env::var("CRMFORGE_MODULES_DIR")
            .unwrap_or_else(|_| "generated-modules".to_string());

        Self {
            manifest_path: base_dir.join(manifest_path),
            modules_dir: base_dir.join(modules_dir),
            event_capacity: std::env::var("CRMFORGE_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_EVENT_CAPACITY),
            generator: std::env::var("CRMFORGE_GENERATOR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GENERATOR.to_string()),
            base_dir,
        }
    }

    /// The descriptor `path` for a module slug: the modules dir relative to
    /// `base_dir` when possible, joined with the slug, using `/` separators.
    pub fn module_descriptor_path(&self, slug: &str) -> String {
        let dir = self.modules_dir.join(slug);
        let rel = dir.strip_prefix(&self.base_dir).unwrap_or(&dir);
        to_slash(rel)
    }
}

fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::RootDir => out.push('/'),
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}
