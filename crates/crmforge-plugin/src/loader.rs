//! Resolution of plugin descriptors into loadable handles.
//!
//! The registry never imports plugin code itself; it asks a [`Loadable`]
//! implementation to resolve a descriptor. [`DirectoryLoader`] only checks
//! that the module directory exists and locates its entry point. Static
//! linking, dynamic libraries or subprocess isolation can slot in behind the
//! same trait.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::manifest::PluginDescriptor;

/// Entry-point file names, in lookup order.
pub const ENTRY_POINT_NAMES: &[&str] = &["index.ts", "index.tsx", "index.js", "index.jsx"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("module directory does not exist: {0}")]
    MissingDirectory(String),

    #[error("module path is not a directory: {0}")]
    NotADirectory(String),

    #[error("loader rejected plugin: {0}")]
    Rejected(String),
}

/// What a successful resolution yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginHandle {
    /// Absolute module root, `None` for plugins without a path.
    pub root: Option<PathBuf>,
    /// Entry-point file inside `root`, if one exists.
    pub entry: Option<PathBuf>,
}

/// Capability to turn a descriptor into something runnable.
pub trait Loadable: Send + Sync {
    fn resolve(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, LoadError>;
}

/// Resolves descriptor paths against a base directory.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    base_dir: PathBuf,
}

impl DirectoryLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Loadable for DirectoryLoader {
    fn resolve(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, LoadError> {
        let Some(rel) = descriptor.path.as_deref() else {
            return Ok(PluginHandle {
                root: None,
                entry: None,
            });
        };

        let root = self.base_dir.join(rel);
        let meta = std::fs::metadata(&root)
            .map_err(|_| LoadError::MissingDirectory(rel.to_string()))?;
        if !meta.is_dir() {
            return Err(LoadError::NotADirectory(rel.to_string()));
        }

        let entry = ENTRY_POINT_NAMES
            .iter()
            .map(|name| root.join(name))
            .find(|candidate| candidate.is_file());

        Ok(PluginHandle {
            root: Some(root),
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginKind;

    fn descriptor(path: Option<&str>) -> PluginDescriptor {
        PluginDescriptor {
            id: "p".into(),
            name: "P".into(),
            version: "1.0.0".into(),
            kind: PluginKind::GeneratedModule,
            path: path.map(str::to_string),
            enabled: true,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_resolve_existing_directory_with_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mods/p")).unwrap();
        std::fs::write(dir.path().join("mods/p/index.ts"), "export {};").unwrap();

        let loader = DirectoryLoader::new(dir.path());
        let handle = loader.resolve(&descriptor(Some("mods/p"))).unwrap();
        assert_eq!(handle.root, Some(dir.path().join("mods/p")));
        assert_eq!(handle.entry, Some(dir.path().join("mods/p/index.ts")));
    }

    #[test]
    fn test_resolve_directory_without_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mods/p")).unwrap();

        let handle = DirectoryLoader::new(dir.path())
            .resolve(&descriptor(Some("mods/p")))
            .unwrap();
        assert!(handle.entry.is_none());
    }

    #[test]
    fn test_resolve_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryLoader::new(dir.path())
            .resolve(&descriptor(Some("mods/gone")))
            .unwrap_err();
        assert_eq!(err, LoadError::MissingDirectory("mods/gone".into()));
    }

    #[test]
    fn test_resolve_file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "x").unwrap();
        let err = DirectoryLoader::new(dir.path())
            .resolve(&descriptor(Some("file")))
            .unwrap_err();
        assert!(matches!(err, LoadError::NotADirectory(_)));
    }

    #[test]
    fn test_resolve_without_path() {
        let handle = DirectoryLoader::new("/nonexistent")
            .resolve(&descriptor(None))
            .unwrap();
        assert!(handle.root.is_none());
    }
}
