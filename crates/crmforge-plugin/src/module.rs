//! Generated-module data types.
//!
//! These mirror the generation producer's output (`{files, config}`) and the
//! documents the scaffolder writes next to a module's files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::PluginDescriptor;

/// Role of a file inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Component,
    Config,
    Schema,
    Migration,
    Test,
    Style,
}

impl FileType {
    /// Infer a file's role from its path. First match wins:
    /// test markers, migration or `.sql`, schema, `.tsx`/`.jsx`, stylesheets,
    /// and config for everything else.
    pub fn infer(path: &str) -> Self {
        let file_name = file_name(path).to_ascii_lowercase();
        let (stem, ext) = split_extension(&file_name);

        if is_test_path(path) {
            FileType::Test
        } else if file_name.contains("migration") || ext == "sql" {
            FileType::Migration
        } else if stem.contains("schema") {
            FileType::Schema
        } else if matches!(ext, "tsx" | "jsx") {
            FileType::Component
        } else if matches!(ext, "css" | "scss" | "less") {
            FileType::Style
        } else {
            FileType::Config
        }
    }
}

/// `.test`/`.spec` suffixes or infixes (also `_` and `-` separated), a
/// `Test`/`Spec` camel-case suffix, or a `__tests__`/`tests` directory.
/// Words like `ProspectList` or `Contest` do not count.
fn is_test_path(path: &str) -> bool {
    let in_test_dir = path
        .split('/')
        .rev()
        .skip(1)
        .any(|dir| dir.eq_ignore_ascii_case("__tests__") || dir.eq_ignore_ascii_case("tests"));
    if in_test_dir {
        return true;
    }

    let (stem, _) = split_extension(file_name(path));
    let lower = stem.to_ascii_lowercase();
    if lower == "test" || lower == "spec" {
        return true;
    }
    let marked = ["test", "spec"].iter().any(|marker| {
        ['.', '_', '-']
            .iter()
            .any(|sep| lower.ends_with(&format!("{sep}{marker}")))
            || lower.contains(&format!(".{marker}."))
    });
    marked || stem.ends_with("Test") || stem.ends_with("Spec")
}

/// Last `/`-separated segment of a path.
pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `("name", "ext")` for `name.ext`; `("name", "")` without a dot.
pub(crate) fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (file_name, ""),
    }
}

/// A file record as produced by the generator. Missing fields deserialize
/// as empty so that validation, not parsing, reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawModuleFile {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
}

impl RawModuleFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            file_type: None,
        }
    }

    pub fn typed(path: impl Into<String>, content: impl Into<String>, file_type: FileType) -> Self {
        Self {
            file_type: Some(file_type),
            ..Self::new(path, content)
        }
    }
}

/// A finalized file, as written under the module root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFile {
    pub path: String,
    pub content: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub feature_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub integration_points: Vec<String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            feature_type: String::new(),
            description: String::new(),
            version: default_version(),
            dependencies: Vec::new(),
            routes: Vec::new(),
            integration_points: Vec::new(),
        }
    }
}

/// Input of [`crate::scaffold::ModuleScaffolder::create_module`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulePayload {
    pub config: ModuleConfig,
    #[serde(default)]
    pub files: Vec<RawModuleFile>,
    /// Opaque extra metadata merged into the plugin descriptor.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Created,
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    pub created_at: DateTime<Utc>,
    pub generated_by: String,
    pub status: ModuleStatus,
}

/// The scaffolder's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedModule {
    pub id: Uuid,
    pub config: ModuleConfig,
    pub files: Vec<ModuleFile>,
    pub descriptor: PluginDescriptor,
    pub metadata: ModuleMetadata,
}

impl GeneratedModule {
    pub fn file(&self, path: &str) -> Option<&ModuleFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn files_of_type(&self, file_type: FileType) -> impl Iterator<Item = &ModuleFile> {
        self.files.iter().filter(move |f| f.file_type == file_type)
    }
}

/// One entry of the file index kept in `module.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileIndexEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
}

/// The `module.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModuleRecord {
    pub id: Uuid,
    pub config: ModuleConfig,
    pub status: ModuleStatus,
    pub created_at: DateTime<Utc>,
    pub generated_by: String,
    pub files: Vec<FileIndexEntry>,
}

impl ModuleRecord {
    pub fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            created_at: self.created_at,
            generated_by: self.generated_by.clone(),
            status: self.status,
        }
    }
}
