//! Module scaffolder — turns a generation payload into a module directory.
//!
//! `create_module` runs the complete flow:
//! 1. Validate the config and every file record (nothing is written on failure)
//! 2. Normalize paths, infer missing file types, prepend provenance headers
//! 3. Inject the entry point, `package.json` and `README.md` when absent
//! 4. Derive the plugin descriptor and synthesize `plugin.json`
//! 5. Write everything into a staging directory, then swap it into place
//! 6. Register the descriptor in the manifest

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::loader::ENTRY_POINT_NAMES;
use crate::manifest::{
    persist_json, validate_path_safety, ManifestDocument, ManifestStore, PluginDescriptor,
    PluginKind,
};
use crate::module::{
    file_name, split_extension, FileIndexEntry, FileType, GeneratedModule, ModuleConfig,
    ModuleFile, ModulePayload, ModuleRecord, ModuleStatus, RawModuleFile,
};

// ─── Constants ──────────────────────────────────────────────────────────

/// Synthesized plugin descriptor, one per module.
pub const PLUGIN_MANIFEST_FILE: &str = "plugin.json";

/// Module metadata document (id, config, status, file index).
pub const MODULE_METADATA_FILE: &str = "module.json";

pub const PACKAGE_FILE: &str = "package.json";

pub const README_FILE: &str = "README.md";

const DEFAULT_ENTRY_POINT: &str = "index.ts";

/// Prefix of in-progress module directories under the modules root.
pub const STAGING_PREFIX: &str = ".staging-";

const HEADER_MARKER: &str = "Generated module:";

/// Peer dependencies every generated UI module declares.
const PEER_DEPENDENCIES: &[(&str, &str)] = &[("react", "^18.0.0"), ("react-dom", "^18.0.0")];

// ─── Validation helpers ─────────────────────────────────────────────────

/// Validate a module slug against `^[a-z0-9][a-z0-9-]{0,63}$`.
pub fn validate_slug(slug: &str) -> Result<(), PluginError> {
    let len = slug.len();
    if !(1..=64).contains(&len) {
        return Err(PluginError::InvalidSlug(format!(
            "slug must be 1-64 characters, got {len}"
        )));
    }

    let mut chars = slug.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(PluginError::InvalidSlug(format!(
                "slug must start with a lowercase letter or digit, got '{first}'"
            )));
        }
    }
    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(PluginError::InvalidSlug(format!(
                "slug contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn validate_config(config: &ModuleConfig) -> Result<(), PluginError> {
    if config.name.trim().is_empty() {
        return Err(PluginError::InvalidModuleConfig(
            "module name must not be empty".into(),
        ));
    }
    validate_slug(&config.slug)?;
    if config.version.trim().is_empty() {
        return Err(PluginError::InvalidModuleConfig(
            "module version must not be empty".into(),
        ));
    }
    Ok(())
}

/// `a\b//./c` → `a/b/c`.
fn normalize_path(raw: &str) -> String {
    raw.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate and normalize the producer's file records.
fn normalize_files(files: &[RawModuleFile]) -> Result<Vec<ModuleFile>, PluginError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(files.len());

    for (index, file) in files.iter().enumerate() {
        let malformed = move |reason: String| PluginError::MalformedFilePayload { index, reason };

        let unified = file.path.trim().replace('\\', "/");
        if unified.is_empty() {
            return Err(malformed("file path is empty".into()));
        }
        if file.content.is_empty() {
            return Err(malformed(format!("file '{unified}' has empty content")));
        }
        validate_path_safety(&unified).map_err(malformed)?;

        let path = normalize_path(&unified);
        if path.is_empty() {
            return Err(malformed(format!("file path '{unified}' names no file")));
        }
        if path == MODULE_METADATA_FILE {
            return Err(malformed(format!("'{MODULE_METADATA_FILE}' is reserved")));
        }
        if !seen.insert(path.clone()) {
            return Err(malformed(format!("duplicate file path '{path}'")));
        }

        let file_type = file.file_type.unwrap_or_else(|| FileType::infer(&path));
        out.push(ModuleFile {
            path,
            content: file.content.clone(),
            file_type,
        });
    }

    Ok(out)
}

// ─── Synthesized content ────────────────────────────────────────────────

fn feature_label(config: &ModuleConfig) -> &str {
    match config.feature_type.trim() {
        "" => "general",
        other => other,
    }
}

fn provenance_header(path: &str, config: &ModuleConfig, generated_at: &str) -> Option<String> {
    let (_, ext) = split_extension(file_name(path));
    let lines = [
        format!("{HEADER_MARKER} {}", config.name),
        format!("Feature type: {}", feature_label(config)),
        format!("Generated at: {generated_at}"),
    ];
    match ext.to_ascii_lowercase().as_str() {
        "ts" | "tsx" | "js" | "jsx" | "css" | "scss" | "less" => Some(format!(
            "/**\n * {}\n * {}\n * {}\n */\n\n",
            lines[0], lines[1], lines[2]
        )),
        "sql" => Some(format!(
            "-- {}\n-- {}\n-- {}\n\n",
            lines[0], lines[1], lines[2]
        )),
        _ => None,
    }
}

/// Prepend the provenance header to source-like files, once.
fn annotate(file: ModuleFile, config: &ModuleConfig, generated_at: &str) -> ModuleFile {
    let already = file
        .content
        .lines()
        .take(3)
        .any(|line| line.contains(HEADER_MARKER));
    match provenance_header(&file.path, config, generated_at) {
        Some(header) if !already => ModuleFile {
            content: format!("{header}{}", file.content),
            ..file
        },
        _ => file,
    }
}

fn pretty_json(value: &Value) -> Result<String, PluginError> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}

/// `components/contact-form.tsx` → `ContactForm`.
fn export_name_for(path: &str) -> String {
    let (stem, _) = split_extension(file_name(path));
    let mut name: String = stem
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "Component");
    }
    name
}

fn strip_source_extension(path: &str) -> &str {
    for ext in [".tsx", ".jsx", ".ts", ".js"] {
        if let Some(stripped) = path.strip_suffix(ext) {
            return stripped;
        }
    }
    path
}

/// Entry point: re-exports every component and a `moduleMetadata` record.
fn entry_point_source(config: &ModuleConfig, files: &[ModuleFile]) -> Result<String, PluginError> {
    let mut out = String::new();
    let mut used = HashSet::new();

    for file in files.iter().filter(|f| f.file_type == FileType::Component) {
        let base = export_name_for(&file.path);
        let mut export_name = base.clone();
        let mut n = 2;
        while !used.insert(export_name.clone()) {
            export_name = format!("{base}{n}");
            n += 1;
        }
        out.push_str(&format!(
            "export {{ default as {export_name} }} from './{}';\n",
            strip_source_extension(&file.path)
        ));
    }
    if !out.is_empty() {
        out.push('\n');
    }

    let metadata = json!({
        "name": config.name,
        "slug": config.slug,
        "version": config.version,
        "featureType": config.feature_type,
        "description": config.description,
    });
    let literal = serde_json::to_string_pretty(&metadata)?;
    out.push_str(&format!(
        "export const moduleMetadata = {literal} as const;\n\nexport default moduleMetadata;\n"
    ));
    Ok(out)
}

/// Split `name@requirement`; scoped names keep their leading `@`.
/// Requirements that do not parse as semver fall back to `latest`.
fn parse_dependency(spec: &str) -> (String, String) {
    let spec = spec.trim();
    match spec.rfind('@').filter(|&i| i > 0) {
        Some(i) => {
            let (name, requirement) = (&spec[..i], &spec[i + 1..]);
            if semver::VersionReq::parse(requirement).is_ok() {
                (name.to_string(), requirement.to_string())
            } else {
                tracing::warn!(
                    dependency = %name,
                    requirement = %requirement,
                    "dependency requirement is not valid semver, using latest"
                );
                (name.to_string(), "latest".to_string())
            }
        }
        None => (spec.to_string(), "latest".to_string()),
    }
}

fn package_manifest(config: &ModuleConfig, entry: &str) -> Result<String, PluginError> {
    let mut dependencies = serde_json::Map::new();
    for spec in config.dependencies.iter().filter(|d| !d.trim().is_empty()) {
        let (name, requirement) = parse_dependency(spec);
        dependencies.insert(name, Value::String(requirement));
    }
    let peers: serde_json::Map<String, Value> = PEER_DEPENDENCIES
        .iter()
        .map(|(name, req)| (name.to_string(), Value::String(req.to_string())))
        .collect();

    pretty_json(&json!({
        "name": format!("@crm-modules/{}", config.slug),
        "version": config.version,
        "private": true,
        "description": config.description,
        "main": entry,
        "dependencies": dependencies,
        "peerDependencies": peers,
    }))
}

fn readme(config: &ModuleConfig, generated_at: &str) -> String {
    let mut out = format!("# {}\n\n", config.name);
    if !config.description.trim().is_empty() {
        out.push_str(config.description.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "- Slug: `{}`\n- Version: {}\n- Feature type: {}\n- Generated at: {generated_at}\n",
        config.slug,
        config.version,
        feature_label(config)
    ));

    for (title, items) in [
        ("Routes", &config.routes),
        ("Integration points", &config.integration_points),
        ("Dependencies", &config.dependencies),
    ] {
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {title}\n\n"));
        for item in items {
            out.push_str(&format!("- `{item}`\n"));
        }
    }
    out
}

fn is_named(file: &ModuleFile, names: &[&str]) -> bool {
    let name = file_name(&file.path);
    names.iter().any(|n| name.eq_ignore_ascii_case(n))
}

fn has_file_named(files: &[ModuleFile], names: &[&str]) -> bool {
    files.iter().any(|f| is_named(f, names))
}

fn entry_path(files: &[ModuleFile]) -> String {
    files
        .iter()
        .find(|f| is_named(f, ENTRY_POINT_NAMES))
        .map(|f| f.path.clone())
        .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string())
}

fn plugin_manifest_file(
    descriptor: &PluginDescriptor,
    config: &ModuleConfig,
    entry: &str,
) -> Result<ModuleFile, PluginError> {
    let mut doc = serde_json::to_value(descriptor)?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("entry".into(), json!(entry));
        obj.insert("routes".into(), json!(config.routes));
        obj.insert("integrationPoints".into(), json!(config.integration_points));
    }
    Ok(ModuleFile {
        path: PLUGIN_MANIFEST_FILE.to_string(),
        content: pretty_json(&doc)?,
        file_type: FileType::Config,
    })
}

// ─── Disk helpers ───────────────────────────────────────────────────────

async fn write_tree(root: &Path, files: &[ModuleFile], record: &ModuleRecord) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root).await?;
    for file in files {
        let dest = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, file.content.as_bytes()).await?;
    }
    let mut metadata = serde_json::to_vec_pretty(record)?;
    metadata.push(b'\n');
    tokio::fs::write(root.join(MODULE_METADATA_FILE), metadata).await
}

async fn read_record(dir: &Path) -> Result<Option<ModuleRecord>, PluginError> {
    let path = dir.join(MODULE_METADATA_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable module metadata, skipping module: {e}");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ─── Scaffolder ─────────────────────────────────────────────────────────

/// Creates, lists, toggles and deletes generated modules.
pub struct ModuleScaffolder {
    config: EngineConfig,
    store: Arc<ManifestStore>,
}

impl ModuleScaffolder {
    pub fn new(config: EngineConfig, store: Arc<ManifestStore>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    pub fn modules_dir(&self) -> &Path {
        &self.config.modules_dir
    }

    pub fn module_dir(&self, slug: &str) -> PathBuf {
        self.config.modules_dir.join(slug)
    }

    /// Build, write and register a module.
    ///
    /// Re-creating an existing slug replaces its directory and its manifest
    /// entry.
    pub async fn create_module(&self, payload: ModulePayload) -> Result<GeneratedModule, PluginError> {
        validate_config(&payload.config)?;
        let supplied = normalize_files(&payload.files)?;

        let config = payload.config.clone();
        let slug = config.slug.clone();
        let now = Utc::now();
        let generated_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let module_id = Uuid::new_v4();

        tracing::info!(slug = %slug, files = supplied.len(), "scaffolding module");

        let mut files = self.assemble_files(&config, supplied, &generated_at)?;
        let descriptor = self.derive_descriptor(&payload, module_id, &generated_at);
        let entry = entry_path(&files);
        files.push(plugin_manifest_file(&descriptor, &config, &entry)?);

        let mut record = ModuleRecord {
            id: module_id,
            config: config.clone(),
            status: ModuleStatus::Created,
            created_at: now,
            generated_by: self.config.generator.clone(),
            files: files
                .iter()
                .map(|f| FileIndexEntry {
                    path: f.path.clone(),
                    file_type: f.file_type,
                })
                .collect(),
        };

        let module_dir = self.materialize(&slug, &files, &record).await?;
        let metadata_path = module_dir.join(MODULE_METADATA_FILE);

        if let Err(e) = self.store.replace_module(descriptor.clone()).await {
            tracing::error!(slug = %slug, "module written but manifest registration failed: {e}");
            record.status = ModuleStatus::Error;
            if let Err(write_err) = persist_json(&metadata_path, &record).await {
                tracing::warn!(slug = %slug, "failed to record error status: {write_err}");
            }
            return Err(e);
        }

        record.status = ModuleStatus::Active;
        persist_json(&metadata_path, &record).await?;

        tracing::info!(
            slug = %slug,
            module_id = %module_id,
            files = files.len(),
            "module created and registered"
        );

        Ok(GeneratedModule {
            id: module_id,
            config,
            files,
            descriptor,
            metadata: record.metadata(),
        })
    }

    /// Every readable module under the modules root, sorted by slug.
    pub async fn list_modules(&self) -> Result<Vec<GeneratedModule>, PluginError> {
        let mut entries = match tokio::fs::read_dir(&self.config.modules_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let manifest = self.store.load().await?;

        let mut modules = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(module) = self.load_module(&name, &manifest).await? {
                modules.push(module);
            }
        }

        modules.sort_by(|a, b| a.config.slug.cmp(&b.config.slug));
        Ok(modules)
    }

    pub async fn get_module(&self, slug: &str) -> Result<Option<GeneratedModule>, PluginError> {
        if validate_slug(slug).is_err() {
            return Ok(None);
        }
        let manifest = self.store.load().await?;
        self.load_module(slug, &manifest).await
    }

    /// Remove the module directory, then its manifest entry.
    /// Returns `false` when the directory did not exist.
    pub async fn delete_module(&self, slug: &str) -> Result<bool, PluginError> {
        if validate_slug(slug).is_err() {
            return Ok(false);
        }
        let dir = self.module_dir(slug);
        let existed = tokio::fs::try_exists(&dir).await?;
        if existed {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        let unregistered = self.store.remove(slug).await?;

        if existed || unregistered {
            tracing::info!(slug = %slug, existed, unregistered, "module deleted");
        }
        Ok(existed)
    }

    /// Flip the module's manifest flag and lifecycle status.
    /// Returns `false` when the manifest has no entry for `slug`.
    pub async fn toggle_module_status(&self, slug: &str, enabled: bool) -> Result<bool, PluginError> {
        if !self.store.set_enabled(slug, enabled).await? {
            return Ok(false);
        }

        let dir = self.module_dir(slug);
        if let Some(mut record) = read_record(&dir).await? {
            let status = if enabled {
                ModuleStatus::Active
            } else {
                ModuleStatus::Inactive
            };
            if record.status != status {
                record.status = status;
                persist_json(&dir.join(MODULE_METADATA_FILE), &record).await?;
            }
        }

        tracing::info!(slug = %slug, enabled, "module status toggled");
        Ok(true)
    }

    fn assemble_files(
        &self,
        config: &ModuleConfig,
        supplied: Vec<ModuleFile>,
        generated_at: &str,
    ) -> Result<Vec<ModuleFile>, PluginError> {
        let mut files: Vec<ModuleFile> = supplied
            .into_iter()
            .filter(|f| {
                if f.path == PLUGIN_MANIFEST_FILE {
                    tracing::warn!(slug = %config.slug, "ignoring supplied plugin.json, it is synthesized");
                    return false;
                }
                true
            })
            .map(|f| annotate(f, config, generated_at))
            .collect();

        if !has_file_named(&files, ENTRY_POINT_NAMES) {
            let content = entry_point_source(config, &files)?;
            let entry = ModuleFile {
                path: DEFAULT_ENTRY_POINT.to_string(),
                content,
                file_type: FileType::infer(DEFAULT_ENTRY_POINT),
            };
            files.push(annotate(entry, config, generated_at));
        }

        if !has_file_named(&files, &[PACKAGE_FILE]) {
            let entry = entry_path(&files);
            files.push(ModuleFile {
                path: PACKAGE_FILE.to_string(),
                content: package_manifest(config, &entry)?,
                file_type: FileType::Config,
            });
        }

        if !has_file_named(&files, &[README_FILE]) {
            files.push(ModuleFile {
                path: README_FILE.to_string(),
                content: readme(config, generated_at),
                file_type: FileType::Config,
            });
        }

        Ok(files)
    }

    fn derive_descriptor(
        &self,
        payload: &ModulePayload,
        module_id: Uuid,
        generated_at: &str,
    ) -> PluginDescriptor {
        let config = &payload.config;
        let mut metadata = payload.metadata.clone();
        let derived = [
            ("slug", json!(config.slug)),
            ("featureType", json!(config.feature_type)),
            ("description", json!(config.description)),
            ("routes", json!(config.routes)),
            ("integrationPoints", json!(config.integration_points)),
            ("dependencies", json!(config.dependencies)),
            ("generatedBy", json!(self.config.generator)),
            ("generatedAt", json!(generated_at)),
            ("moduleId", json!(module_id.to_string())),
        ];
        for (key, value) in derived {
            metadata.insert(key.to_string(), value);
        }

        PluginDescriptor {
            id: config.slug.clone(),
            name: config.name.clone(),
            version: config.version.clone(),
            kind: PluginKind::GeneratedModule,
            path: Some(self.config.module_descriptor_path(&config.slug)),
            enabled: true,
            metadata,
        }
    }

    /// Write into a staging directory and swap it over the module directory.
    async fn materialize(
        &self,
        slug: &str,
        files: &[ModuleFile],
        record: &ModuleRecord,
    ) -> Result<PathBuf, PluginError> {
        let target = self.module_dir(slug);
        let staging = self.config.modules_dir.join(format!(
            "{STAGING_PREFIX}{slug}-{}",
            Uuid::new_v4().simple()
        ));

        let result: std::io::Result<()> = async {
            write_tree(&staging, files, record).await?;
            if tokio::fs::try_exists(&target).await? {
                tracing::debug!(slug = %slug, "replacing previous module files");
                tokio::fs::remove_dir_all(&target).await?;
            }
            tokio::fs::rename(&staging, &target).await
        }
        .await;

        if let Err(source) = result {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                tracing::debug!(slug = %slug, "staging cleanup skipped: {cleanup}");
            }
            return Err(PluginError::ScaffoldWriteFailed {
                slug: slug.to_string(),
                source,
            });
        }
        Ok(target)
    }

    async fn load_module(
        &self,
        slug: &str,
        manifest: &ManifestDocument,
    ) -> Result<Option<GeneratedModule>, PluginError> {
        let dir = self.module_dir(slug);
        let Some(record) = read_record(&dir).await? else {
            return Ok(None);
        };

        let mut files = Vec::with_capacity(record.files.len());
        for entry in &record.files {
            if let Err(reason) = validate_path_safety(&entry.path) {
                tracing::warn!(slug = %slug, "skipping file index entry: {reason}");
                continue;
            }
            match tokio::fs::read_to_string(dir.join(&entry.path)).await {
                Ok(content) => files.push(ModuleFile {
                    path: entry.path.clone(),
                    content,
                    file_type: entry.file_type,
                }),
                Err(e) => tracing::warn!(
                    slug = %slug,
                    path = %entry.path,
                    "module file listed in metadata could not be read: {e}"
                ),
            }
        }

        let descriptor = match manifest.get(slug) {
            Some(d) => d.clone(),
            None => {
                let from_disk = files
                    .iter()
                    .find(|f| f.path == PLUGIN_MANIFEST_FILE)
                    .and_then(|f| serde_json::from_str::<PluginDescriptor>(&f.content).ok());
                match from_disk {
                    Some(d) => d,
                    None => {
                        tracing::warn!(slug = %slug, "module has no manifest entry and no readable plugin.json");
                        return Ok(None);
                    }
                }
            }
        };

        Ok(Some(GeneratedModule {
            id: record.id,
            metadata: record.metadata(),
            config: record.config,
            files,
            descriptor,
        }))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
