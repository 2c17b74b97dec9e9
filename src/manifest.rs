use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capability::{BindingCatalog, CapabilitySettings, CommandRuntime, CommandSet};
use crate::config::Settings;
use crate::domain::{DependencyGraph, HealthCheckSpec, ProbeKind, Project, SchemaSettings, ServiceSpec};

pub const DEFAULT_MANIFEST: &str = "lychee.toml";

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    project: ProjectSection,
    #[serde(default)]
    schemas: SchemaSettings,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    capabilities: CapabilitySettings,
    #[serde(default)]
    plugins: Vec<PluginBinding>,
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectSection {
    #[serde(default)]
    languages: Vec<String>,
}

/// External binding declared in the manifest, backed by a command runtime
#[derive(Debug, Clone, Deserialize)]
pub struct PluginBinding {
    pub name: String,
    pub kind: String,
    #[serde(flatten)]
    pub commands: CommandSet,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
    kind: String,
    path: PathBuf,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    depends_on_schemas: Vec<String>,
    #[serde(default)]
    schemas_mount_dir: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    health_check: Option<HealthCheckEntry>,
}

/// Timings left out fall back to the settings' defaults
#[derive(Debug, Deserialize)]
struct HealthCheckEntry {
    probe: ProbeKind,
    target: String,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl HealthCheckEntry {
    fn resolve(self, settings: &Settings) -> HealthCheckSpec {
        HealthCheckSpec::new(self.probe, self.target).with_timing(
            self.interval_ms.unwrap_or(settings.health_interval_ms),
            self.timeout_ms.unwrap_or(settings.health_timeout_ms),
            self.max_attempts.unwrap_or(settings.health_max_attempts),
        )
    }
}

/// A validated project ready to orchestrate
#[derive(Debug)]
pub struct Manifest {
    pub project: Arc<Project>,
    pub graph: DependencyGraph,
    pub capabilities: CapabilitySettings,
    pub plugins: Vec<PluginBinding>,
}

impl Manifest {
    /// Catalog of the manifest's plugin bindings, for the capability registry
    pub fn catalog(&self) -> BindingCatalog {
        self.plugins.iter().fold(BindingCatalog::new(), |catalog, plugin| {
            catalog.register_runtime(
                plugin.name.clone(),
                Arc::new(CommandRuntime::bound(plugin.kind.clone(), plugin.commands.clone())),
            )
        })
    }
}

pub fn load_manifest(path: &Path, settings: &Settings) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let root = std::fs::canonicalize(&dir).unwrap_or(dir);

    let manifest = parse_manifest(&content, &root, settings)
        .with_context(|| format!("Invalid manifest: {}", path.display()))?;
    log::info!(
        "Loaded {} services from {}",
        manifest.project.len(),
        path.display()
    );
    Ok(manifest)
}

/// Parse manifest text; relative service paths resolve against `root`
pub fn parse_manifest(content: &str, root: &Path, settings: &Settings) -> Result<Manifest> {
    let file: ManifestFile = toml::from_str(content).context("Failed to parse manifest")?;

    let mut project = Project::new(root);
    project.languages = file.project.languages;
    project.schemas = file.schemas;
    project.environment = file.environment;

    for entry in file.services {
        let path = if entry.path.is_absolute() {
            entry.path
        } else {
            root.join(entry.path)
        };
        let mut spec = ServiceSpec::new(entry.name, path, entry.kind)
            .with_config(entry.config)
            .depends_on(entry.depends_on)
            .with_schemas(entry.depends_on_schemas, entry.schemas_mount_dir.as_deref());
        spec.environment = entry.environment;
        spec.health_check = entry.health_check.map(|h| h.resolve(settings));
        project.add_service(spec)?;
    }

    let graph = project.validate()?;
    log::debug!("Start order: {:?}", graph.start_order());

    Ok(Manifest {
        project: Arc::new(project),
        graph,
        capabilities: file.capabilities,
        plugins: file.plugins,
    })
}
