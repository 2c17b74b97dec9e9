use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capability::quicktype::{resource_name, SCHEMA_SUFFIX};
use crate::capability::CapabilityRegistry;
use crate::domain::{Project, ServiceSpec};

/// Recompiles a shared schema resource and makes the output visible to services
#[async_trait]
pub trait SchemaPipeline: Send + Sync {
    async fn regenerate(&self, resource: &str) -> Result<()>;
}

/// Compiles through the registry's compilers, then symlinks
/// `<output>/<language>` into every service that declares a mount directory.
pub struct DefaultSchemaPipeline {
    project: Arc<Project>,
    registry: Arc<CapabilityRegistry>,
}

impl DefaultSchemaPipeline {
    pub fn new(project: Arc<Project>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { project, registry }
    }

    pub fn schema_path(&self, resource: &str) -> PathBuf {
        self.project
            .schema_dir()
            .join(format!("{resource}{SCHEMA_SUFFIX}"))
    }

    /// Resources currently present in the schema directory, sorted by name
    pub async fn resources(&self) -> Result<Vec<String>> {
        let dir = self.project.schema_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };

        let mut resources = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = resource_name(&entry.path()) {
                resources.push(name);
            }
        }
        resources.sort();
        Ok(resources)
    }

    /// Compile every resource and refresh every mount; used before the first start
    pub async fn regenerate_all(&self) -> Result<Vec<String>> {
        let resources = self.resources().await?;
        for resource in &resources {
            self.compile(resource).await?;
        }
        self.mount_all().await?;
        Ok(resources)
    }

    async fn compile(&self, resource: &str) -> Result<Vec<PathBuf>> {
        let schema = self.schema_path(resource);
        if !schema.exists() {
            bail!("schema resource '{}' not found at {}", resource, schema.display());
        }

        let format = &self.project.schemas.format;
        let mut generated = Vec::new();
        for language in &self.project.languages {
            let Some(compiler) = self.registry.resolve_compiler(format, language) else {
                warn!("No {} compiler for language '{}'; skipping '{}'", format, language, resource);
                continue;
            };

            let output_dir = self.project.output_dir().join(language);
            let output = compiler
                .compile(&schema, &output_dir, self.project.root(), language)
                .await
                .with_context(|| format!("{} failed to compile '{}' for {}", compiler.name(), resource, language))?;
            debug!("Generated {}", output.display());
            generated.push(output);
        }
        Ok(generated)
    }

    pub async fn mount_all(&self) -> Result<()> {
        for spec in self.project.services() {
            self.mount(spec).await?;
        }
        Ok(())
    }

    async fn mount(&self, spec: &ServiceSpec) -> Result<()> {
        let Some(mount_dir) = &spec.schemas_mount_dir else {
            return Ok(());
        };
        if !self.project.languages.iter().any(|l| l == &spec.kind) {
            debug!(
                "Service '{}' ({}) has no generated output to mount",
                spec.name, spec.kind
            );
            return Ok(());
        }

        let target = self.project.output_dir().join(&spec.kind);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create {}", target.display()))?;
        link(&target, &spec.path.join(mount_dir)).await
    }
}

#[async_trait]
impl SchemaPipeline for DefaultSchemaPipeline {
    async fn regenerate(&self, resource: &str) -> Result<()> {
        info!("Regenerating schema resource '{}'", resource);
        let generated = self.compile(resource).await?;
        self.mount_all().await?;
        info!("Schema '{}' regenerated ({} outputs)", resource, generated.len());
        Ok(())
    }
}

/// Point `link` at `target`, replacing a stale symlink but never a real file or directory
async fn link(target: &Path, link: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            if tokio::fs::read_link(link).await.ok().as_deref() == Some(target) {
                return Ok(());
            }
            tokio::fs::remove_file(link)
                .await
                .with_context(|| format!("Failed to remove stale link {}", link.display()))?;
        }
        Ok(_) => {
            warn!("{} exists and is not a symlink; leaving it alone", link.display());
            return Ok(());
        }
        Err(_) => {}
    }

    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    symlink_dir(target, link)
        .await
        .with_context(|| format!("Failed to link {} -> {}", link.display(), target.display()))?;
    debug!("Mounted {} -> {}", link.display(), target.display());
    Ok(())
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}
