use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{LaunchSpec, SchemaCompiler};

/// Suffix identifying schema resource files
pub const SCHEMA_SUFFIX: &str = ".schema.json";

/// Resource name of a schema file: `user.schema.json` -> `user`
pub fn resource_name(schema: &Path) -> Option<String> {
    let file_name = schema.file_name()?.to_str()?;
    file_name
        .strip_suffix(SCHEMA_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// Built-in JSON Schema compiler backed by `pnpm quicktype`
#[derive(Debug, Clone, Default)]
pub struct QuicktypeCompiler;

impl QuicktypeCompiler {
    pub const NAME: &'static str = "quicktype";

    pub fn new() -> Self {
        Self
    }

    fn extension(language: &str) -> Option<&'static str> {
        match language.to_lowercase().as_str() {
            "python" => Some("py"),
            "typescript" => Some("ts"),
            _ => None,
        }
    }

    fn output_file(schema: &Path, output_dir: &Path, language: &str) -> Result<PathBuf> {
        let name = resource_name(schema)
            .with_context(|| format!("{} is not a schema resource", schema.display()))?;
        let ext = Self::extension(language).with_context(|| format!("unsupported language {language}"))?;
        Ok(output_dir.join(format!("{name}.{ext}")))
    }

    async fn run(&self, schema: &Path, output_dir: &Path, project_root: &Path, language: &str) -> Result<PathBuf> {
        let output = Self::output_file(schema, output_dir, language)?;
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut launch = LaunchSpec::new("pnpm", project_root).args([
            "quicktype",
            "-s",
            "schema",
            &schema.display().to_string(),
            "-l",
            language,
            "-o",
            &output.display().to_string(),
            "--just-types",
        ]);
        if language == "python" {
            launch = launch.args(["--pydantic-base-model"]);
        }
        launch.run().await?;

        if !output.exists() {
            bail!("quicktype produced no output for {}", schema.display());
        }
        Ok(output)
    }
}

#[async_trait]
impl SchemaCompiler for QuicktypeCompiler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports(&self, format: &str, language: &str) -> bool {
        matches!(format.to_lowercase().as_str(), "json_schema" | "json-schema")
            && Self::extension(language).is_some()
    }

    async fn compile(
        &self,
        schema: &Path,
        output_dir: &Path,
        project_root: &Path,
        language: &str,
    ) -> Result<PathBuf> {
        self.run(schema, output_dir, project_root, language).await
    }
}
