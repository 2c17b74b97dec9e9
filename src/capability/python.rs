use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{Environment, LaunchSpec, Runtime};
use crate::domain::ServiceSpec;

const DEFAULT_PYTHON_VERSION: &str = "3.12";
const DEFAULT_PORT: u64 = 8000;
const SUPPORTED_FRAMEWORKS: &[&str] = &["fastapi", "flask"];

/// Built-in runtime for Python services managed with `uv`
#[derive(Debug, Clone, Default)]
pub struct PythonRuntime;

impl PythonRuntime {
    pub const KIND: &'static str = "python";

    pub fn new() -> Self {
        Self
    }

    /// Read a setting from the config payload, falling back to its `runtime` table
    fn setting<'a>(service: &'a ServiceSpec, key: &str) -> Option<&'a serde_json::Value> {
        service
            .config
            .get(key)
            .or_else(|| service.config.get("runtime").and_then(|r| r.get(key)))
    }

    fn port(service: &ServiceSpec) -> u64 {
        match Self::setting(service, "port") {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(DEFAULT_PORT),
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(DEFAULT_PORT),
            _ => DEFAULT_PORT,
        }
    }

    fn python_executable(service: &ServiceSpec) -> PathBuf {
        let venv = service.path.join(".venv");
        for bin_dir in ["bin", "Scripts"] {
            for name in ["python3", "python"] {
                let candidate = venv.join(bin_dir).join(name);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        PathBuf::from("python3")
    }

    /// Lower-cased package names from requirements.txt and pyproject.toml
    async fn dependencies(path: &Path) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();

        if let Ok(content) = tokio::fs::read_to_string(path.join("requirements.txt")).await {
            deps.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(package_name),
            );
        }

        if let Ok(content) = tokio::fs::read_to_string(path.join("pyproject.toml")).await {
            match content.parse::<toml::Table>() {
                Ok(data) => {
                    if let Some(list) = data
                        .get("project")
                        .and_then(|p| p.get("dependencies"))
                        .and_then(|d| d.as_array())
                    {
                        deps.extend(list.iter().filter_map(|d| d.as_str()).map(package_name));
                    }
                    if let Some(table) = data
                        .get("tool")
                        .and_then(|t| t.get("poetry"))
                        .and_then(|p| p.get("dependencies"))
                        .and_then(|d| d.as_table())
                    {
                        deps.extend(table.keys().map(|k| k.to_lowercase()));
                    }
                }
                Err(e) => warn!("Failed to parse {}/pyproject.toml: {}", path.display(), e),
            }
        }

        deps
    }
}

fn package_name(requirement: &str) -> String {
    requirement
        .split(|c: char| matches!(c, '=' | '>' | '<' | '~' | '!' | '[' | ';' | ' '))
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

#[async_trait]
impl Runtime for PythonRuntime {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn detect(&self, service: &ServiceSpec) -> Result<Option<String>> {
        let deps = Self::dependencies(&service.path).await;
        Ok(SUPPORTED_FRAMEWORKS
            .iter()
            .find(|framework| deps.contains(**framework))
            .map(|framework| framework.to_string()))
    }

    async fn install(&self, service: &ServiceSpec) -> Result<()> {
        let version = Self::setting(service, "python_version")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PYTHON_VERSION);
        tokio::fs::write(service.path.join(".python-version"), version)
            .await
            .context("Failed to write .python-version")?;

        LaunchSpec::new("uv", &service.path).args(["venv"]).run().await?;

        if service.path.join("pyproject.toml").exists() {
            LaunchSpec::new("uv", &service.path).args(["sync"]).run().await
        } else if service.path.join("requirements.txt").exists() {
            LaunchSpec::new("uv", &service.path)
                .args(["pip", "install", "-r", "requirements.txt"])
                .run()
                .await
        } else {
            warn!(
                "Service '{}' has no pyproject.toml or requirements.txt; nothing to install",
                service.name
            );
            Ok(())
        }
    }

    async fn start(&self, service: &ServiceSpec, env: &Environment) -> Result<LaunchSpec> {
        let python = Self::python_executable(service).display().to_string();
        let framework = match Self::setting(service, "framework").and_then(|v| v.as_str()) {
            Some(framework) => Some(framework.to_string()),
            None => self.detect(service).await?,
        };
        let port = Self::port(service).to_string();
        let entry_point = Self::setting(service, "entry_point").and_then(|v| v.as_str());

        let launch = LaunchSpec::new(python, &service.path);
        let launch = match framework.as_deref() {
            Some("fastapi") => launch.args([
                "-m",
                "uvicorn",
                entry_point.unwrap_or("main:app"),
                "--reload",
                "--host",
                "0.0.0.0",
                "--port",
                port.as_str(),
            ]),
            Some("flask") => launch.args(["-m", "flask", "run", "--host", "0.0.0.0", "--port", port.as_str()]),
            _ => launch.args([entry_point.unwrap_or("main.py")]),
        };

        Ok(launch.envs(env))
    }

    async fn build(&self, service: &ServiceSpec) -> Result<()> {
        LaunchSpec::new(Self::python_executable(service).display().to_string(), &service.path)
            .args(["-m", "build"])
            .run()
            .await
    }

    async fn test(&self, service: &ServiceSpec) -> Result<()> {
        let python = Self::python_executable(service).display().to_string();
        let launch = LaunchSpec::new(python, &service.path);

        let launch = if service.path.join("pytest.ini").exists()
            || Self::dependencies(&service.path).await.contains("pytest")
        {
            launch.args(["-m", "pytest", "-v"])
        } else if service.path.join("tests").is_dir() || service.path.join("test").is_dir() {
            launch.args(["-m", "unittest", "discover", "-p", "test*"])
        } else {
            info!("No tests found for service '{}'", service.name);
            return Ok(());
        };

        launch.envs(&self.environment(service)).run().await
    }

    fn environment(&self, service: &ServiceSpec) -> Environment {
        let mut env = Environment::new();
        env.insert("PYTHONPATH".into(), service.path.display().to_string());
        env.insert("PYTHONUNBUFFERED".into(), "1".into());
        env.insert("PYTHONDONTWRITEBYTECODE".into(), "1".into());
        env.insert("PIP_NO_CACHE_DIR".into(), "1".into());
        env
    }
}
