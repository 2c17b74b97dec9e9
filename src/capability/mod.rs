pub mod command;
pub mod python;
pub mod quicktype;
pub mod registry;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::domain::ServiceSpec;

pub use command::{CommandRuntime, CommandSet};
pub use python::PythonRuntime;
pub use quicktype::QuicktypeCompiler;
pub use registry::{BindingCatalog, CapabilityRegistry, CapabilitySettings};

pub type Environment = BTreeMap<String, String>;

/// Language runtime capability: knows how to install, launch, build and test a service kind
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> &str;

    /// Framework detected in the service tree, if any
    async fn detect(&self, service: &ServiceSpec) -> Result<Option<String>>;

    async fn install(&self, service: &ServiceSpec) -> Result<()>;

    /// Describe how to launch the service; the supervisor performs the spawn
    async fn start(&self, service: &ServiceSpec, env: &Environment) -> Result<LaunchSpec>;

    /// Runs before the supervisor terminates the service's process
    async fn stop(&self, _service: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn build(&self, service: &ServiceSpec) -> Result<()>;

    async fn test(&self, service: &ServiceSpec) -> Result<()>;

    /// Extra environment injected into every launch of this kind
    fn environment(&self, _service: &ServiceSpec) -> Environment {
        Environment::new()
    }
}

/// Schema compiler capability
#[async_trait]
pub trait SchemaCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, format: &str, language: &str) -> bool;

    /// Compile one schema for `language`, returning the generated file
    async fn compile(
        &self,
        schema: &Path,
        output_dir: &Path,
        project_root: &Path,
        language: &str,
    ) -> Result<PathBuf>;
}

/// A program, its arguments, working directory and environment additions
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Environment,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Environment::new(),
        }
    }

    /// Run a command line through `sh -c`
    pub fn shell(command_line: &str, cwd: impl Into<PathBuf>) -> Self {
        Self::new("sh", cwd).args(["-c", command_line])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &Environment) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Accepts either an argv array or a shell string
    pub fn from_value(value: &serde_json::Value, cwd: impl Into<PathBuf>) -> Result<Self> {
        match value {
            serde_json::Value::String(line) if !line.trim().is_empty() => {
                Ok(Self::shell(line, cwd))
            }
            serde_json::Value::Array(items) => {
                let argv = items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| anyhow!("command arguments must be strings, got {item}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| anyhow!("command must not be empty"))?;
                Ok(Self::new(program.clone(), cwd).args(args.iter().cloned()))
            }
            other => Err(anyhow!("expected a command string or array, got {other}")),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd).envs(&self.env);
        cmd
    }

    /// Run to completion, failing on a non-zero exit status.
    /// Dropping the returned future kills the child.
    pub async fn run(&self) -> Result<()> {
        debug!("Running {} in {}", self.display(), self.cwd.display());

        let mut cmd = self.to_command();
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run `{}`", self.display()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow!(
                "`{}` exited with {}: {}",
                self.display(),
                output.status,
                stderr.trim()
            ))
        }
    }
}
