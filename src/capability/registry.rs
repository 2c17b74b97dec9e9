use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{CommandRuntime, PythonRuntime, QuicktypeCompiler, Runtime, SchemaCompiler};
use crate::error::{OrchestratorError, Result};

/// Which discoverable bindings to activate, in priority order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySettings {
    #[serde(default)]
    pub bindings: Vec<String>,
    /// When set, only these binding names may be activated
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
}

impl CapabilitySettings {
    fn allows(&self, name: &str) -> bool {
        self.allowlist
            .as_ref()
            .map_or(true, |list| list.iter().any(|n| n.eq_ignore_ascii_case(name)))
    }
}

#[derive(Clone)]
enum Binding {
    Runtime(Arc<dyn Runtime>),
    Compiler(Arc<dyn SchemaCompiler>),
}

/// Bindings the host makes discoverable by name
#[derive(Clone, Default)]
pub struct BindingCatalog {
    entries: Vec<(String, Binding)>,
}

impl BindingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runtime(mut self, name: impl Into<String>, runtime: Arc<dyn Runtime>) -> Self {
        self.entries.push((name.into(), Binding::Runtime(runtime)));
        self
    }

    pub fn register_compiler(mut self, name: impl Into<String>, compiler: Arc<dyn SchemaCompiler>) -> Self {
        self.entries.push((name.into(), Binding::Compiler(compiler)));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    fn find(&self, name: &str) -> Option<&Binding> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, binding)| binding)
    }
}

/// Resolves service kinds and schema formats to capabilities.
///
/// External bindings are consulted in configured order before the built-ins,
/// so a configured binding for an existing kind shadows the built-in one.
pub struct CapabilityRegistry {
    runtimes: Vec<Arc<dyn Runtime>>,
    compilers: Vec<Arc<dyn SchemaCompiler>>,
    builtin_runtimes: Vec<Arc<dyn Runtime>>,
    builtin_compilers: Vec<Arc<dyn SchemaCompiler>>,
    missing: Vec<String>,
    resolved: DashMap<String, Arc<dyn Runtime>>,
}

impl CapabilityRegistry {
    /// Registry with only the built-in capabilities
    pub fn builtin() -> Self {
        Self::new(&BindingCatalog::new(), &CapabilitySettings::default())
    }

    pub fn new(catalog: &BindingCatalog, settings: &CapabilitySettings) -> Self {
        let mut runtimes = Vec::new();
        let mut compilers = Vec::new();
        let mut missing = Vec::new();

        for name in &settings.bindings {
            if !settings.allows(name) {
                debug!("Skipping binding '{}': not in allowlist", name);
                continue;
            }
            match catalog.find(name) {
                Some(Binding::Runtime(runtime)) => {
                    info!("Activated runtime binding '{}' for kind '{}'", name, runtime.kind());
                    runtimes.push(Arc::clone(runtime));
                }
                Some(Binding::Compiler(compiler)) => {
                    info!("Activated compiler binding '{}'", name);
                    compilers.push(Arc::clone(compiler));
                }
                None => {
                    warn!("Configured binding '{}' was not found; continuing without it", name);
                    missing.push(name.clone());
                }
            }
        }

        Self {
            runtimes,
            compilers,
            builtin_runtimes: vec![Arc::new(CommandRuntime::new()), Arc::new(PythonRuntime::new())],
            builtin_compilers: vec![Arc::new(QuicktypeCompiler::new())],
            missing,
            resolved: DashMap::new(),
        }
    }

    /// Capability for a service kind; kinds match case-insensitively
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn Runtime>> {
        let key = kind.to_lowercase();
        if let Some(runtime) = self.resolved.get(&key) {
            return Ok(Arc::clone(runtime.value()));
        }

        let runtime = self
            .runtimes
            .iter()
            .chain(self.builtin_runtimes.iter())
            .find(|r| r.kind().eq_ignore_ascii_case(&key))
            .cloned()
            .ok_or_else(|| OrchestratorError::UnresolvedKind(kind.to_string()))?;

        self.resolved.insert(key, Arc::clone(&runtime));
        Ok(runtime)
    }

    pub fn resolve_compiler(&self, format: &str, language: &str) -> Option<Arc<dyn SchemaCompiler>> {
        self.compilers
            .iter()
            .chain(self.builtin_compilers.iter())
            .find(|c| c.supports(format, language))
            .cloned()
    }

    /// Configured binding names that no discoverable binding answered to
    pub fn missing_bindings(&self) -> &[String] {
        &self.missing
    }

    /// Every resolvable kind, external bindings first
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for runtime in self.runtimes.iter().chain(self.builtin_runtimes.iter()) {
            let kind = runtime.kind().to_lowercase();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn compiler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for compiler in self.compilers.iter().chain(self.builtin_compilers.iter()) {
            if !names.iter().any(|n| n == compiler.name()) {
                names.push(compiler.name().to_string());
            }
        }
        names
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &self.kinds())
            .field("missing", &self.missing)
            .finish()
    }
}
