use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::{DependencyGraph, ServiceSpec};
use crate::error::ConfigurationError;

/// Where shared schema resources live and where their compiled output goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSettings {
    #[serde(default = "default_schema_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("schemas")
}

fn default_output_path() -> PathBuf {
    PathBuf::from("generated/schemas")
}

fn default_format() -> String {
    "json_schema".to_string()
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            dir: default_schema_dir(),
            output_path: default_output_path(),
            format: default_format(),
        }
    }
}

/// Set of services sharing one root, in declaration order
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    services: Vec<Arc<ServiceSpec>>,
    index: HashMap<String, usize>,
    pub languages: Vec<String>,
    pub schemas: SchemaSettings,
    pub environment: BTreeMap<String, String>,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            services: Vec::new(),
            index: HashMap::new(),
            languages: Vec::new(),
            schemas: SchemaSettings::default(),
            environment: BTreeMap::new(),
        }
    }

    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<(), ConfigurationError> {
        if self.index.contains_key(&spec.name) {
            return Err(ConfigurationError::DuplicateService(spec.name));
        }
        self.index.insert(spec.name.clone(), self.services.len());
        self.services.push(Arc::new(spec));
        Ok(())
    }

    /// Builder form of [`Project::add_service`]
    pub fn with_service(mut self, spec: ServiceSpec) -> Result<Self, ConfigurationError> {
        self.add_service(spec)?;
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join(&self.schemas.dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.schemas.output_path)
    }

    /// Services that declared a dependency on the given schema resource
    pub fn services_using_schema(&self, resource: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.depends_on_schemas.iter().any(|r| r == resource))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Validate the dependency graph; a project is only orchestrated once this succeeds
    pub fn validate(&self) -> Result<DependencyGraph, ConfigurationError> {
        DependencyGraph::build(self)
    }
}
