use notify::EventKind;
use std::path::{Path, PathBuf};

use crate::capability::quicktype::{resource_name, SCHEMA_SUFFIX};
use crate::domain::Project;
use crate::orchestrator::ChangeCommand;

/// Directory names never worth a reload, anywhere below a watched root
const IGNORED_DIRS: &[&str] = &[".git", "node_modules", ".venv", "__pycache__", "target"];

/// Maps changed paths to the command they should trigger
#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Service roots, longest first
    roots: Vec<(PathBuf, String)>,
    schema_dir: PathBuf,
    /// Generated output and schema mounts
    excluded: Vec<PathBuf>,
}

impl PathMapper {
    pub fn new(project: &Project) -> Self {
        let mut roots: Vec<(PathBuf, String)> = project
            .services()
            .map(|spec| (spec.path.clone(), spec.name.clone()))
            .collect();
        roots.sort_by(|(a, _), (b, _)| b.components().count().cmp(&a.components().count()));

        let mut excluded = vec![project.output_dir()];
        excluded.extend(project.services().filter_map(|spec| {
            spec.schemas_mount_dir
                .as_ref()
                .map(|mount| spec.path.join(mount))
        }));

        Self {
            roots,
            schema_dir: project.schema_dir(),
            excluded,
        }
    }

    /// Directories to watch recursively
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.roots.iter().map(|(path, _)| path.clone()).collect();
        dirs.push(self.schema_dir.clone());
        dirs.sort();
        dirs.dedup();
        dirs
    }

    pub fn map_path(&self, path: &Path) -> Option<ChangeCommand> {
        if self.excluded.iter().any(|dir| path.starts_with(dir)) {
            return None;
        }

        if let Ok(relative) = path.strip_prefix(&self.schema_dir) {
            let is_schema = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(SCHEMA_SUFFIX));
            return if is_schema && !is_ignored(relative) {
                resource_name(path).map(ChangeCommand::Regenerate)
            } else {
                None
            };
        }

        let (root, service) = self.roots.iter().find(|(root, _)| path.starts_with(root))?;
        let relative = path.strip_prefix(root).ok()?;
        if is_ignored(relative) {
            return None;
        }
        Some(ChangeCommand::Restart(service.clone()))
    }

    /// Commands for every mapped path of a filesystem event
    pub fn map_event(&self, event: &notify::Event) -> Vec<ChangeCommand> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        let mut commands: Vec<ChangeCommand> = Vec::new();
        for command in event.paths.iter().filter_map(|path| self.map_path(path)) {
            if !commands.contains(&command) {
                commands.push(command);
            }
        }
        commands
    }
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
    })
}
