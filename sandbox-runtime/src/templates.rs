//! Read-only catalog of declarative sandbox templates.
//!
//! Templates are YAML files loaded once at startup from `TEMPLATES_DIR`.
//! A template may carry an optional hierarchy (`domain`/`project`/`task`)
//! that yields path-style aliases; lookups resolve either the declared name
//! or an alias.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CPU: &str = "1";
pub const DEFAULT_MEMORY: &str = "512m";
pub const DEFAULT_TTL_SECONDS: u64 = 3600;

/// One exposed container port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortSpec {
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Symbolic name used in endpoint maps and proxy hostnames.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub public: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Scheduler hints; the container runtime is the only enforcement point.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

/// Optional hierarchy for path-style template aliases.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Hierarchy {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub task: String,
}

/// Declarative description from which sandboxes are created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub image: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, rename = "ttl")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// `source:container_path` bind specifications.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub hierarchy: Option<Hierarchy>,
}

impl Template {
    /// Effective TTL, falling back to the catalog default.
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS)
    }

    fn apply_defaults(&mut self) {
        if self.resources.cpu.is_empty() {
            self.resources.cpu = DEFAULT_CPU.to_string();
        }
        if self.resources.memory.is_empty() {
            self.resources.memory = DEFAULT_MEMORY.to_string();
        }
        if self.ttl_seconds.is_none() {
            self.ttl_seconds = Some(DEFAULT_TTL_SECONDS);
        }
        for port in &mut self.ports {
            if port.name.is_empty() {
                port.name = format!("port-{}", port.container_port);
            }
        }
    }

    fn aliases(&self) -> Vec<String> {
        let Some(h) = &self.hierarchy else {
            return Vec::new();
        };
        let mut aliases = Vec::new();
        if !h.domain.is_empty() && !h.project.is_empty() {
            aliases.push(format!("{}/{}", h.domain, h.project));
            if !h.task.is_empty() {
                aliases.push(format!("{}/{}/{}", h.domain, h.project, h.task));
            }
        }
        aliases
    }
}

/// Immutable template lookup. Built once, then shared.
pub struct TemplateCatalog {
    templates: HashMap<String, Template>,
    aliases: HashMap<String, String>,
}

impl TemplateCatalog {
    /// Load every `*.yaml`/`*.yml` file under `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|err| {
            Error::Validation(format!("cannot read templates dir {}: {err}", dir.display()))
        })?;

        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| Error::Validation(format!("cannot read templates dir: {err}")))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|err| {
                Error::Validation(format!("cannot read {}: {err}", path.display()))
            })?;
            let template: Template = serde_yaml::from_str(&raw).map_err(|err| {
                Error::Validation(format!("invalid template {}: {err}", path.display()))
            })?;
            templates.push(template);
        }
        Self::from_templates(templates)
    }

    /// Build a catalog from already-parsed templates.
    pub fn from_templates(templates: Vec<Template>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut aliases = HashMap::new();
        for mut template in templates {
            if template.name.is_empty() {
                return Err(Error::Validation("template without a name".to_string()));
            }
            if template.image.is_empty() {
                return Err(Error::Validation(format!(
                    "template '{}' has no image",
                    template.name
                )));
            }
            template.apply_defaults();
            for alias in template.aliases() {
                aliases.insert(alias, template.name.clone());
            }
            if by_name.insert(template.name.clone(), template).is_some() {
                return Err(Error::Validation("duplicate template name".to_string()));
            }
        }
        Ok(Self { templates: by_name, aliases })
    }

    /// Resolve by declared name or hierarchy alias.
    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|n| self.templates.get(n)))
    }

    pub fn list(&self) -> Vec<&Template> {
        let mut all: Vec<&Template> = self.templates.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
