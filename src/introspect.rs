//! Argument introspection
//!
//! Collects the parameter schema of every task plugin so it can be shown to
//! a user or handed to an API client. Schemas come from the manifest's
//! `requirements` when present, otherwise from the built handler's
//! [`Handler::extra_requirements`](crate::handler::Handler::extra_requirements).
//!
//! A plugin whose schema cannot be obtained is reported through the alert
//! and left out; the pass always completes.

use indexmap::IndexMap;
use tracing::debug;

use crate::alert::Alert;
use crate::handler::scalar_text;
use crate::manifest::Requirements;
use crate::registry::{PluginEntry, PluginRegistry};

/// Categories described when the caller gives none
pub const DEFAULT_CATEGORIES: [&str; 3] = ["brute", "scan", "vuln"];

/// Plugin canonical name → declared schema, in discovery order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentSchemas {
    schemas: IndexMap<String, Requirements>,
}

impl ArgumentSchemas {
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn get(&self, plugin: &str) -> Option<&Requirements> {
        self.schemas.get(plugin)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Plugin → ordered parameter names
    pub fn parameter_names(&self) -> IndexMap<String, Vec<String>> {
        self.schemas
            .iter()
            .map(|(plugin, req)| (plugin.clone(), req.keys().cloned().collect()))
            .collect()
    }

    /// One `name=value1,value2` line per parameter, each newline-terminated
    pub fn to_api_text(&self) -> String {
        let mut out = String::new();
        for requirements in self.schemas.values() {
            for (name, values) in requirements {
                let values: Vec<String> = values.iter().map(scalar_text).collect();
                out.push_str(name);
                out.push('=');
                out.push_str(&values.join(","));
                out.push('\n');
            }
        }
        out
    }

    /// `<plugin> --> a, b` per plugin
    pub fn summary_lines(&self) -> Vec<String> {
        self.schemas
            .iter()
            .map(|(plugin, req)| {
                let names: Vec<&str> = req.keys().map(String::as_str).collect();
                format!("{} --> {}", plugin, names.join(", "))
            })
            .collect()
    }

    /// Emit [`summary_lines`](Self::summary_lines) through `alert`
    pub fn report(&self, alert: &dyn Alert) {
        for line in self.summary_lines() {
            alert.info(&line);
        }
    }
}

/// Describe every plugin whose category is in `categories`.
///
/// An empty filter means [`DEFAULT_CATEGORIES`]. The `graph` category is
/// never described.
pub fn describe(registry: &PluginRegistry, categories: &[&str], alert: &dyn Alert) -> ArgumentSchemas {
    let categories: &[&str] = if categories.is_empty() {
        &DEFAULT_CATEGORIES
    } else {
        categories
    };

    let mut schemas = IndexMap::new();
    for entry in registry.entries() {
        if !categories.contains(&entry.category.as_str()) {
            continue;
        }
        match requirements_of(registry, entry) {
            Ok(requirements) => {
                debug!(
                    "{}: {} parameter(s)",
                    entry.canonical,
                    requirements.len()
                );
                schemas.insert(entry.canonical.clone(), requirements);
            }
            Err(reason) => {
                alert.warn(&format!(
                    "cannot read arguments of '{}': {}",
                    entry.canonical, reason
                ));
            }
        }
    }

    ArgumentSchemas { schemas }
}

fn requirements_of(registry: &PluginRegistry, entry: &PluginEntry) -> Result<Requirements, String> {
    if let Some(manifest) = entry.load_manifest() {
        let manifest = manifest.map_err(|e| e.to_string())?;
        if let Some(requirements) = manifest.requirements {
            return Ok(requirements);
        }
    }

    let handler = registry.build(entry).map_err(|e| e.to_string())?;
    handler
        .extra_requirements()
        .ok_or_else(|| "plugin declares no requirements".to_string())
}
