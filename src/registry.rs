//! Plugin discovery and resolution
//!
//! Plugins live in a two-level directory layout under the plugins root:
//!
//! ```text
//! <root>/<category>/<name>/engine.json
//! <root>/graph/<name>/engine.json
//! ```
//!
//! A directory counts as a plugin only if it contains the entry-point file.
//! Each plugin is known by its canonical name `<name>_<category>`; plugins of
//! the `graph` category are tracked separately as `<name>_graph` and never
//! appear in the general name set. Canonical names are unique: when two
//! plugins derive the same name, the first one discovered wins.
//!
//! Discovery visits categories and names in sorted order and skips hidden
//! entries, so two scans of an unchanged tree produce the same names in the
//! same order.

use indexmap::{IndexMap, IndexSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::handler::{Handler, HandlerCatalog};
use crate::manifest::{ENTRY_POINT, ManifestError, PluginManifest};

/// Category holding graph extensions
pub const GRAPH_CATEGORY: &str = "graph";

/// Errors raised while scanning the plugin tree
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("cannot scan plugin directory '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while turning a plugin into a handler
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No plugin with this canonical name
    #[error("no plugin named '{name}'")]
    NotFound { name: String },

    /// The plugin's manifest is unreadable or names an unknown handler kind
    #[error("plugin '{name}': {source}")]
    Manifest {
        name: String,
        #[source]
        source: ManifestError,
    },
}

/// Where a plugin's handler comes from
#[derive(Clone)]
pub enum PluginSource {
    /// Entry-point manifest on disk
    Manifest(PathBuf),
    /// Handler registered in-process
    Static(Arc<dyn Handler>),
}

impl std::fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manifest(path) => f.debug_tuple("Manifest").field(path).finish(),
            Self::Static(_) => f.write_str("Static(..)"),
        }
    }
}

/// One registry entry
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub canonical: String,
    pub name: String,
    pub category: String,
    pub source: PluginSource,
}

impl PluginEntry {
    pub fn is_graph(&self) -> bool {
        self.category == GRAPH_CATEGORY
    }

    /// Path of the entry-point manifest, for discovered plugins
    pub fn entry_point(&self) -> Option<&Path> {
        match &self.source {
            PluginSource::Manifest(path) => Some(path),
            PluginSource::Static(_) => None,
        }
    }

    /// Read and validate the plugin's manifest
    pub fn load_manifest(&self) -> Option<Result<PluginManifest, ManifestError>> {
        self.entry_point().map(PluginManifest::from_file)
    }
}

/// Derive the canonical name of a plugin
pub fn canonical_name(category: &str, name: &str) -> String {
    format!("{}_{}", name, category)
}

/// A plugin directory found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedPlugin {
    pub category: String,
    pub name: String,
    pub entry_point: PathBuf,
}

/// Scan `<root>/<category>/<name>/engine.json`.
///
/// A missing root yields no plugins.
pub fn scan(root: &Path) -> Result<Vec<ScannedPlugin>, RegistryError> {
    let mut found = Vec::new();
    if !root.is_dir() {
        debug!("Plugin root {} does not exist", root.display());
        return Ok(found);
    }

    for category in sorted_subdirs(root)? {
        let category_dir = root.join(&category);
        for name in sorted_subdirs(&category_dir)? {
            let entry_point = category_dir.join(&name).join(ENTRY_POINT);
            if entry_point.is_file() {
                found.push(ScannedPlugin {
                    category: category.clone(),
                    name,
                    entry_point,
                });
            }
        }
    }
    Ok(found)
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<String>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Canonical names of all non-graph plugins under `root`
pub fn discover_modules(root: &Path) -> Result<IndexSet<String>, RegistryError> {
    Ok(scan(root)?
        .into_iter()
        .filter(|p| p.category != GRAPH_CATEGORY)
        .map(|p| canonical_name(&p.category, &p.name))
        .collect())
}

/// Canonical names of all graph plugins under `root`
pub fn discover_graphs(root: &Path) -> Result<IndexSet<String>, RegistryError> {
    Ok(scan(root)?
        .into_iter()
        .filter(|p| p.category == GRAPH_CATEGORY)
        .map(|p| canonical_name(&p.category, &p.name))
        .collect())
}

/// In-memory plugin registry, read-only once built
#[derive(Debug)]
pub struct PluginRegistry {
    root: Option<PathBuf>,
    plugins: IndexMap<String, PluginEntry>,
    graphs: IndexMap<String, PluginEntry>,
    statics: Vec<PluginEntry>,
    catalog: HandlerCatalog,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(HandlerCatalog::with_builtins())
    }
}

impl PluginRegistry {
    /// Create a registry with no plugin root
    pub fn new(catalog: HandlerCatalog) -> Self {
        Self {
            root: None,
            plugins: IndexMap::new(),
            graphs: IndexMap::new(),
            statics: Vec::new(),
            catalog,
        }
    }

    /// Scan `root` and build a registry from it
    pub fn discover(root: impl Into<PathBuf>, catalog: HandlerCatalog) -> Result<Self, RegistryError> {
        let mut registry = Self::new(catalog);
        registry.root = Some(root.into());
        registry.rescan()?;
        Ok(registry)
    }

    /// Rebuild discovered entries from disk.
    ///
    /// In-process registrations are re-applied after the scan and still lose
    /// to discovered plugins of the same canonical name.
    pub fn rescan(&mut self) -> Result<(), RegistryError> {
        let scanned = match &self.root {
            Some(root) => scan(root)?,
            None => Vec::new(),
        };

        self.plugins.clear();
        self.graphs.clear();

        for plugin in scanned {
            let entry = PluginEntry {
                canonical: canonical_name(&plugin.category, &plugin.name),
                name: plugin.name,
                category: plugin.category,
                source: PluginSource::Manifest(plugin.entry_point),
            };
            self.insert(entry);
        }

        for entry in self.statics.clone() {
            self.insert(entry);
        }

        info!(
            "Plugin registry: {} plugin(s), {} graph(s)",
            self.plugins.len(),
            self.graphs.len()
        );
        Ok(())
    }

    fn insert(&mut self, entry: PluginEntry) -> bool {
        let target = if entry.is_graph() {
            &mut self.graphs
        } else {
            &mut self.plugins
        };

        if target.contains_key(&entry.canonical) {
            debug!(
                "Suppressing duplicate plugin '{}' ({}/{})",
                entry.canonical, entry.category, entry.name
            );
            return false;
        }
        target.insert(entry.canonical.clone(), entry);
        true
    }

    /// Register an in-process handler under `<name>_<category>`.
    ///
    /// Returns false if the canonical name is already taken.
    pub fn register(
        &mut self,
        category: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> bool {
        let category = category.into();
        let name = name.into();
        let entry = PluginEntry {
            canonical: canonical_name(&category, &name),
            name,
            category,
            source: PluginSource::Static(handler),
        };
        let inserted = self.insert(entry.clone());
        if inserted {
            self.statics.push(entry);
        }
        inserted
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Canonical names of all non-graph plugins, in discovery order
    pub fn discover_modules(&self) -> IndexSet<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Canonical names of all graph plugins, in discovery order
    pub fn discover_graphs(&self) -> IndexSet<String> {
        self.graphs.keys().cloned().collect()
    }

    /// Whether `name` is a known (non-graph) plugin
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.get(name)
    }

    pub fn graph(&self, name: &str) -> Option<&PluginEntry> {
        self.graphs.get(name)
    }

    /// Non-graph plugins in discovery order
    pub fn entries(&self) -> impl Iterator<Item = &PluginEntry> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }

    /// Turn a plugin into its handler.
    ///
    /// Failure leaves the registry untouched; the caller decides whether it
    /// is fatal.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>, ResolveError> {
        let entry = self.get(name).ok_or_else(|| ResolveError::NotFound {
            name: name.to_string(),
        })?;
        self.build(entry)
    }

    /// Build the handler for an entry
    pub fn build(&self, entry: &PluginEntry) -> Result<Arc<dyn Handler>, ResolveError> {
        let manifest_err = |source| ResolveError::Manifest {
            name: entry.canonical.clone(),
            source,
        };

        match &entry.source {
            PluginSource::Static(handler) => Ok(Arc::clone(handler)),
            PluginSource::Manifest(path) => {
                let manifest = PluginManifest::from_file(path).map_err(manifest_err)?;
                let plugin_dir = path.parent().unwrap_or_else(|| Path::new("."));
                self.catalog
                    .build(&manifest, plugin_dir)
                    .map_err(manifest_err)
            }
        }
    }
}
