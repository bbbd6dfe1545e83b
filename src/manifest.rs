//! Plugin manifests
//!
//! Every plugin directory carries an entry-point file, `engine.json`, that
//! declares which handler kind implements the plugin and how it is
//! configured:
//!
//! ```json
//! {
//!   "handler": "command",
//!   "description": "Probe an HTTP port",
//!   "requirements": { "ports": [80, 443], "methods": ["GET", "HEAD"] },
//!   "options": { "program": "probe.sh", "args": ["--host", "{target}"] },
//!   "valid_exit_codes": [0]
//! }
//! ```
//!
//! `requirements` is the plugin's parameter schema: parameter name to
//! example/allowed values. It is optional; plugins without it are skipped by
//! argument introspection.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// File name of a plugin's entry point
pub const ENTRY_POINT: &str = "engine.json";

/// Parameter name → example or allowed values, in declaration order
pub type Requirements = IndexMap<String, Vec<serde_json::Value>>;

/// Errors that can occur during manifest operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// Manifest file not found
    #[error("Manifest not found: {path}")]
    NotFound { path: String },

    /// Invalid manifest format
    #[error("Invalid manifest format: {reason}")]
    InvalidFormat { reason: String },

    /// IO error reading manifest
    #[error("Failed to read manifest: {reason}")]
    IoError { reason: String },
}

impl From<std::io::Error> for ManifestError {
    fn from(err: std::io::Error) -> Self {
        ManifestError::IoError {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::InvalidFormat {
            reason: err.to_string(),
        }
    }
}

/// Plugin manifest defining how a plugin is executed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// Handler kind registered in the handler catalog (e.g. "command")
    pub handler: String,

    /// Human-readable description of what the plugin does
    #[serde(default)]
    pub description: String,

    /// Declared parameter schema
    #[serde(default)]
    pub requirements: Option<Requirements>,

    /// Handler-specific options
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,

    /// Exit codes a command handler treats as success
    #[serde(default = "default_exit_codes")]
    pub valid_exit_codes: Vec<i32>,

    /// Manifest version for compatibility tracking
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PluginManifest {
    /// Create a new manifest builder
    pub fn builder(handler: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(handler)
    }

    /// Load a manifest from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ManifestError::NotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate_structure()?;
        Ok(manifest)
    }

    /// Validate the manifest structure itself
    fn validate_structure(&self) -> Result<(), ManifestError> {
        if self.handler.trim().is_empty() {
            return Err(ManifestError::InvalidFormat {
                reason: "handler kind must not be empty".to_string(),
            });
        }

        if self.valid_exit_codes.is_empty() {
            return Err(ManifestError::InvalidFormat {
                reason: "valid_exit_codes must not be empty".to_string(),
            });
        }

        if let Some(ref requirements) = self.requirements {
            for name in requirements.keys() {
                if name.trim().is_empty() || name.contains(['=', ',', '\n']) {
                    return Err(ManifestError::InvalidFormat {
                        reason: format!("invalid requirement name: {:?}", name),
                    });
                }
            }
        }

        Ok(())
    }

    /// Check if an exit code counts as success for this plugin
    pub fn is_valid_exit_code(&self, code: i32) -> bool {
        self.valid_exit_codes.contains(&code)
    }

    /// String option, if present
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// Builder for creating PluginManifest instances
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    handler: String,
    description: String,
    requirements: Option<Requirements>,
    options: serde_json::Map<String, serde_json::Value>,
    valid_exit_codes: Vec<i32>,
    version: String,
}

impl ManifestBuilder {
    /// Create a new builder
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            description: String::new(),
            requirements: None,
            options: serde_json::Map::new(),
            valid_exit_codes: vec![0],
            version: "1.0".to_string(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a parameter and its example values
    pub fn requirement<V>(mut self, name: impl Into<String>, values: V) -> Self
    where
        V: IntoIterator,
        V::Item: Into<serde_json::Value>,
    {
        self.requirements
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Set a handler option
    pub fn option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set valid exit codes
    pub fn valid_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.valid_exit_codes = codes;
        self
    }

    /// Build the manifest
    pub fn build(self) -> Result<PluginManifest, ManifestError> {
        let manifest = PluginManifest {
            handler: self.handler,
            description: self.description,
            requirements: self.requirements,
            options: self.options,
            valid_exit_codes: self.valid_exit_codes,
            version: self.version,
        };
        manifest.validate_structure()?;
        Ok(manifest)
    }
}
