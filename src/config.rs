//! Engine configuration
//!
//! One [`EngineConfig`] is built at startup and passed explicitly to the
//! registry, the dispatcher and bootstrap. Defaults are usable without a
//! file; a JSON file may override any subset of fields, and `MODRUN_HOME` /
//! `MODRUN_PLUGINS` override the corresponding paths last.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

use crate::dispatch::DispatchOptions;

/// Overrides `home_path`
pub const ENV_HOME: &str = "MODRUN_HOME";
/// Overrides `plugins_root`
pub const ENV_PLUGINS: &str = "MODRUN_PLUGINS";

/// Database backend provisioned at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// File name for sqlite, database name otherwise
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            name: "modrun.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,
    pub timeout_secs: Option<u64>,
    pub retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout_secs: None,
            retries: 0,
        }
    }
}

impl DispatchConfig {
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            workers: self.workers,
            timeout: self.timeout_secs.map(Duration::from_secs),
            retries: self.retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub plugins_root: PathBuf,
    pub modules_root: PathBuf,
    pub home_path: PathBuf,
    pub tmp_path: PathBuf,
    pub results_path: PathBuf,
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    /// Programs that must be on PATH before anything runs
    pub required_binaries: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = PathBuf::from(".modrun");
        Self {
            plugins_root: PathBuf::from("plugins"),
            modules_root: PathBuf::from("modules"),
            tmp_path: home.join("tmp"),
            results_path: home.join("results"),
            home_path: home,
            database: DatabaseConfig::default(),
            dispatch: DispatchConfig::default(),
            required_binaries: vec!["bash".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Apply `MODRUN_HOME` and `MODRUN_PLUGINS` as returned by `lookup`.
    ///
    /// A new home moves `tmp_path` and `results_path` along with it when
    /// they still sit under the old home.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup(ENV_HOME).filter(|v| !v.trim().is_empty()) {
            let home = PathBuf::from(home);
            for path in [&mut self.tmp_path, &mut self.results_path] {
                if let Ok(rest) = path.strip_prefix(&self.home_path) {
                    *path = home.join(rest);
                }
            }
            self.home_path = home;
        }
        if let Some(plugins) = lookup(ENV_PLUGINS).filter(|v| !v.trim().is_empty()) {
            self.plugins_root = PathBuf::from(plugins);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("plugins_root", &self.plugins_root),
            ("modules_root", &self.modules_root),
            ("home_path", &self.home_path),
            ("tmp_path", &self.tmp_path),
            ("results_path", &self.results_path),
        ];
        for (name, path) in paths {
            if path.as_os_str().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        if self.dispatch.workers == 0 {
            anyhow::bail!("dispatch.workers must be at least 1");
        }

        if self.dispatch.timeout_secs == Some(0) {
            anyhow::bail!("dispatch.timeout_secs must be positive when set");
        }

        if self.database.name.trim().is_empty() {
            anyhow::bail!("database.name must be specified");
        }

        if self.required_binaries.iter().any(|b| b.trim().is_empty()) {
            anyhow::bail!("required_binaries must not contain empty names");
        }

        Ok(())
    }
}
