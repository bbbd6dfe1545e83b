//! Environment bootstrap
//!
//! Runs once before any module is loaded:
//! - Required binaries are on PATH
//! - The home, tmp and results directories exist
//! - The configured database backend is provisioned
//!
//! Any failure is fatal to startup; the binary reports it through
//! [`Alert::die`](crate::alert::Alert::die). The engine never calls into
//! this module.

use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::Alert;
use crate::config::{DatabaseBackend, EngineConfig};
use crate::process_guard::CommandProcessGroup;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("missing required binaries: {}", .0.join(", "))]
    MissingBinaries(Vec<String>),

    #[error("cannot create directory '{path}': {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no provisioner for database backend '{0}'")]
    UnsupportedBackend(DatabaseBackend),

    #[error("cannot provision {backend} database: {reason}")]
    Database {
        backend: DatabaseBackend,
        reason: String,
    },
}

/// Check if a binary is available in PATH
pub fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Names from `required` that are not on PATH
pub fn missing_binaries(required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !binary_exists(name))
        .cloned()
        .collect()
}

/// Create the home, tmp and results directories
pub fn create_directories(config: &EngineConfig) -> Result<(), BootstrapError> {
    for dir in [&config.home_path, &config.tmp_path, &config.results_path] {
        std::fs::create_dir_all(dir).map_err(|source| BootstrapError::Directory {
            path: dir.display().to_string(),
            source,
        })?;
        debug!("Directory ready: {}", dir.display());
    }
    Ok(())
}

/// Prepares the storage for one database backend
pub trait DatabaseProvisioner {
    fn backend(&self) -> DatabaseBackend;
    fn provision(&self, config: &EngineConfig) -> Result<(), BootstrapError>;
}

/// Creates the sqlite database file under the home directory
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteProvisioner;

impl SqliteProvisioner {
    pub fn database_path(config: &EngineConfig) -> PathBuf {
        config.home_path.join(&config.database.name)
    }
}

impl DatabaseProvisioner for SqliteProvisioner {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
    }

    fn provision(&self, config: &EngineConfig) -> Result<(), BootstrapError> {
        let path = Self::database_path(config);
        if path.is_file() {
            debug!("sqlite database already present: {}", path.display());
            return Ok(());
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BootstrapError::Database {
                backend: DatabaseBackend::Sqlite,
                reason: format!("{}: {}", path.display(), e),
            })?;
        info!("Created sqlite database {}", path.display());
        Ok(())
    }
}

/// What a successful bootstrap did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub binaries_checked: usize,
    pub directories: Vec<PathBuf>,
    pub backend: DatabaseBackend,
}

/// Startup checks with a set of database provisioners
pub struct Bootstrap {
    provisioners: Vec<Box<dyn DatabaseProvisioner>>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    /// Bootstrap with the built-in sqlite provisioner.
    ///
    /// Server backends need a provisioner registered with
    /// [`with_provisioner`](Self::with_provisioner).
    pub fn new() -> Self {
        Self {
            provisioners: vec![Box::new(SqliteProvisioner)],
        }
    }

    /// Add a provisioner; it takes precedence over earlier ones for its backend
    pub fn with_provisioner(mut self, provisioner: Box<dyn DatabaseProvisioner>) -> Self {
        self.provisioners.insert(0, provisioner);
        self
    }

    pub fn run(&self, config: &EngineConfig) -> Result<BootstrapReport, BootstrapError> {
        let missing = missing_binaries(&config.required_binaries);
        if !missing.is_empty() {
            return Err(BootstrapError::MissingBinaries(missing));
        }

        create_directories(config)?;

        let backend = config.database.backend;
        let provisioner = self
            .provisioners
            .iter()
            .find(|p| p.backend() == backend)
            .ok_or(BootstrapError::UnsupportedBackend(backend))?;
        provisioner.provision(config)?;

        info!(
            "Bootstrap complete: {} binaries, {} database",
            config.required_binaries.len(),
            backend
        );
        Ok(BootstrapReport {
            binaries_checked: config.required_binaries.len(),
            directories: vec![
                config.home_path.clone(),
                config.tmp_path.clone(),
                config.results_path.clone(),
            ],
            backend,
        })
    }

    /// Run, and end the process through `alert` on failure
    pub fn run_or_die(&self, config: &EngineConfig, alert: &dyn Alert) -> BootstrapReport {
        match self.run(config) {
            Ok(report) => report,
            Err(e) => alert.die(&format!("bootstrap failed: {}", e)),
        }
    }
}
