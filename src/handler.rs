//! Typed handler contract and the handler catalog.
//!
//! A plugin's capability is a [`Handler`]: the dispatch engine calls
//! [`Handler::run`] once per sub-step. Handlers are either registered
//! in-process or built from a plugin manifest by the [`HandlerCatalog`],
//! which maps a manifest's `handler` kind to a factory.
//!
//! # Built-in kinds
//!
//! - `command`: runs an external program per sub-step (see
//!   [`crate::command_runner`]); `args` and `env` options are templated
//!   from the sub-step's fields.
//! - `echo`: logs each sub-step, handy for dry runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

use crate::command_runner::{self, CommandSpec};
use crate::manifest::{ManifestError, PluginManifest, Requirements};
use crate::module::{Payload, StepParams};
use crate::template;

/// Failure raised from inside a handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler ran and reported failure
    #[error("{0}")]
    Failed(String),

    /// The sub-step is missing fields the handler needs
    #[error("invalid step: {0}")]
    InvalidStep(String),

    /// The sub-step exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The run was aborted while the handler was working
    #[error("cancelled")]
    Cancelled,

    /// IO errors (spawning processes, reading files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether retrying the same sub-step could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_) | Self::Io(_))
    }
}

/// Shared abort flag for one module run.
///
/// A child token observes its parent, so cancelling a dispatcher-wide token
/// reaches every run started from it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// New token that is also cancelled when `self` is
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }
}

/// Per-invocation context handed to a handler
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
    pub timeout: Option<Duration>,
    /// 0 on the first attempt
    pub attempt: u32,
}

impl RunContext {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            attempt: 0,
        }
    }

    /// Return an error if the run was aborted or the deadline has passed.
    ///
    /// Long-running in-process handlers call this between units of work.
    pub fn check(&self) -> Result<(), HandlerError> {
        if self.cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(HandlerError::Timeout(timeout));
            }
        }
        Ok(())
    }
}

/// A plugin capability.
///
/// # Contract
///
/// - `run` receives one sub-step and the payload it belongs to; it may block.
/// - Implementations must be safe to call from several threads at once:
///   sub-steps of one group may run concurrently.
/// - `extra_requirements` describes the parameters the handler reads. It is
///   optional; `None` means the handler publishes no schema.
pub trait Handler: Send + Sync {
    fn run(&self, sub_step: &StepParams, payload: &Payload, ctx: &RunContext) -> Result<(), HandlerError>;

    fn extra_requirements(&self) -> Option<Requirements> {
        None
    }
}

/// Builds a handler from a manifest and the plugin's directory
pub type HandlerFactory =
    Box<dyn Fn(&PluginManifest, &Path) -> Result<Arc<dyn Handler>, ManifestError> + Send + Sync>;

/// Handler kind → factory
pub struct HandlerCatalog {
    factories: HashMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerCatalog").field("kinds", &kinds).finish()
    }
}

impl Default for HandlerCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HandlerCatalog {
    /// Create an empty catalog
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a catalog with the built-in `command` and `echo` kinds
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        catalog.register("command", |manifest, dir| {
            Ok(Arc::new(CommandHandler::from_manifest(manifest, dir)?) as Arc<dyn Handler>)
        });
        catalog.register("echo", |manifest, _dir| {
            Ok(Arc::new(EchoHandler::new(manifest.requirements.clone())) as Arc<dyn Handler>)
        });
        catalog
    }

    /// Register a factory; replaces an existing one of the same kind
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest, &Path) -> Result<Arc<dyn Handler>, ManifestError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build the handler a manifest describes
    pub fn build(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> Result<Arc<dyn Handler>, ManifestError> {
        let factory =
            self.factories
                .get(&manifest.handler)
                .ok_or_else(|| ManifestError::InvalidFormat {
                    reason: format!("unknown handler kind '{}'", manifest.handler),
                })?;
        factory(manifest, plugin_dir)
    }
}

/// Logs every sub-step it receives
#[derive(Debug, Default)]
pub struct EchoHandler {
    requirements: Option<Requirements>,
}

impl EchoHandler {
    pub fn new(requirements: Option<Requirements>) -> Self {
        Self { requirements }
    }
}

impl Handler for EchoHandler {
    fn run(&self, sub_step: &StepParams, payload: &Payload, ctx: &RunContext) -> Result<(), HandlerError> {
        ctx.check()?;
        info!(
            "[{}] {}",
            payload.library,
            serde_json::Value::Object(sub_step.clone())
        );
        Ok(())
    }

    fn extra_requirements(&self) -> Option<Requirements> {
        self.requirements.clone()
    }
}

/// Runs an external program once per sub-step.
///
/// Options:
///
/// | Option    | Meaning                                              |
/// |-----------|------------------------------------------------------|
/// | `program` | Executable, relative paths resolve against the plugin directory |
/// | `args`    | Argument templates; `{field}` reads a sub-step field |
/// | `env`     | Environment templates, same substitution             |
///
/// Every scalar sub-step field is also exported as `STEP_<FIELD>` (upper
/// case).
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    valid_exit_codes: Vec<i32>,
    requirements: Option<Requirements>,
}

impl CommandHandler {
    pub fn from_manifest(manifest: &PluginManifest, plugin_dir: &Path) -> Result<Self, ManifestError> {
        let program = manifest
            .option_str("program")
            .ok_or_else(|| ManifestError::InvalidFormat {
                reason: "command handler requires a 'program' option".to_string(),
            })?;
        let program = Path::new(program);
        let program = if program.is_relative() && program.components().count() > 1 {
            plugin_dir.join(program)
        } else if program.is_relative() && plugin_dir.join(program).is_file() {
            plugin_dir.join(program)
        } else {
            program.to_path_buf()
        };

        let args = match manifest.options.get("args") {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ManifestError::InvalidFormat {
                            reason: "'args' entries must be strings".to_string(),
                        })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(ManifestError::InvalidFormat {
                    reason: "'args' must be a list of strings".to_string(),
                });
            }
        };

        let env = match manifest.options.get("env") {
            None => Vec::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_string()))
                        .ok_or_else(|| ManifestError::InvalidFormat {
                            reason: format!("env value for '{}' must be a string", k),
                        })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(ManifestError::InvalidFormat {
                    reason: "'env' must be a mapping".to_string(),
                });
            }
        };

        Ok(Self {
            program,
            args,
            env,
            valid_exit_codes: manifest.valid_exit_codes.clone(),
            requirements: manifest.requirements.clone(),
        })
    }

    /// Build the concrete command for one sub-step
    pub fn command_for(&self, sub_step: &StepParams) -> Result<CommandSpec, HandlerError> {
        let lookup = |name: &str| sub_step.get(name).map(scalar_text);

        let args = self
            .args
            .iter()
            .map(|a| template::render_with(a, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HandlerError::InvalidStep(e.to_string()))?;

        let mut env: Vec<(String, String)> = sub_step
            .iter()
            .filter(|(_, v)| !v.is_object() && !v.is_array())
            .map(|(k, v)| (format!("STEP_{}", k.to_uppercase()), scalar_text(v)))
            .collect();
        for (key, value) in &self.env {
            let value = template::render_with(value, lookup)
                .map_err(|e| HandlerError::InvalidStep(e.to_string()))?;
            env.push((key.clone(), value));
        }

        Ok(CommandSpec {
            program: self.program.clone(),
            args,
            env,
        })
    }
}

impl Handler for CommandHandler {
    fn run(&self, sub_step: &StepParams, payload: &Payload, ctx: &RunContext) -> Result<(), HandlerError> {
        let spec = self.command_for(sub_step)?;
        let output = command_runner::run_command(&spec, ctx)?;

        match output.exit_code {
            Some(code) if self.valid_exit_codes.contains(&code) => Ok(()),
            code => Err(HandlerError::Failed(format!(
                "{} exited with {} for {}: {}",
                spec.program.display(),
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                payload.library,
                output.stderr.trim()
            ))),
        }
    }

    fn extra_requirements(&self) -> Option<Requirements> {
        self.requirements.clone()
    }
}

/// Text form of a JSON value: strings unquoted, everything else as JSON
pub fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
