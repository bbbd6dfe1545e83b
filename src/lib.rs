//! modrun library
//!
//! Loads declarative task modules, resolves each payload's library against a
//! plugin registry discovered on disk, and dispatches the expanded steps to
//! typed handlers.

pub mod alert;
pub mod bootstrap;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod handler;
pub mod introspect;
pub mod manifest;
pub mod module;
pub mod process_guard;
pub mod registry;
pub mod template;

// Re-export main types for convenience
pub use alert::{Alert, RecordingAlert, TracingAlert};
pub use config::{DatabaseBackend, EngineConfig};
pub use dispatch::{DispatchError, DispatchOptions, Dispatcher, RunSummary};
pub use error::ModrunError;
pub use handler::{CancelToken, Handler, HandlerCatalog, HandlerError, RunContext};
pub use introspect::{ArgumentSchemas, describe};
pub use manifest::{ManifestError, PluginManifest, Requirements};
pub use module::{Inputs, LoadError, Module, ModuleContent, Payload, StepGroup, StepParams};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use registry::{PluginRegistry, RegistryError, ResolveError};
