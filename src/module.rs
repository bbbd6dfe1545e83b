//! Module definitions: loading, templating and the in-memory task structure.
//!
//! A module is a YAML document with `{NAME}` placeholders:
//!
//! ```yaml
//! info:
//!   name: http_status
//!   profiles: [http]
//! payloads:
//!   - library: http_scan
//!     steps:
//!       - - target: "{HOST}"
//!           port: { each: [80, 443] }
//! ```
//!
//! Loading reads the file, substitutes placeholders from the caller's inputs,
//! parses the result and expands iteration constructs, in that order. Nothing
//! is dispatched here; see [`crate::dispatch`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::dispatch::{DispatchError, Dispatcher, RunSummary};
use crate::expand::{self, ExpandError};
use crate::template::{self, TemplateError};

/// Placeholder name → substitution value
pub type Inputs = HashMap<String, String>;

/// Parameter bag passed verbatim to a handler
pub type StepParams = serde_json::Map<String, serde_json::Value>;

/// File extension of module definitions under the modules root
pub const MODULE_EXTENSION: &str = "yaml";

/// Errors raised while loading a module definition
#[derive(Error, Debug)]
pub enum LoadError {
    /// Definition file could not be read
    #[error("cannot read module '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A placeholder in the definition has no input value
    #[error("missing module parameter '{name}'")]
    MissingParameter { name: String },

    /// Substituted text is not a valid module definition
    #[error("invalid module definition: {reason}")]
    Parse { reason: String },

    /// An iteration construct is malformed
    #[error("cannot expand steps: {0}")]
    Expand(#[from] ExpandError),
}

impl From<TemplateError> for LoadError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::Missing { name } => LoadError::MissingParameter { name },
        }
    }
}

impl From<serde_yaml::Error> for LoadError {
    fn from(err: serde_yaml::Error) -> Self {
        LoadError::Parse {
            reason: err.to_string(),
        }
    }
}

/// An ordered batch of sub-steps executed under one payload.
///
/// In a definition a step is written either as a single mapping or as a
/// sequence of mappings; both forms become a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStepGroup", into = "Vec<StepParams>")]
pub struct StepGroup {
    sub_steps: Vec<StepParams>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStepGroup {
    Group(Vec<StepParams>),
    Single(StepParams),
}

impl From<RawStepGroup> for StepGroup {
    fn from(raw: RawStepGroup) -> Self {
        match raw {
            RawStepGroup::Group(sub_steps) => Self { sub_steps },
            RawStepGroup::Single(step) => Self {
                sub_steps: vec![step],
            },
        }
    }
}

impl From<StepGroup> for Vec<StepParams> {
    fn from(group: StepGroup) -> Self {
        group.sub_steps
    }
}

impl StepGroup {
    pub fn new(sub_steps: Vec<StepParams>) -> Self {
        Self { sub_steps }
    }

    pub fn len(&self) -> usize {
        self.sub_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_steps.is_empty()
    }

    pub fn sub_steps(&self) -> &[StepParams] {
        &self.sub_steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepParams> {
        self.sub_steps.iter()
    }

    pub fn into_inner(self) -> Vec<StepParams> {
        self.sub_steps
    }
}

/// One execution unit: a library and the step groups run against it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Canonical plugin name (`<name>_<category>`)
    pub library: String,

    /// Step groups, in execution order
    pub steps: Vec<StepGroup>,

    /// Any other keys of the payload record, visible to the handler
    #[serde(flatten)]
    pub extra: StepParams,
}

impl Payload {
    /// Total number of sub-steps across all groups
    pub fn sub_step_count(&self) -> usize {
        self.steps.iter().map(StepGroup::len).sum()
    }
}

/// Descriptive metadata carried by a module definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Option<f64>,
    #[serde(default)]
    pub reference: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Parsed module definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleContent {
    #[serde(default)]
    pub info: ModuleInfo,

    pub payloads: Vec<Payload>,

    #[serde(skip)]
    expanded: bool,
}

impl ModuleContent {
    /// Parse substituted YAML text. Iteration constructs are left raw.
    pub fn from_yaml(text: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Substitute `inputs` into `raw`, parse, and expand the steps.
    pub fn from_template(raw: &str, inputs: &Inputs) -> Result<Self, LoadError> {
        let text = template::render(raw, inputs)?;
        let mut content = Self::from_yaml(&text)?;
        content.generate_loops()?;
        Ok(content)
    }

    /// Replace raw step groups with expanded ones. Applied at most once.
    pub fn generate_loops(&mut self) -> Result<(), ExpandError> {
        if self.expanded {
            return Ok(());
        }
        let payloads = std::mem::take(&mut self.payloads);
        self.payloads = expand::expand(payloads)?;
        self.expanded = true;
        Ok(())
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }
}

/// A loaded, parameterized task definition
#[derive(Debug, Clone)]
pub struct Module {
    path: PathBuf,
    inputs: Inputs,
    content: Option<ModuleContent>,
}

impl Module {
    /// Create an unloaded module
    pub fn new(path: impl Into<PathBuf>, inputs: Inputs) -> Self {
        Self {
            path: path.into(),
            inputs,
            content: None,
        }
    }

    /// Create and load a module in one go
    pub fn open(path: impl Into<PathBuf>, inputs: Inputs) -> Result<Self, LoadError> {
        let mut module = Self::new(path, inputs);
        module.load()?;
        Ok(module)
    }

    /// Wrap content that was already parsed elsewhere
    pub fn from_content(path: impl Into<PathBuf>, content: ModuleContent) -> Self {
        Self {
            path: path.into(),
            inputs: Inputs::new(),
            content: Some(content),
        }
    }

    /// Read, template, parse and expand the definition.
    ///
    /// On failure `content` is left untouched.
    pub fn load(&mut self) -> Result<(), LoadError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| LoadError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        let content = ModuleContent::from_template(&raw, &self.inputs)?;
        debug!(
            "Loaded module {} with {} payload(s)",
            self.path.display(),
            content.payloads.len()
        );
        self.content = Some(content);
        Ok(())
    }

    /// Map a canonical module name (`<name>_<category>`) to its definition
    /// file under `modules_root`. The category is the text after the last
    /// underscore.
    pub fn resolve_path(modules_root: &Path, canonical: &str) -> Option<PathBuf> {
        let (name, category) = canonical.rsplit_once('_')?;
        if name.is_empty() || category.is_empty() {
            return None;
        }
        Some(
            modules_root
                .join(category)
                .join(format!("{}.{}", name, MODULE_EXTENSION)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn content(&self) -> Option<&ModuleContent> {
        self.content.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    /// Take the parsed content out of the module
    pub fn into_content(self) -> Option<ModuleContent> {
        self.content
    }

    /// Run every payload through `dispatcher`
    pub fn start(self, dispatcher: &Dispatcher<'_>) -> Result<RunSummary, DispatchError> {
        dispatcher.start(self)
    }
}
