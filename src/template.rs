//! Placeholder substitution for module definitions and handler arguments.
//!
//! A placeholder is `{NAME}` where `NAME` is an identifier
//! (`[A-Za-z_][A-Za-z0-9_]*`). `{{NAME}}` produces the literal text `{NAME}`.
//! Any other brace text is copied through unchanged, so YAML flow mappings
//! such as `{target: x}` or `{range: {from: 1, to: 4}}` survive templating.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors produced while rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder names a value the caller did not supply
    #[error("no value supplied for placeholder '{name}'")]
    Missing { name: String },
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Render `raw`, replacing each placeholder with the value from `inputs`.
///
/// Fails on the first placeholder that has no entry in `inputs`.
pub fn render(raw: &str, inputs: &HashMap<String, String>) -> Result<String, TemplateError> {
    render_with(raw, |name| inputs.get(name).cloned())
}

/// Render `raw`, resolving placeholders through `lookup`.
pub fn render_with<F>(raw: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;

    for caps in placeholder_pattern().captures_iter(raw) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&raw[last..whole.start()]);
        last = whole.end();

        out.push_str(&replacement(&caps, &mut lookup)?);
    }

    out.push_str(&raw[last..]);
    Ok(out)
}

fn replacement<F>(caps: &Captures<'_>, lookup: &mut F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(escaped) = caps.get(1) {
        return Ok(format!("{{{}}}", escaped.as_str()));
    }
    let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    lookup(name).ok_or_else(|| TemplateError::Missing {
        name: name.to_string(),
    })
}

/// Placeholder names referenced by `raw`, in first-appearance order.
pub fn placeholders(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_pattern().captures_iter(raw) {
        if let Some(name) = caps.get(2) {
            if !names.iter().any(|n| n == name.as_str()) {
                names.push(name.as_str().to_string());
            }
        }
    }
    names
}
