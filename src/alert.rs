//! User-facing alerts
//!
//! Introspection and bootstrap report through an [`Alert`] rather than
//! calling the logger directly, so callers decide where messages go. `die`
//! ends the process.

use std::sync::Mutex;
use tracing::{error, info, warn};

pub trait Alert {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn die(&self, message: &str) -> !;
}

/// Sends alerts to the tracing subscriber; `die` exits with `exit_code`
#[derive(Debug, Clone, Copy)]
pub struct TracingAlert {
    exit_code: i32,
}

impl TracingAlert {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl Default for TracingAlert {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Alert for TracingAlert {
    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
    }

    fn die(&self, message: &str) -> ! {
        error!("{}", message);
        std::process::exit(self.exit_code)
    }
}

/// Severity of a recorded alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
}

/// Keeps alerts in memory; `die` panics.
///
/// Used by tests and by callers that want to post-process messages.
#[derive(Debug, Default)]
pub struct RecordingAlert {
    messages: Mutex<Vec<(Level, String)>>,
}

impl RecordingAlert {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: Level, message: &str) {
        let mut messages = match self.messages.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages.push((level, message.to_string()));
    }

    pub fn messages(&self) -> Vec<(Level, String)> {
        match self.messages.lock() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages recorded at `level`
    pub fn at(&self, level: Level) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }
}

impl Alert for RecordingAlert {
    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn die(&self, message: &str) -> ! {
        panic!("die: {}", message)
    }
}
