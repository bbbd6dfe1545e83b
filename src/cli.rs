use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use strum::IntoEnumIterator;

use crate::config::DatabaseBackend;

/// modrun - run declarative task modules against discovered plugins
#[derive(Parser)]
#[command(name = "modrun")]
#[command(about = "Load task modules and dispatch their steps to plugin handlers")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Plugin root directory, overrides the configuration
    #[arg(long, global = true)]
    pub plugins: Option<PathBuf>,

    /// Database backend, overrides the configuration
    #[arg(long, global = true, value_parser = parse_backend)]
    pub database: Option<DatabaseBackend>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a module and dispatch every payload
    Run {
        /// Module file, or a canonical name (`<name>_<category>`) under the modules root
        module: String,

        /// Placeholder value, may be repeated
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        /// Run sub-steps of a group on this many threads
        #[arg(long)]
        workers: Option<usize>,

        /// Per-sub-step timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra attempts for failed sub-steps
        #[arg(long)]
        retries: Option<u32>,

        /// Do not check binaries, directories or the database first
        #[arg(long)]
        skip_bootstrap: bool,
    },
    /// Load a module without dispatching it
    Validate {
        /// Module file, or a canonical name under the modules root
        module: String,

        /// Placeholder value, may be repeated
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },
    /// List discovered plugins
    List {
        /// List graph plugins instead
        #[arg(long)]
        graphs: bool,
    },
    /// Describe the parameters each plugin accepts
    Args {
        /// Print `name=value1,value2` lines for API clients
        #[arg(long)]
        api: bool,

        /// Category to describe, may be repeated (default: brute, scan, vuln)
        #[arg(long = "category", value_name = "CATEGORY")]
        categories: Vec<String>,
    },
    /// Check binaries, create directories and provision the database
    Bootstrap,
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to this file instead
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

/// Parse `KEY=VALUE`
fn parse_input(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn parse_backend(raw: &str) -> Result<DatabaseBackend, String> {
    DatabaseBackend::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
        let known: Vec<String> = DatabaseBackend::iter().map(|b| b.to_string()).collect();
        format!("unknown backend '{}', expected one of: {}", raw, known.join(", "))
    })
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
