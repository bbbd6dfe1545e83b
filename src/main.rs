//! modrun - main entry point

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use modrun::alert::{Alert, TracingAlert};
use modrun::bootstrap::Bootstrap;
use modrun::cli::{Cli, Commands};
use modrun::config::EngineConfig;
use modrun::dispatch::Dispatcher;
use modrun::error::{ModrunError, Result};
use modrun::handler::{CancelToken, HandlerCatalog};
use modrun::introspect;
use modrun::module::{Inputs, LoadError, Module};
use modrun::process_guard::{self, ProcessGuard};
use modrun::registry::PluginRegistry;
use modrun::template;

/// Install the tracing subscriber; RUST_LOG wins over `--verbose`
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    debug!("CLI arguments parsed");

    if let Err(e) = run(cli) {
        TracingAlert::new(e.exit_code()).die(&e.to_string());
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(plugins) = cli.plugins {
        config.plugins_root = plugins;
    }
    if let Some(backend) = cli.database {
        config.database.backend = backend;
    }

    match cli.command {
        Commands::Run {
            module,
            inputs,
            workers,
            timeout,
            retries,
            skip_bootstrap,
        } => {
            if let Some(workers) = workers {
                config.dispatch.workers = workers;
            }
            if let Some(timeout) = timeout {
                config.dispatch.timeout_secs = Some(timeout);
            }
            if let Some(retries) = retries {
                config.dispatch.retries = retries;
            }
            config
                .validate()
                .map_err(|e| ModrunError::config(format!("{:#}", e)))?;

            if skip_bootstrap {
                warn!("Bootstrap skipped");
            } else {
                Bootstrap::new().run_or_die(&config, &TracingAlert::default());
            }
            run_module(&config, &module, inputs.into_iter().collect())
        }
        Commands::Validate { module, inputs } => {
            validate_module(&config, &module, inputs.into_iter().collect())
        }
        Commands::List { graphs } => {
            let registry = discover(&config)?;
            let names = if graphs {
                registry.discover_graphs()
            } else {
                registry.discover_modules()
            };
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Args { api, categories } => {
            let registry = discover(&config)?;
            let categories: Vec<&str> = categories.iter().map(String::as_str).collect();
            let alert = TracingAlert::default();
            let schemas = introspect::describe(&registry, &categories, &alert);
            if api {
                print!("{}", schemas.to_api_text());
            } else {
                schemas.report(&alert);
            }
            Ok(())
        }
        Commands::Bootstrap => {
            let report = Bootstrap::new().run(&config)?;
            info!(
                "Environment ready ({} database, {} directories)",
                report.backend,
                report.directories.len()
            );
            Ok(())
        }
        Commands::Config { save } => match save {
            Some(path) => {
                config
                    .save_to_file(&path)
                    .map_err(|e| ModrunError::config(format!("{:#}", e)))?;
                info!("Configuration written to {}", path.display());
                Ok(())
            }
            None => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::load(path).map_err(|e| ModrunError::config(format!("{:#}", e)))
}

fn discover(config: &EngineConfig) -> Result<PluginRegistry> {
    Ok(PluginRegistry::discover(
        &config.plugins_root,
        HandlerCatalog::with_builtins(),
    )?)
}

/// A module reference is either a file path or a canonical module name
fn locate_module(config: &EngineConfig, reference: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(reference);
    if direct.is_file() {
        return Ok(direct);
    }
    Module::resolve_path(&config.modules_root, reference)
        .filter(|p| p.is_file())
        .ok_or_else(|| {
            ModrunError::general(format!(
                "module '{}' not found (looked under {})",
                reference,
                config.modules_root.display()
            ))
        })
}

/// Load a module; on a missing input, list every input the file expects
fn open_module(path: &Path, inputs: Inputs) -> Result<Module> {
    match Module::open(path, inputs) {
        Ok(module) => Ok(module),
        Err(e @ LoadError::MissingParameter { .. }) => {
            if let Ok(raw) = std::fs::read_to_string(path) {
                warn!(
                    "{} expects inputs: {}",
                    path.display(),
                    template::placeholders(&raw).join(", ")
                );
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn validate_module(config: &EngineConfig, reference: &str, inputs: Inputs) -> Result<()> {
    let path = locate_module(config, reference)?;
    let module = open_module(&path, inputs)?;
    if let Some(content) = module.content() {
        let sub_steps: usize = content.payloads.iter().map(|p| p.sub_step_count()).sum();
        info!(
            "{} is valid: {} payload(s), {} sub-step(s)",
            path.display(),
            content.payloads.len(),
            sub_steps
        );
    }
    Ok(())
}

fn run_module(config: &EngineConfig, reference: &str, inputs: Inputs) -> Result<()> {
    let path = locate_module(config, reference)?;
    let registry = discover(config)?;
    let module = open_module(&path, inputs)?;

    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let dispatcher = Dispatcher::new(&registry, config.dispatch.options()).with_cancel(cancel);
    let summary = module.start(&dispatcher)?;
    info!(
        "Done: {} payload(s), {} group(s), {} sub-step(s)",
        summary.payloads, summary.groups, summary.sub_steps
    );
    Ok(())
}
