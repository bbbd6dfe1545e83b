//! End-to-end tests: plugin tree on disk → module file → dispatch
//!
//! These tests verify:
//! - Templated modules reach the handler with substituted values
//! - Command plugins run once per expanded sub-step, in order
//! - Fail-fast behaviour across payloads
//! - Introspection over the same registry

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use modrun::alert::{Level, RecordingAlert};
use modrun::dispatch::{DispatchError, DispatchOptions, Dispatcher};
use modrun::handler::{Handler, HandlerCatalog, HandlerError, RunContext};
use modrun::introspect;
use modrun::module::{Inputs, LoadError, Module, Payload, StepParams};
use modrun::registry::PluginRegistry;

// =============================================================================
// Helpers
// =============================================================================

/// Captures (library, sub-step) pairs
#[derive(Default)]
struct Capture {
    calls: Mutex<Vec<(String, StepParams)>>,
}

impl Handler for Capture {
    fn run(&self, sub_step: &StepParams, payload: &Payload, _ctx: &RunContext) -> Result<(), HandlerError> {
        self.calls
            .lock()
            .unwrap()
            .push((payload.library.clone(), sub_step.clone()));
        Ok(())
    }
}

fn write_plugin(root: &Path, category: &str, name: &str, manifest: &str) -> PathBuf {
    let dir = root.join(category).join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("engine.json"), manifest).unwrap();
    dir
}

fn write_module(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("module.yaml");
    fs::write(&path, body).unwrap();
    path
}

fn inputs(pairs: &[(&str, &str)]) -> Inputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Templating Through Dispatch
// =============================================================================

#[test]
fn test_host_placeholder_reaches_handler() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_module(
        tmp.path(),
        r#"
payloads:
  - library: http_scan
    steps:
      - - target: "{HOST}"
"#,
    );

    let capture = Arc::new(Capture::default());
    let mut registry = PluginRegistry::default();
    registry.register("scan", "http", capture.clone());

    let module = Module::open(&path, inputs(&[("HOST", "10.0.0.5")])).unwrap();
    let summary = Dispatcher::new(&registry, DispatchOptions::default())
        .start(module)
        .unwrap();

    assert_eq!(summary.sub_steps, 1);
    let calls = capture.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "http_scan");
    assert_eq!(calls[0].1["target"], serde_json::json!("10.0.0.5"));
}

#[test]
fn test_missing_input_never_dispatches() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_module(
        tmp.path(),
        "payloads: [{library: http_scan, steps: [[{target: \"{HOST}\"}]]}]\n",
    );

    let mut module = Module::new(&path, Inputs::new());
    match module.load() {
        Err(LoadError::MissingParameter { name }) => assert_eq!(name, "HOST"),
        other => panic!("expected MissingParameter, got {:?}", other),
    }
    assert!(!module.is_loaded());
}

// =============================================================================
// Command Plugins
// =============================================================================

#[test]
fn test_command_plugin_runs_each_expanded_sub_step() {
    let tmp = tempfile::tempdir().unwrap();
    let plugins = tmp.path().join("plugins");
    let out = tmp.path().join("out.txt");

    let plugin_dir = plugins.join("scan").join("probe");
    fs::create_dir_all(&plugin_dir).unwrap();
    let script = plugin_dir.join("probe.sh");
    fs::write(&script, "echo \"$1:$2\" >> \"$PROBE_OUT\"\n").unwrap();

    let manifest = serde_json::json!({
        "handler": "command",
        "requirements": {"ports": [80, 443]},
        "options": {
            "program": "bash",
            "args": [script.display().to_string(), "{target}", "{port}"],
            "env": {"PROBE_OUT": out.display().to_string()}
        }
    });
    fs::write(plugin_dir.join("engine.json"), manifest.to_string()).unwrap();

    let path = write_module(
        tmp.path(),
        r#"
payloads:
  - library: probe_scan
    steps:
      - target: "{HOST}"
        port: {each: [80, 443]}
      - target: "{HOST}"
        port: {range: {from: 8000, to: 8002}}
"#,
    );

    let registry = PluginRegistry::discover(&plugins, HandlerCatalog::with_builtins()).unwrap();
    let module = Module::open(&path, inputs(&[("HOST", "example.org")])).unwrap();
    let summary = Dispatcher::new(&registry, DispatchOptions::default())
        .start(module)
        .unwrap();

    assert_eq!(summary.groups, 2);
    assert_eq!(summary.sub_steps, 5);

    let lines: Vec<String> = fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        lines,
        vec![
            "example.org:80",
            "example.org:443",
            "example.org:8000",
            "example.org:8001",
            "example.org:8002",
        ]
    );
}

#[test]
fn test_command_plugin_failure_aborts_run() {
    let tmp = tempfile::tempdir().unwrap();
    let plugins = tmp.path().join("plugins");
    write_plugin(
        &plugins,
        "vuln",
        "fails",
        r#"{"handler": "command", "options": {"program": "bash", "args": ["-c", "exit 7"]}}"#,
    );

    let path = write_module(
        tmp.path(),
        "payloads: [{library: fails_vuln, steps: [[{a: 1}]]}]\n",
    );
    let registry = PluginRegistry::discover(&plugins, HandlerCatalog::with_builtins()).unwrap();
    let module = Module::open(&path, Inputs::new()).unwrap();

    match Dispatcher::new(&registry, DispatchOptions::default()).start(module) {
        Err(DispatchError::HandlerInvocation { library, source, .. }) => {
            assert_eq!(library, "fails_vuln");
            assert!(matches!(source, HandlerError::Failed(_)));
        }
        other => panic!("expected HandlerInvocation, got {:?}", other),
    }
}

// =============================================================================
// Fail-fast Across Payloads
// =============================================================================

#[test]
fn test_unknown_library_between_known_payloads() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_module(
        tmp.path(),
        r#"
payloads:
  - library: known_scan
    steps: [[{n: 1}]]
  - library: missing_scan
    steps: [[{n: 2}]]
  - library: known_scan
    steps: [[{n: 3}]]
"#,
    );

    let capture = Arc::new(Capture::default());
    let mut registry = PluginRegistry::default();
    registry.register("scan", "known", capture.clone());

    let module = Module::open(&path, Inputs::new()).unwrap();
    let result = Dispatcher::new(&registry, DispatchOptions::default()).start(module);

    assert!(matches!(
        result,
        Err(DispatchError::UnknownLibrary { index: 1, .. })
    ));
    let calls = capture.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["n"], serde_json::json!(1));
}

// =============================================================================
// Discovery and Introspection
// =============================================================================

#[test]
fn test_discovery_and_introspection_share_registry() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(
        tmp.path(),
        "brute",
        "ssh",
        r#"{"handler": "echo", "requirements": {"users": ["root"], "ports": [22]}}"#,
    );
    write_plugin(tmp.path(), "scan", "broken", r#"{"handler": 5}"#);
    write_plugin(tmp.path(), "graph", "tree", r#"{"handler": "echo"}"#);
    write_plugin(tmp.path(), "misc", "tool", r#"{"handler": "echo"}"#);

    let registry = PluginRegistry::discover(tmp.path(), HandlerCatalog::with_builtins()).unwrap();
    let names: Vec<String> = registry.discover_modules().into_iter().collect();
    assert_eq!(names, vec!["ssh_brute", "tool_misc", "broken_scan"]);
    assert!(registry.discover_graphs().contains("tree_graph"));

    let alert = RecordingAlert::new();
    let schemas = introspect::describe(&registry, &[], &alert);
    assert_eq!(schemas.to_api_text(), "users=root\nports=22\n");
    assert_eq!(alert.at(Level::Warn).len(), 1);
}

#[test]
fn test_module_path_resolution() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("scan");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("http.yaml"),
        "payloads: [{library: http_scan, steps: [[{target: \"{HOST}\"}]]}]\n",
    )
    .unwrap();

    let path = Module::resolve_path(tmp.path(), "http_scan").unwrap();
    assert!(path.is_file());

    let module = Module::open(&path, inputs(&[("HOST", "localhost")])).unwrap();
    assert_eq!(module.content().unwrap().payloads[0].library, "http_scan");
}
