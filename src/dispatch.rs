//! Dispatch engine
//!
//! Walks a loaded module in the order payload → step group → sub-step and
//! hands each sub-step to the handler of the payload's library.
//!
//! Failure is fail-fast at every level: an unknown library, a handler that
//! cannot be built, or a handler error aborts the whole run. Payloads that
//! come after the failing one are never looked at.
//!
//! With `workers > 1` the sub-steps of one group run on a scoped thread pool.
//! The group is a barrier: the next group starts only after every sub-step of
//! the current one has finished. A failing sub-step raises the run's cancel
//! token so in-flight handlers can stop and queued sub-steps never start.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::handler::{CancelToken, Handler, HandlerError, RunContext};
use crate::module::{Module, Payload, StepGroup, StepParams};
use crate::registry::{PluginRegistry, ResolveError};

/// Errors that abort a module run
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The module was never loaded
    #[error("module '{path}' is not loaded")]
    NotLoaded { path: String },

    /// A payload names a library the registry does not know
    #[error("payload {index}: unknown library '{library}'")]
    UnknownLibrary { index: usize, library: String },

    /// The library is known but its handler could not be built
    #[error("payload {index}: cannot resolve '{library}': {source}")]
    Resolution {
        index: usize,
        library: String,
        #[source]
        source: ResolveError,
    },

    /// A handler failed on a sub-step
    #[error("payload {index} ({library}), group {group}, sub-step {sub_step}: {source}")]
    HandlerInvocation {
        index: usize,
        library: String,
        group: usize,
        sub_step: usize,
        #[source]
        source: HandlerError,
    },

    /// The run was aborted from outside
    #[error("module run cancelled")]
    Cancelled,
}

/// Knobs for one dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Sub-steps of one group run on up to this many threads
    pub workers: usize,
    /// Per-sub-step deadline
    pub timeout: Option<Duration>,
    /// Extra attempts for retryable handler errors
    pub retries: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: None,
            retries: 0,
        }
    }
}

/// Counts of what a successful run executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub payloads: usize,
    pub groups: usize,
    pub sub_steps: usize,
}

/// Runs modules against a plugin registry
pub struct Dispatcher<'a> {
    registry: &'a PluginRegistry,
    options: DispatchOptions,
    cancel: CancelToken,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a PluginRegistry, options: DispatchOptions) -> Self {
        Self {
            registry,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned token, e.g. one wired to signal handlers
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts every run started from this dispatcher
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Execute every payload of `module`
    pub fn start(&self, module: Module) -> Result<RunSummary, DispatchError> {
        let path = module.path().display().to_string();
        let content = module
            .into_content()
            .ok_or(DispatchError::NotLoaded { path: path.clone() })?;

        info!(
            "Starting module {} ({} payload(s))",
            content.info.name.as_deref().unwrap_or(&path),
            content.payloads.len()
        );

        let run_token = self.cancel.child();
        let mut summary = RunSummary::default();

        for (index, payload) in content.payloads.iter().enumerate() {
            self.check_cancelled()?;

            if !self.registry.contains(&payload.library) {
                error!("Payload {}: unknown library '{}'", index, payload.library);
                return Err(DispatchError::UnknownLibrary {
                    index,
                    library: payload.library.clone(),
                });
            }

            let handler = self
                .registry
                .resolve(&payload.library)
                .map_err(|source| DispatchError::Resolution {
                    index,
                    library: payload.library.clone(),
                    source,
                })?;

            debug!(
                "Payload {}: {} with {} group(s)",
                index,
                payload.library,
                payload.steps.len()
            );

            for (group_index, group) in payload.steps.iter().enumerate() {
                self.run_group(handler.as_ref(), payload, group, &run_token)
                    .map_err(|(sub_step, source)| {
                        self.invocation_error(index, payload, group_index, sub_step, source)
                    })?;
                summary.groups += 1;
                summary.sub_steps += group.len();
            }
            summary.payloads += 1;
        }

        info!(
            "Module finished: {} payload(s), {} group(s), {} sub-step(s)",
            summary.payloads, summary.groups, summary.sub_steps
        );
        Ok(summary)
    }

    fn check_cancelled(&self) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }

    fn invocation_error(
        &self,
        index: usize,
        payload: &Payload,
        group: usize,
        sub_step: usize,
        source: HandlerError,
    ) -> DispatchError {
        if matches!(source, HandlerError::Cancelled) && self.cancel.is_cancelled() {
            warn!("Module run cancelled during {}", payload.library);
            return DispatchError::Cancelled;
        }
        error!(
            "{} failed on group {} sub-step {}: {}",
            payload.library, group, sub_step, source
        );
        DispatchError::HandlerInvocation {
            index,
            library: payload.library.clone(),
            group,
            sub_step,
            source,
        }
    }

    /// Run one group to completion. Errors carry the failing sub-step index.
    fn run_group(
        &self,
        handler: &dyn Handler,
        payload: &Payload,
        group: &StepGroup,
        run_token: &CancelToken,
    ) -> Result<(), (usize, HandlerError)> {
        let workers = self.options.workers.min(group.len());
        if workers <= 1 {
            for (i, sub_step) in group.iter().enumerate() {
                self.invoke(handler, sub_step, payload, run_token)
                    .map_err(|e| (i, e))?;
            }
            return Ok(());
        }

        let next = AtomicUsize::new(0);
        let failure: Mutex<Option<(usize, HandlerError)>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if run_token.is_cancelled() {
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(sub_step) = group.sub_steps().get(i) else {
                            break;
                        };
                        if let Err(err) = self.invoke(handler, sub_step, payload, run_token) {
                            run_token.cancel();
                            record_failure(&failure, i, err);
                            break;
                        }
                    }
                });
            }
        });

        let failure = match failure.into_inner() {
            Ok(failure) => failure,
            Err(poisoned) => poisoned.into_inner(),
        };
        match failure {
            Some(failure) => Err(failure),
            None if self.cancel.is_cancelled() => Err((0, HandlerError::Cancelled)),
            None => Ok(()),
        }
    }

    /// Call the handler, retrying retryable failures
    fn invoke(
        &self,
        handler: &dyn Handler,
        sub_step: &StepParams,
        payload: &Payload,
        run_token: &CancelToken,
    ) -> Result<(), HandlerError> {
        let mut attempt = 0;
        loop {
            let mut ctx = RunContext::new(run_token.clone(), self.options.timeout);
            ctx.attempt = attempt;
            ctx.check()?;

            match handler.run(sub_step, payload, &ctx) {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.is_retryable()
                        && attempt < self.options.retries
                        && !run_token.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retrying ({}/{})",
                        payload.library, err, attempt, self.options.retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Keep the first real failure; a sibling's `Cancelled` is only a symptom
fn record_failure(slot: &Mutex<Option<(usize, HandlerError)>>, index: usize, err: HandlerError) {
    let mut slot = match slot.lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    let replace = match slot.as_ref() {
        None => true,
        Some((_, HandlerError::Cancelled)) => !matches!(err, HandlerError::Cancelled),
        Some(_) => false,
    };
    if replace {
        *slot = Some((index, err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleContent;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    /// Records every sub-step's `id` field
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Handler for Recorder {
        fn run(&self, sub_step: &StepParams, payload: &Payload, _ctx: &RunContext) -> Result<(), HandlerError> {
            let id = sub_step
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", payload.library, id));
            Ok(())
        }
    }

    /// Fails on the sub-step whose `id` is `bad`
    struct FailOn {
        calls: AtomicU32,
    }

    impl Handler for FailOn {
        fn run(&self, sub_step: &StepParams, _payload: &Payload, _ctx: &RunContext) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if sub_step.get("id").and_then(|v| v.as_str()) == Some("bad") {
                return Err(HandlerError::failed("boom"));
            }
            Ok(())
        }
    }

    /// Fails the first `failures` calls
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Handler for Flaky {
        fn run(&self, _sub_step: &StepParams, _payload: &Payload, _ctx: &RunContext) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(HandlerError::failed("flaky"));
            }
            Ok(())
        }
    }

    /// Waits until cancelled
    struct Patient;

    impl Handler for Patient {
        fn run(&self, _sub_step: &StepParams, _payload: &Payload, ctx: &RunContext) -> Result<(), HandlerError> {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(10) {
                ctx.check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    fn module(yaml: &str) -> Module {
        let mut content = ModuleContent::from_yaml(yaml).unwrap();
        content.generate_loops().unwrap();
        Module::from_content("test.yaml", content)
    }

    fn seen(recorder: &Recorder) -> Vec<String> {
        recorder.seen.lock().unwrap().clone()
    }

    // =========================================================================
    // Ordering Tests
    // =========================================================================

    #[test]
    fn test_groups_and_sub_steps_run_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::default();
        registry.register("scan", "rec", recorder.clone());

        let module = module(
            r#"
payloads:
  - library: rec_scan
    steps:
      - [{id: a}, {id: b}]
      - [{id: c}]
"#,
        );
        let summary = Dispatcher::new(&registry, DispatchOptions::default())
            .start(module)
            .unwrap();

        assert_eq!(seen(&recorder), vec!["rec_scan:a", "rec_scan:b", "rec_scan:c"]);
        assert_eq!(
            summary,
            RunSummary {
                payloads: 1,
                groups: 2,
                sub_steps: 3
            }
        );
    }

    #[test]
    fn test_expanded_sub_steps_dispatched() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::default();
        registry.register("scan", "rec", recorder.clone());

        let module = module(
            r#"
payloads:
  - library: rec_scan
    steps:
      - id: {each: [x, y, z]}
"#,
        );
        let summary = Dispatcher::new(&registry, DispatchOptions::default())
            .start(module)
            .unwrap();
        assert_eq!(summary.sub_steps, 3);
        assert_eq!(seen(&recorder), vec!["rec_scan:x", "rec_scan:y", "rec_scan:z"]);
    }

    // =========================================================================
    // Fail-fast Tests
    // =========================================================================

    #[test]
    fn test_unknown_library_aborts_remaining_payloads() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::default();
        registry.register("scan", "rec", recorder.clone());

        let module = module(
            r#"
payloads:
  - library: rec_scan
    steps: [[{id: p1}]]
  - library: nope_scan
    steps: [[{id: p2}]]
  - library: rec_scan
    steps: [[{id: p3}]]
"#,
        );
        let result = Dispatcher::new(&registry, DispatchOptions::default()).start(module);

        match result {
            Err(DispatchError::UnknownLibrary { index, library }) => {
                assert_eq!(index, 1);
                assert_eq!(library, "nope_scan");
            }
            other => panic!("expected UnknownLibrary, got {:?}", other),
        }
        assert_eq!(seen(&recorder), vec!["rec_scan:p1"]);
    }

    #[test]
    fn test_handler_failure_stops_group() {
        let handler = Arc::new(FailOn {
            calls: AtomicU32::new(0),
        });
        let mut registry = PluginRegistry::default();
        registry.register("scan", "fail", handler.clone());

        let module = module(
            r#"
payloads:
  - library: fail_scan
    steps:
      - [{id: ok}, {id: bad}, {id: never}]
      - [{id: never}]
"#,
        );
        let result = Dispatcher::new(&registry, DispatchOptions::default()).start(module);

        match result {
            Err(DispatchError::HandlerInvocation {
                group, sub_step, ..
            }) => {
                assert_eq!(group, 0);
                assert_eq!(sub_step, 1);
            }
            other => panic!("expected HandlerInvocation, got {:?}", other),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unresolvable_library_is_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scan").join("alien");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("engine.json"), r#"{"handler": "telepathy"}"#).unwrap();

        let registry =
            PluginRegistry::discover(tmp.path(), crate::handler::HandlerCatalog::with_builtins())
                .unwrap();
        let module = module("payloads: [{library: alien_scan, steps: [[{id: a}]]}]");
        let result = Dispatcher::new(&registry, DispatchOptions::default()).start(module);
        assert!(matches!(result, Err(DispatchError::Resolution { index: 0, .. })));
    }

    #[test]
    fn test_unloaded_module_rejected() {
        let registry = PluginRegistry::default();
        let result = Dispatcher::new(&registry, DispatchOptions::default())
            .start(Module::new("never.yaml", Default::default()));
        assert!(matches!(result, Err(DispatchError::NotLoaded { .. })));
    }

    #[test]
    fn test_cancelled_dispatcher() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::default();
        registry.register("scan", "rec", recorder.clone());

        let dispatcher = Dispatcher::new(&registry, DispatchOptions::default());
        dispatcher.cancel_token().cancel();

        let result = dispatcher.start(module("payloads: [{library: rec_scan, steps: [[{id: a}]]}]"));
        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert!(seen(&recorder).is_empty());
    }

    // =========================================================================
    // Retry Tests
    // =========================================================================

    #[test]
    fn test_retries_recover_flaky_handler() {
        let handler = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let mut registry = PluginRegistry::default();
        registry.register("scan", "flaky", handler.clone());

        let options = DispatchOptions {
            retries: 2,
            ..Default::default()
        };
        let result = Dispatcher::new(&registry, options)
            .start(module("payloads: [{library: flaky_scan, steps: [[{id: a}]]}]"));
        assert!(result.is_ok());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_retries_by_default() {
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let mut registry = PluginRegistry::default();
        registry.register("scan", "flaky", handler.clone());

        let result = Dispatcher::new(&registry, DispatchOptions::default())
            .start(module("payloads: [{library: flaky_scan, steps: [[{id: a}]]}]"));
        assert!(matches!(result, Err(DispatchError::HandlerInvocation { .. })));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Concurrency Tests
    // =========================================================================

    #[test]
    fn test_worker_pool_group_is_barrier() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::default();
        registry.register("scan", "rec", recorder.clone());

        let options = DispatchOptions {
            workers: 4,
            ..Default::default()
        };
        let module = module(
            r#"
payloads:
  - library: rec_scan
    steps:
      - [{id: a1}, {id: a2}, {id: a3}, {id: a4}, {id: a5}]
      - [{id: b1}, {id: b2}]
"#,
        );
        let summary = Dispatcher::new(&registry, options).start(module).unwrap();
        assert_eq!(summary.sub_steps, 7);

        let seen = seen(&recorder);
        let first_b = seen.iter().position(|s| s.contains(":b")).unwrap();
        assert_eq!(first_b, 5);
        assert!(seen[..5].iter().all(|s| s.contains(":a")));
    }

    #[test]
    fn test_worker_pool_failure_cancels_siblings() {
        struct Mixed;
        impl Handler for Mixed {
            fn run(&self, sub_step: &StepParams, payload: &Payload, ctx: &RunContext) -> Result<(), HandlerError> {
                if sub_step.get("id").and_then(|v| v.as_str()) == Some("bad") {
                    std::thread::sleep(Duration::from_millis(20));
                    return Err(HandlerError::failed("boom"));
                }
                Patient.run(sub_step, payload, ctx)
            }
        }

        let mut registry = PluginRegistry::default();
        registry.register("scan", "mixed", Arc::new(Mixed));

        let options = DispatchOptions {
            workers: 3,
            ..Default::default()
        };
        let start = Instant::now();
        let result = Dispatcher::new(&registry, options)
            .start(module("payloads: [{library: mixed_scan, steps: [[{id: slow}, {id: bad}, {id: slow2}]]}]"));

        match result {
            Err(DispatchError::HandlerInvocation { sub_step, source, .. }) => {
                assert_eq!(sub_step, 1);
                assert!(matches!(source, HandlerError::Failed(_)));
            }
            other => panic!("expected HandlerInvocation, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_reaches_handler() {
        let mut registry = PluginRegistry::default();
        registry.register("scan", "patient", Arc::new(Patient));

        let options = DispatchOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let result = Dispatcher::new(&registry, options)
            .start(module("payloads: [{library: patient_scan, steps: [[{id: a}]]}]"));
        match result {
            Err(DispatchError::HandlerInvocation { source, .. }) => {
                assert!(matches!(source, HandlerError::Timeout(_)));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
