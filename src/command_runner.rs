//! External program execution for command handlers
//!
//! `run_command` is the only place handler processes are spawned. It ensures:
//!
//! - Process group isolation, so a whole process tree can be signalled
//! - PID registration with the global [`ChildRegistry`] for cleanup
//! - Cancellation and deadline enforcement until the program's output closes
//! - No member of the process group outlives the invocation

use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::handler::{HandlerError, RunContext};
use crate::process_guard::{self, ChildRegistry, CommandProcessGroup};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Output from a finished program
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Spawn `spec` and wait for it, honouring the context's cancellation token
/// and deadline.
///
/// A non-zero exit is not an error here; callers decide which codes count as
/// success. Cancellation and timeout terminate the process group and return
/// `HandlerError::Cancelled` / `HandlerError::Timeout`.
pub fn run_command(spec: &CommandSpec, ctx: &RunContext) -> Result<CommandOutput, HandlerError> {
    ctx.check()?;

    debug!(
        "run_command: {} args={:?} env={:?}",
        spec.program.display(),
        spec.args,
        spec.env
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd.spawn()?;
    let pid = child.id();
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = wait_for(&mut child, ctx)
        .and_then(|status| wait_for_output(pid, [&stdout, &stderr], ctx).map(|()| status));

    if process_guard::is_group_alive(pid) {
        debug!("Terminating leftover members of process group {}", pid);
        process_guard::terminate_group(pid, KILL_GRACE);
    }

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let status = waited?;
    let output = CommandOutput {
        stdout: collect(stdout),
        stderr: collect(stderr),
        exit_code: status.code(),
        success: status.success(),
    };

    info!(
        "{} finished with exit code {:?}",
        spec.program.display(),
        output.exit_code
    );
    Ok(output)
}

fn wait_for(child: &mut Child, ctx: &RunContext) -> Result<ExitStatus, HandlerError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return settle(status, ctx);
        }

        if let Err(err) = ctx.check() {
            debug!("Stopping process group {}: {}", child.id(), err);
            process_guard::terminate_group(child.id(), KILL_GRACE);
            let _ = child.wait();
            return Err(err);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// A leader killed by a signal while the run is cancelled was stopped by
/// the abort, not by its own failure.
fn settle(status: ExitStatus, ctx: &RunContext) -> Result<ExitStatus, HandlerError> {
    if status.signal().is_some() && ctx.cancel.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }
    Ok(status)
}

/// Background children may hold the pipes open after the leader exits;
/// keep enforcing the deadline until both readers finish.
fn wait_for_output(
    pgid: u32,
    readers: [&Option<JoinHandle<String>>; 2],
    ctx: &RunContext,
) -> Result<(), HandlerError> {
    while readers
        .iter()
        .any(|reader| reader.as_ref().is_some_and(|h| !h.is_finished()))
    {
        if let Err(err) = ctx.check() {
            debug!("Output of process group {} still open: {}", pgid, err);
            process_guard::terminate_group(pgid, KILL_GRACE);
            return Err(err);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
