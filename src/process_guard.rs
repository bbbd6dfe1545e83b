//! Lifecycle management for handler child processes
//!
//! Command handlers spawn external programs. When a module run is aborted
//! (a sibling sub-step failed, a timeout fired, or the user pressed Ctrl+C)
//! those programs must not keep running on their own.
//!
//! - Children are spawned in their own process group and receive SIGTERM if
//!   modrun dies (`PR_SET_PDEATHSIG`).
//! - Every running child PID is tracked in a global registry.
//! - Termination sends SIGTERM to the whole group, waits a grace period, then
//!   sends SIGKILL to whatever is left.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::handler::CancelToken;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned handler processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered handler process PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered handler process PID {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Remove and return every tracked PID
    pub fn drain(&mut self) -> Vec<u32> {
        self.pids.drain().collect()
    }
}

/// Terminate every process tracked by the global registry.
///
/// The registry lock is released before signalling so runner threads can
/// keep unregistering while the grace period elapses.
pub fn terminate_all(grace: Duration) {
    let pids = match ChildRegistry::global().lock() {
        Ok(mut registry) => registry.drain(),
        Err(poisoned) => poisoned.into_inner().drain(),
    };
    if pids.is_empty() {
        debug!("No handler processes to terminate");
        return;
    }
    info!("Terminating {} handler process(es)...", pids.len());
    for pid in pids {
        terminate_group(pid, grace);
    }
}

/// SIGTERM the process group led by `pgid`, SIGKILL it after `grace`.
pub fn terminate_group(pgid: u32, grace: Duration) {
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pgid, e);
        if send_signal(pgid, Signal::SIGTERM).is_err() {
            // Already gone
            return;
        }
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_group_alive(pgid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if is_group_alive(pgid) {
        warn!("Process group {} ignored SIGTERM, sending SIGKILL", pgid);
        if send_signal_to_group(pgid, Signal::SIGKILL).is_err() {
            let _ = send_signal(pgid, Signal::SIGKILL);
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID addresses the whole group, reaching grandchildren too
fn send_signal_to_group(pgid: u32, signal: impl Into<Option<Signal>>) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Whether a process exists and is not a zombie
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    match proc_stat(pid) {
        Some((state, _)) => !matches!(state, 'Z' | 'X'),
        None => true,
    }
}

/// Whether any running (non-zombie) process is still in group `pgid`.
///
/// The leader may already be reaped while background children it started
/// keep the group alive.
pub fn is_group_alive(pgid: u32) -> bool {
    if send_signal_to_group(pgid, None::<Signal>).is_err() {
        return false;
    }

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(proc_stat)
        .any(|(state, group)| group == pgid && !matches!(state, 'Z' | 'X'))
}

/// State and process group from `/proc/<pid>/stat`.
///
/// The command name may contain spaces, so fields are read after its closing
/// parenthesis: state, ppid, pgrp.
fn proc_stat(pid: u32) -> Option<(char, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let group = fields.next()?.parse().ok()?;
    Some((state, group))
}

/// RAII guard that terminates all handler processes on drop.
///
/// Held by the binary for the lifetime of a run.
pub struct ProcessGuard {
    grace: Duration,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn child_count(&self) -> usize {
        ChildRegistry::global()
            .lock()
            .map(|r| r.count())
            .unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, terminating leftover handler processes");
        terminate_all(self.grace);
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP.
///
/// The first signal cancels `cancel` and terminates running handler
/// processes so the dispatcher can unwind and report. A second signal exits
/// immediately with `128 + signal`.
pub fn init_signal_handlers(cancel: CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::spawn(move || {
        let mut received = 0usize;
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            received += 1;
            if received > 1 {
                warn!("Received {} again, exiting", signal_name);
                terminate_all(Duration::ZERO);
                std::process::exit(128 + sig);
            }

            info!("Received {}, aborting module run...", signal_name);
            cancel.cancel();
            terminate_all(DEFAULT_GRACE);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
