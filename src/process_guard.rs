//! Engine child process lifecycle
//!
//! Every engine round trip spawned by the process-backed connector runs in its
//! own process group and is recorded in a process-wide [`ChildRegistry`]. A
//! round trip that outlives its deadline has its whole group killed, and a
//! signal delivered to the runtime tears down every tracked group before the
//! process exits, so no interpreter keeps running against a workspace that is
//! about to be deleted.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Tracked engine children, keyed by PID (which is also their group id)
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<u32, String>,
    /// Set once a full teardown started; later registrations are refused
    shutting_down: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Lock the global registry, recovering from poisoning
    pub fn with_global<R>(f: impl FnOnce(&mut ChildRegistry) -> R) -> R {
        let registry = Self::global();
        let mut guard: MutexGuard<'_, ChildRegistry> =
            registry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Track a child. Returns false when a teardown is already under way,
    /// in which case the caller must kill the child itself.
    pub fn register(&mut self, pid: u32, label: impl Into<String>) -> bool {
        if self.shutting_down {
            return false;
        }
        let label = label.into();
        debug!("Tracking engine child {} ({})", pid, label);
        self.children.insert(pid, label);
        true
    }

    pub fn unregister(&mut self, pid: u32) {
        if let Some(label) = self.children.remove(&pid) {
            debug!("Engine child {} ({}) finished", pid, label);
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Terminate every tracked group: SIGTERM, wait up to `grace_period`,
    /// then SIGKILL whatever is left.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.shutting_down {
            debug!("Child teardown already started");
            return;
        }
        self.shutting_down = true;

        if self.children.is_empty() {
            return;
        }
        info!("Terminating {} engine child process(es)", self.children.len());

        let pids: Vec<u32> = self.children.keys().copied().collect();
        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                info!("Engine children exited after SIGTERM");
                self.children.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                let label = self.children.get(&pid).map(String::as_str).unwrap_or("?");
                warn!("Engine child {} ({}) ignored SIGTERM, killing", pid, label);
                signal_group_or_process(pid, Signal::SIGKILL);
            }
        }
        self.children.clear();
    }
}

/// Kill a child's whole process group immediately
pub fn kill_group(pid: u32) {
    signal_group_or_process(pid, Signal::SIGKILL);
}

fn signal_group_or_process(pid: u32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(-(pid as i32)), sig) {
        debug!("Group signal {} to {} failed ({}), signalling process", sig, pid, e);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            debug!("Signal {} to {} failed: {}", sig, pid, e);
        }
    }
}

/// True while the process exists and is not a zombie
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // Third field of /proc/<pid>/stat is the state letter
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => true,
    }
}

/// Registration in the global registry for the lifetime of the guard
#[derive(Debug)]
pub struct TrackedChild {
    pid: u32,
}

impl TrackedChild {
    /// Register `pid`; `None` when the registry is already tearing down
    pub fn register(pid: u32, label: &str) -> Option<Self> {
        ChildRegistry::with_global(|registry| registry.register(pid, label))
            .then_some(Self { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        ChildRegistry::with_global(|registry| registry.unregister(self.pid));
    }
}

/// Terminates all tracked engine children when dropped.
///
/// Held by the binary for the duration of `main` so an early return or a
/// panic unwinding out of a command still tears the children down.
#[derive(Debug)]
pub struct ProcessGuard {
    grace_period: Duration,
}

impl ProcessGuard {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn child_count(&self) -> usize {
        ChildRegistry::with_global(|registry| registry.count())
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let grace = self.grace_period;
        ChildRegistry::with_global(|registry| registry.terminate_all(grace));
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that tear down engine children
/// and exit with `128 + signal`.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("wpsr-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "signal",
                };
                info!("Received {}, stopping engine children", name);
                ChildRegistry::with_global(|registry| {
                    registry.terminate_all(Duration::from_secs(3))
                });
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Spawn helpers for engine child processes
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that receives
    /// SIGTERM if the runtime dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
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
