//! Engine child process execution
//!
//! [`run_tracked`] is the only place the crate spawns engine processes. It
//! puts the child in its own process group, tracks it in the global
//! [`ChildRegistry`](crate::process_guard::ChildRegistry) for the lifetime of
//! the call, drains stdout/stderr on helper threads so a chatty interpreter
//! cannot block on a full pipe, and enforces an optional deadline by killing
//! the whole group.

use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::process_guard::{kill_group, CommandProcessGroup, TrackedChild};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of one engine process run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` if terminated by a signal
    pub exit_code: Option<i32>,
    /// True when the deadline passed and the process group was killed
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Last non-empty stderr line, used in error messages
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim()
    }
}

/// Spawn `program` with `args` in `cwd`, wait for it, and capture its output.
///
/// A `timeout` of `None` waits indefinitely. Spawn failures surface as the
/// underlying I/O error so callers can tell "not installed" apart from
/// "ran and failed".
pub fn run_tracked<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
    label: &str,
) -> std::io::Result<ProcessOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!("Spawned {} as {} ({})", program, pid, label);

    let Some(tracked) = TrackedChild::register(pid, label) else {
        // Shutdown already started: do not leave an untracked child behind
        kill_group(pid);
        let _ = child.wait();
        return Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "runtime is shutting down",
        ));
    };

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;
    drop(tracked);

    let output = ProcessOutput {
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
        exit_code: status.and_then(|s| s.code()),
        timed_out,
    };
    debug!(
        "{} ({}) finished with {:?}{}",
        program,
        label,
        output.exit_code,
        if timed_out { " after timeout" } else { "" }
    );
    Ok(output)
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<(Option<ExitStatus>, bool)> {
    let Some(limit) = timeout else {
        return Ok((Some(child.wait()?), false));
    };

    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if Instant::now() >= deadline {
            warn!("Engine process {} exceeded {:?}, killing its group", child.id(), limit);
            kill_group(child.id());
            let status = child.wait()?;
            return Ok((Some(status), true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("Reading engine output failed: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }))
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
