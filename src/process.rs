//! Process runner: spawns backend launch scripts, captures their output,
//! and tears the whole process tree down on stop.
//!
//! Backends are spawned in their own process group so that termination can
//! reach every descendant (model servers routinely fork workers that hold
//! device memory). Output is pumped line by line to the log fan-out; the
//! runner never interprets it. Readiness is the health probe's job.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::logs::LogFanout;

/// Strip ANSI escape sequences from a line.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Handle on a spawned backend process.
pub struct ProcessHandle {
    model: String,
    pid: u32,
    child: Mutex<Option<Child>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Spawns and terminates backend processes, feeding output to the fan-out.
pub struct ProcessRunner {
    fanout: Arc<LogFanout>,
}

impl ProcessRunner {
    pub fn new(fanout: Arc<LogFanout>) -> Self {
        Self { fanout }
    }

    /// Spawn a backend from its launch script.
    ///
    /// The script runs under `sh` in its own process group with stdout and
    /// stderr piped; one pump task per stream forwards non-empty lines to
    /// the log fan-out tagged with the model.
    pub fn spawn(&self, model: &str, script: &Path) -> io::Result<ProcessHandle> {
        info!(model = %model, script = %script.display(), "Spawning backend process");

        let mut cmd = Command::new("sh");
        cmd.arg(script)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::other("spawned process exited before its pid could be read")
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_pump(model, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_pump(model, "stderr", stderr);
        }

        Ok(ProcessHandle {
            model: model.to_string(),
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    fn spawn_pump<R>(&self, model: &str, stream: &'static str, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let fanout = Arc::clone(&self.fanout);
        let model = model.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = strip_ansi(line.trim_end());
                if clean.is_empty() {
                    continue;
                }
                debug!(target: "backend", model = %model, stream = stream, "{}", clean);
                fanout.append(&model, clean);
            }
        });
    }

    /// Whether the process is still running. A reaped exit resets the
    /// handle so repeated calls stay cheap.
    pub async fn alive(&self, handle: &ProcessHandle) -> bool {
        let mut guard = handle.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(model = %handle.model, status = %status, "backend process exited");
                    *guard = None;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(model = %handle.model, error = %e, "failed to poll backend process");
                    false
                }
            },
            None => false,
        }
    }

    /// Stop the process tree: SIGTERM to the group, wait up to `grace`,
    /// then SIGKILL and reap. Idempotent.
    pub async fn stop(&self, handle: &ProcessHandle, grace: Duration) {
        let pgid = handle.pid as i32;
        let mut guard = handle.child.lock().await;

        let Some(child) = guard.as_mut() else {
            // Already reaped; make sure no descendants linger.
            signal_group(pgid, libc::SIGKILL);
            return;
        };

        info!(model = %handle.model, pid = handle.pid, "Stopping backend process group");
        signal_group(pgid, libc::SIGTERM);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(model = %handle.model, status = %status, "backend exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(model = %handle.model, error = %e, "wait failed; escalating to SIGKILL");
                signal_group(pgid, libc::SIGKILL);
                let _ = child.wait().await;
            }
            Err(_) => {
                warn!(
                    model = %handle.model,
                    grace_secs = grace.as_secs(),
                    "grace period elapsed; sending SIGKILL"
                );
                signal_group(pgid, libc::SIGKILL);
                let _ = child.wait().await;
            }
        }

        // The group signal reaches descendants the direct wait cannot.
        signal_group(pgid, libc::SIGKILL);
        *guard = None;
    }
}

fn signal_group(pgid: i32, signal: i32) {
    // ESRCH here just means the group is already gone.
    unsafe {
        libc::killpg(pgid, signal);
    }
}
