//! Spawns an external binary and streams its output line-by-line.

use std::os::unix::process::CommandExt as _;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::ProcessError;

/// One update out of a running child process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A complete line, newline stripped.
    Line(String),
    /// A trailing chunk with no terminating newline yet; buffered by the
    /// caller until the next `Line` or `Exit`.
    Partial(String),
    /// The process terminated.
    Exit(ExitOutcome),
}

/// How the child process ended.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    /// Exited with the given status code.
    Code(i32),
    /// Died abnormally (signal, or the OS could not report a code).
    PortDied { reason: String },
}

/// A running external process, spawned in its own process group so the
/// whole group (including grandchildren like `ffmpeg`) can be reaped with
/// one signal.
pub struct ProcessRunner {
    child: Arc<Mutex<tokio::process::Child>>,
    pgid: i32,
}

impl ProcessRunner {
    /// Spawns `program` with `args`, merging stderr into stdout, and returns
    /// the runner plus a channel of [`ProcessEvent`]s (lines followed by a
    /// terminal `Exit`).
    pub fn spawn(program: &str, args: &[String]) -> Result<(Self, mpsc::Receiver<ProcessEvent>), ProcessError> {
        if which(program).is_none() {
            return Err(ProcessError::ExecutableNotFound { name: program.to_string() });
        }

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        unsafe {
            cmd.pre_exec(|| {
                // New process group, separate from the parent's, so a single
                // kill(-pgid) reaps ab-av1's ffmpeg grandchildren too.
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            command: format!("{} {}", program, args.join(" ")),
            message: e.to_string(),
        })?;

        let pgid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            command: program.to_string(),
            message: "child exited before its pid could be read".to_string(),
        })? as i32;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(stream_lines(stdout, tx.clone()));
        tokio::spawn(stream_lines(stderr, tx.clone()));

        let child = Arc::new(Mutex::new(child));
        tokio::spawn(report_exit(child.clone(), tx));

        Ok((Self { child, pgid }, rx))
    }

    /// The OS process-group id, exposed for health monitors (Port-Holder's `get_os_pid`).
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// SIGTERM the process group, then SIGKILL after `grace` if it hasn't exited.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        signal_group(self.pgid, libc::SIGTERM);

        let mut child = self.child.lock().await;
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            signal_group(self.pgid, libc::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

async fn report_exit(child: Arc<Mutex<tokio::process::Child>>, tx: mpsc::Sender<ProcessEvent>) {
    let outcome = {
        let mut child = child.lock().await;
        match child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => ExitOutcome::Code(code),
                None => ExitOutcome::PortDied { reason: format!("terminated abnormally: {:?}", status) },
            },
            Err(e) => ExitOutcome::PortDied { reason: e.to_string() },
        }
    };
    let _ = tx.send(ProcessEvent::Exit(outcome)).await;
}

fn signal_group(pgid: i32, signal: i32) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

async fn stream_lines<R>(reader: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(ProcessEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "error reading process output");
                return;
            }
        }
    }
}

/// Resolves a binary name against `PATH`, used for the "executable not found" check.
fn which(name: &str) -> Option<std::path::PathBuf> {
    if name.contains('/') {
        let path = std::path::PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        candidate.is_file().then_some(candidate)
    })
}

/// Kills any process whose command line starts with `prefix`, used by the
/// orphan reaper to clean up children of a previous crashed run.
pub fn kill_orphans_matching(prefix: &str) {
    let output = match std::process::Command::new("pgrep").arg("-f").arg(prefix).output() {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, prefix, "pgrep unavailable, cannot reap orphans");
            return;
        }
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_a_binary_known_to_exist() {
        assert!(which("sh").is_some());
    }

    #[test]
    fn which_rejects_a_missing_binary() {
        assert!(which("this-binary-does-not-exist-anywhere").is_none());
    }
}
