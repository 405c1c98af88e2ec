//! Child process execution for the system backend
//!
//! Commands run in their own process group so a terminal Ctrl-C reaches
//! provision but not a half-finished installer. The child is polled so an
//! aborted call (step timeout) can kill it.

use converge::{BackendError, CallContext};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep reading output after the child exits. A background
/// process that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Exit status used by tools to signal a temporary failure (sysexits EX_TEMPFAIL)
const EX_TEMPFAIL: i32 = 75;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Convert a failed run into a classified backend error
    pub fn into_error(self, what: &str) -> BackendError {
        classify_failure(what, self.status.code(), &self.stderr)
    }
}

/// Run a command to completion, killing it if the call is aborted
pub fn run(mut command: Command, ctx: &CallContext) -> Result<CommandOutput, BackendError> {
    let display = format!("{command:?}");
    log::debug!("Running {}", display);

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .map_err(|e| BackendError::permanent(format!("failed to execute {display}: {e}")))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, ctx, &display)?;

    let grace_end = Instant::now() + DRAIN_GRACE;
    Ok(CommandOutput {
        status,
        stdout: stdout.collect(grace_end),
        stderr: stderr.collect(grace_end),
    })
}

/// Run a shell snippet with `<shell> -c`
pub fn run_shell(
    shell: &str,
    script: &str,
    env: &[(String, String)],
    ctx: &CallContext,
) -> Result<CommandOutput, BackendError> {
    let mut command = Command::new(shell);
    command.arg("-c").arg(script);
    for (key, value) in env {
        command.env(key, value);
    }
    run(command, ctx)
}

/// Check if a command exists on PATH
pub fn command_exists(cmd: &str) -> bool {
    Command::new("sh")
        .args(["-c", &format!("command -v {cmd}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn wait(child: &mut Child, ctx: &CallContext, display: &str) -> Result<ExitStatus, BackendError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                return Err(BackendError::permanent(format!(
                    "failed to wait for {display}: {e}"
                )));
            }
        }

        if ctx.is_aborted() {
            log::warn!("Killing {} (step aborted)", display);
            kill(child);
            return Err(BackendError::permanent(format!("{display} was aborted")));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        // Take down the whole process group, not just the shell
        let pgid = child.id() as libc::pid_t;
        // SAFETY: signalling a process group we created; no memory is shared
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Output read so far from one pipe, plus a signal for end of stream
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl Drain {
    /// Wait for end of stream until `grace_end`, then take whatever arrived
    fn collect(self, grace_end: Instant) -> String {
        let remaining = grace_end.saturating_duration_since(Instant::now());
        if self.done.recv_timeout(remaining).is_err() {
            log::debug!("Output pipe still open after exit; keeping partial output");
        }
        let buf = self.buf.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();

    let sink = Arc::clone(&buf);
    // Detached: if a grandchild keeps the pipe open this thread ends with it
    thread::spawn(move || {
        if let Some(mut pipe) = pipe {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk) {
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut b) = sink.lock() {
                            b.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        }
        let _ = tx.send(());
    });

    Drain { buf, done }
}

/// Categorize a failed command from its exit code and stderr
///
/// Network trouble, rate limiting and package manager lock contention are
/// transient; everything else is permanent.
pub fn classify_failure(what: &str, code: Option<i32>, stderr: &str) -> BackendError {
    let lower = stderr.to_lowercase();
    let detail = if stderr.is_empty() {
        match code {
            Some(c) => format!("{what} exited with status {c}"),
            None => format!("{what} was terminated by a signal"),
        }
    } else {
        format!("{what} failed: {}", last_lines(stderr, 5))
    };

    if code == Some(EX_TEMPFAIL) {
        return BackendError::Transient(detail);
    }

    let transient = [
        "could not resolve",
        "temporary failure in name resolution",
        "connection refused",
        "connection reset",
        "connection timed out",
        "operation timed out",
        "network is unreachable",
        "failed to download",
        "ssl",
        "tls handshake",
        "rate limit",
        "too many requests",
        "429",
        "503 service unavailable",
        "could not get lock",
        "unable to lock",
        "another process is already running",
    ];

    if transient.iter().any(|pattern| lower.contains(pattern)) {
        BackendError::Transient(detail)
    } else {
        BackendError::Permanent(detail)
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
