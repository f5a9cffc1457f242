//! Cancellation-aware execution of external commands.
//!
//! Every build in repomason is a tree of child processes (dpkg tooling,
//! rpm tooling, gpg, container runtimes). This crate provides the two
//! primitives the rest of the workspace builds on:
//!
//! - [`CancelToken`], a cloneable handle carrying the run-wide termination
//!   flag and the registry of live children. [`CancelToken::check`] is the
//!   only way the workspace discovers cancellation.
//! - The [`run`] / [`run_quiet`] / [`run_stdout`] family, which spawns a
//!   command scoped to a token: the child is registered for the lifetime of
//!   the call, the token is checked immediately before spawn and immediately
//!   after reap, and a non-zero exit becomes a typed
//!   [`RunError::SubprocessFailed`] carrying the captured output.
//!
//! # Example
//!
//! ```
//! use repomason_process::{CancelToken, run_stdout};
//!
//! let token = CancelToken::new();
//! let out = run_stdout(&token, &["echo".into(), "hello".into()], None).expect("run");
//! assert!(out.starts_with("hello"));
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors surfaced by the runner and the cancellation token.
#[derive(Debug, Error)]
pub enum RunError {
    /// Cooperative shutdown is in progress. Not a failure of the command
    /// it interrupted; callers let it bubble to the top-level handler.
    #[error("interrupted")]
    Cancelled,

    /// The command could not be spawned or reaped at all.
    #[error("failed to run `{argv}`: {source}")]
    Spawn {
        argv: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited non-zero.
    #[error("`{argv}` exited with status {code}")]
    SubprocessFailed {
        argv: String,
        code: i32,
        /// Captured stdout+stderr, empty in inherit mode.
        output: String,
    },
}

#[derive(Default)]
struct TokenInner {
    requested: AtomicBool,
    children: Mutex<BTreeMap<u64, u32>>,
    next_handle: AtomicU64,
}

/// Shared handle for cooperative cancellation.
///
/// Clones share one flag and one registry of live child pids. The first
/// [`request_cancel`](CancelToken::request_cancel) trips the flag and sends
/// a polite `SIGTERM` to every registered child without waiting for any of
/// them; later calls are no-ops apart from re-signalling whatever is still
/// registered.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Fails with [`RunError::Cancelled`] once cancellation has been
    /// requested. Called at every pre- and post-blocking point.
    pub fn check(&self) -> Result<(), RunError> {
        if self.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Trip the flag and politely terminate every live child. Idempotent;
    /// returns without waiting for the children to exit.
    pub fn request_cancel(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        let children = self.inner.children.lock().unwrap();
        for pid in children.values() {
            terminate(*pid);
        }
    }

    /// Number of currently registered children.
    pub fn live_children(&self) -> usize {
        self.inner.children.lock().unwrap().len()
    }

    fn register(&self, pid: u32) -> ChildGuard<'_> {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner.children.lock().unwrap().insert(handle, pid);
        // A spawn can race request_cancel between the pre-spawn check and
        // registration; the late child must still receive the signal.
        if self.is_cancelled() {
            terminate(pid);
        }
        ChildGuard { token: self, handle }
    }
}

/// Unregisters a child on every exit path.
struct ChildGuard<'a> {
    token: &'a CancelToken,
    handle: u64,
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        self.token
            .inner
            .children
            .lock()
            .unwrap()
            .remove(&self.handle);
    }
}

fn terminate(pid: u32) {
    // `kill` itself returns immediately; the terminated child is reaped by
    // whichever runner call is waiting on it.
    let _ = Command::new("kill")
        .args(["-s", "TERM", &pid.to_string()])
        .status();
}

/// Output handling for a runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// Child inherits stdout and stderr (verbose mode).
    Inherit,
    /// Capture stdout and stderr into one buffer (quiet mode).
    Capture,
    /// Capture and return stdout, with stderr merged in after it.
    CaptureStdout,
}

/// Run a command, streaming its output to the parent's stdout/stderr.
pub fn run(token: &CancelToken, argv: &[String], cwd: Option<&Path>) -> Result<(), RunError> {
    run_with(token, argv, cwd, OutputMode::Inherit).map(|_| ())
}

/// Run a command quietly, capturing stdout and stderr into one buffer.
///
/// The buffer is returned on success and attached to
/// [`RunError::SubprocessFailed`] on failure so the top-level handler can
/// print it.
pub fn run_quiet(
    token: &CancelToken,
    argv: &[String],
    cwd: Option<&Path>,
) -> Result<String, RunError> {
    run_with(token, argv, cwd, OutputMode::Capture)
}

/// Run a command and return its captured stdout (stderr merged after it).
pub fn run_stdout(
    token: &CancelToken,
    argv: &[String],
    cwd: Option<&Path>,
) -> Result<String, RunError> {
    run_with(token, argv, cwd, OutputMode::CaptureStdout)
}

fn run_with(
    token: &CancelToken,
    argv: &[String],
    cwd: Option<&Path>,
    mode: OutputMode,
) -> Result<String, RunError> {
    token.check()?;

    let display = display_argv(argv);
    let (program, args) = argv.split_first().ok_or_else(|| RunError::Spawn {
        argv: display.clone(),
        source: std::io::Error::other("empty argv"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    match mode {
        OutputMode::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        OutputMode::Capture | OutputMode::CaptureStdout => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        argv: display.clone(),
        source,
    })?;
    let guard = token.register(child.id());

    // Drain stderr on its own thread so neither pipe can fill up and wedge
    // the child while we block on the other one.
    let stderr_pipe = child.stderr.take();
    let stderr_reader = std::thread::spawn(move || read_pipe(stderr_pipe));
    let stdout = read_pipe(child.stdout.take());

    let status = match child.wait() {
        Ok(status) => status,
        Err(source) => {
            // Asynchronous failure while the child runs: hard-kill and
            // re-raise.
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Spawn {
                argv: display,
                source,
            });
        }
    };
    let stderr = stderr_reader.join().unwrap_or_default();
    drop(guard);

    // A child torn down by request_cancel exits non-zero; report that as
    // cancellation, not as a failure of the command.
    token.check()?;

    if !status.success() {
        return Err(RunError::SubprocessFailed {
            argv: display,
            code: status.code().unwrap_or(-1),
            output: combine(&stdout, &stderr),
        });
    }

    Ok(match mode {
        OutputMode::Inherit => String::new(),
        OutputMode::Capture | OutputMode::CaptureStdout => combine(&stdout, &stderr),
    })
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn combine(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        let mut out = String::with_capacity(stdout.len() + stderr.len() + 1);
        out.push_str(stdout);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(stderr);
        out
    }
}

fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn run_stdout_captures_output() {
        let token = CancelToken::new();
        let out = run_stdout(&token, &sh("echo hello"), None).expect("run");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_stdout_merges_stderr_after_stdout() {
        let token = CancelToken::new();
        let out = run_stdout(&token, &sh("echo out; echo err >&2"), None).expect("run");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["out", "err"]);
    }

    #[test]
    fn run_honors_cwd() {
        let token = CancelToken::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_stdout(&token, &sh("pwd"), Some(dir.path())).expect("run");
        let reported = std::fs::canonicalize(out.trim()).expect("canonicalize");
        let expected = std::fs::canonicalize(dir.path()).expect("canonicalize");
        assert_eq!(reported, expected);
    }

    #[test]
    fn nonzero_exit_is_typed_with_code_and_output() {
        let token = CancelToken::new();
        let err = run_quiet(&token, &sh("echo boom; exit 3"), None).expect_err("must fail");
        match err {
            RunError::SubprocessFailed { code, output, argv } => {
                assert_eq!(code, 3);
                assert!(output.contains("boom"));
                assert!(argv.contains("sh -c"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn check_fails_after_request_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.request_cancel();
        assert!(matches!(token.check(), Err(RunError::Cancelled)));
        // Idempotent.
        token.request_cancel();
        assert!(matches!(token.check(), Err(RunError::Cancelled)));
    }

    #[test]
    fn no_spawn_after_cancel() {
        let token = CancelToken::new();
        token.request_cancel();
        let err = run_quiet(&token, &sh("echo never"), None).expect_err("must not spawn");
        assert!(matches!(err, RunError::Cancelled));
    }

    #[test]
    fn child_is_unregistered_on_exit() {
        let token = CancelToken::new();
        run(&token, &sh("true"), None).expect("run");
        assert_eq!(token.live_children(), 0);
        let _ = run_quiet(&token, &sh("exit 1"), None);
        assert_eq!(token.live_children(), 0);
    }

    #[test]
    fn cancel_terminates_running_child() {
        let token = CancelToken::new();
        let worker = {
            let token = token.clone();
            std::thread::spawn(move || run_quiet(&token, &sh("sleep 30"), None))
        };
        // Give the child a moment to register.
        while token.live_children() == 0 {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        token.request_cancel();
        let err = worker.join().expect("join").expect_err("must be cancelled");
        assert!(matches!(err, RunError::Cancelled));
    }

    #[test]
    fn empty_argv_is_a_spawn_error() {
        let token = CancelToken::new();
        let err = run(&token, &[], None).expect_err("must fail");
        assert!(matches!(err, RunError::Spawn { .. }));
    }
}
