//! Agent process lifecycle.
//!
//! Every invocation owns exactly one child process. A supervisor task owns
//! the [`Child`] and reaps it; callers observe and steer it through a
//! [`ProcessControl`] handle while reading stdout themselves.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::prompt::Prompt;

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Limits and flags applied to every invocation.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Agent executable, looked up on `PATH` when not absolute.
    pub binary: PathBuf,
    pub permission_mode: String,
    pub max_turns: u32,
    /// Wall-clock limit per invocation. `None` disables it.
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            permission_mode: "bypassPermissions".to_string(),
            max_turns: 25,
            timeout: Some(Duration::from_secs(600)),
            kill_grace: KILL_GRACE,
        }
    }
}

/// Inputs of one invocation.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub model: &'a str,
    pub prompt: &'a Prompt,
    pub resume: Option<&'a str>,
    pub cwd: &'a Path,
}

/// Argument vector for one invocation.
///
/// The prompt goes last, after `--`, so text starting with `-` is never
/// taken for an option.
pub fn build_args(settings: &AgentSettings, invocation: &Invocation<'_>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--model".to_string(),
        invocation.model.to_string(),
        "--permission-mode".to_string(),
        settings.permission_mode.clone(),
        "--max-turns".to_string(),
        settings.max_turns.to_string(),
    ];
    if let Some(system) = &invocation.prompt.system {
        args.push("--append-system-prompt".to_string());
        args.push(system.clone());
    }
    if let Some(session_id) = invocation.resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args.push("--".to_string());
    args.push(invocation.prompt.text.clone());
    args
}

/// Observable lifecycle of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// The wall-clock limit fired; termination is underway.
    TimedOut,
    /// Reaped. Carries the exit code, `None` when killed by a signal.
    Exited(Option<i32>),
}

#[derive(Debug, Default)]
struct Shared {
    pid: Option<u32>,
    termination_requested: AtomicBool,
    timed_out: AtomicBool,
}

/// Cloneable handle for observing and cancelling a running agent.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    state: watch::Receiver<ProcessState>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Start the graceful-then-forceful termination sequence. Idempotent,
    /// and a no-op once the process has exited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Guard that cancels the process when dropped unless disarmed.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Whether the wall-clock limit fired, even if the process has since
    /// been reaped.
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    /// Whether SIGTERM has been issued, by timeout or cancellation.
    pub fn termination_requested(&self) -> bool {
        self.shared.termination_requested.load(Ordering::SeqCst)
    }

    /// Wait until the process has been reaped and return its exit code.
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| matches!(s, ProcessState::Exited(_))).await {
            Ok(state) => match *state {
                ProcessState::Exited(code) => code,
                _ => None,
            },
            Err(_) => None,
        }
    }
}

/// Background collector for the full stderr text.
#[derive(Debug)]
pub struct StderrCollector {
    task: JoinHandle<String>,
}

impl StderrCollector {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let task = tokio::spawn(async move {
            let Some(mut stderr) = stderr else {
                return String::new();
            };
            let mut buf = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                debug!("Error reading agent stderr: {:?}", e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        });
        Self { task }
    }

    /// Everything written to stderr. Completes once the stream closes.
    pub async fn collect(self) -> String {
        self.task.await.unwrap_or_default()
    }
}

/// A spawned agent: stdout for the caller to read, stderr being
/// collected, and the control handle.
#[derive(Debug)]
pub struct AgentProcess {
    pub stdout: ChildStdout,
    pub stderr: StderrCollector,
    pub control: ProcessControl,
}

/// Spawn the agent and its supervisor.
///
/// Fails when the binary cannot be launched; never waits for output.
pub fn spawn(settings: &AgentSettings, invocation: &Invocation<'_>) -> Result<AgentProcess> {
    let args = build_args(settings, invocation);
    info!(
        "Spawning agent {} in {} (model: {}, resume: {:?})",
        settings.binary.display(),
        invocation.cwd.display(),
        invocation.model,
        invocation.resume
    );

    let child = Command::new(&settings.binary)
        .args(&args)
        .current_dir(invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn agent binary {}", settings.binary.display()))?;

    attach(child, settings)
}

/// Put a freshly spawned child under supervision.
fn attach(mut child: Child, settings: &AgentSettings) -> Result<AgentProcess> {
    let stdout = child
        .stdout
        .take()
        .context("agent stdout was not captured")?;
    let stderr = StderrCollector::spawn(child.stderr.take());

    let shared = Arc::new(Shared {
        pid: child.id(),
        ..Shared::default()
    });
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(ProcessState::Running);

    tokio::spawn(supervise(
        child,
        settings.timeout,
        settings.kill_grace,
        cancel.clone(),
        Arc::clone(&shared),
        state_tx,
    ));

    Ok(AgentProcess {
        stdout,
        stderr,
        control: ProcessControl {
            shared,
            cancel,
            state: state_rx,
        },
    })
}

async fn supervise(
    mut child: Child,
    timeout: Option<Duration>,
    grace: Duration,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    state: watch::Sender<ProcessState>,
) {
    let pid = shared.pid;
    let deadline = sleep(timeout.unwrap_or_default());
    tokio::pin!(deadline);

    let mut terminating = false;
    let mut kill_at: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut deadline, if timeout.is_some() && !terminating => {
                warn!("Agent {:?} exceeded {:?}, terminating", pid, timeout.unwrap_or_default());
                terminating = true;
                shared.timed_out.store(true, Ordering::SeqCst);
                state.send_replace(ProcessState::TimedOut);
                shared.termination_requested.store(true, Ordering::SeqCst);
                send_signal(pid, libc::SIGTERM);
                kill_at = Some(Instant::now() + grace);
            }
            _ = cancel.cancelled(), if !terminating => {
                info!("Agent {:?} cancelled by caller, terminating", pid);
                terminating = true;
                shared.termination_requested.store(true, Ordering::SeqCst);
                send_signal(pid, libc::SIGTERM);
                kill_at = Some(Instant::now() + grace);
            }
            _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                warn!("Agent {:?} ignored SIGTERM for {:?}, killing", pid, grace);
                send_signal(pid, libc::SIGKILL);
                kill_at = None;
            }
        }
    };

    let code = match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;

            let described = format_exit_status(status.code(), signal);
            match status.code() {
                Some(0) => debug!("Agent {:?} {}", pid, described),
                _ => info!("Agent {:?} {}", pid, described),
            }
            status.code()
        }
        Err(e) => {
            warn!("Error waiting for agent {:?}: {:?}", pid, e);
            None
        }
    };
    state.send_replace(ProcessState::Exited(code));
}

fn send_signal(pid: Option<u32>, signal: i32) {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: pid names our own child, which the supervisor has not reaped yet.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        debug!(
            "kill({}, {}) failed: {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

/// Human-readable exit status.
pub fn format_exit_status(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => match signal_name(sig) {
            Some(name) => format!("killed by {} (signal {})", name, sig),
            None => format!("killed by signal {}", sig),
        },
        (None, None) => "exited (unknown status)".to_string(),
    }
}

fn signal_name(sig: i32) -> Option<&'static str> {
    match sig {
        libc::SIGKILL => Some("SIGKILL"),
        libc::SIGTERM => Some("SIGTERM"),
        libc::SIGINT => Some("SIGINT"),
        libc::SIGSEGV => Some("SIGSEGV"),
        libc::SIGABRT => Some("SIGABRT"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn prompt(text: &str) -> Prompt {
        Prompt {
            text: text.to_string(),
            system: None,
        }
    }

    /// Run `/bin/sh -c <script>` under the real supervisor.
    fn spawn_sh(script: &str, timeout: Option<Duration>) -> AgentProcess {
        let settings = AgentSettings {
            binary: PathBuf::from("/bin/sh"),
            timeout,
            kill_grace: Duration::from_millis(500),
            ..AgentSettings::default()
        };
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        attach(child, &settings).unwrap()
    }

    #[test]
    fn test_build_args_fresh() {
        let settings = AgentSettings::default();
        let p = prompt("hello");
        let args = build_args(
            &settings,
            &Invocation {
                model: "claude-sonnet-4-5-20250929",
                prompt: &p,
                resume: None,
                cwd: Path::new("/tmp"),
            },
        );
        assert_eq!(
            args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--model",
                "claude-sonnet-4-5-20250929",
                "--permission-mode",
                "bypassPermissions",
                "--max-turns",
                "25",
                "--",
                "hello",
            ]
        );
    }

    #[test]
    fn test_build_args_resume_and_system() {
        let settings = AgentSettings::default();
        let p = Prompt {
            text: "next".to_string(),
            system: Some("be brief".to_string()),
        };
        let args = build_args(
            &settings,
            &Invocation {
                model: "m",
                prompt: &p,
                resume: Some("sess-1"),
                cwd: Path::new("/tmp"),
            },
        );
        let tail: Vec<&str> = args[args.len() - 6..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--append-system-prompt", "be brief", "--resume", "sess-1", "--", "next"]
        );
    }

    #[test]
    fn test_build_args_dash_prompt_follows_end_of_options() {
        let settings = AgentSettings::default();
        let p = prompt("--help me");
        let args = build_args(
            &settings,
            &Invocation {
                model: "m",
                prompt: &p,
                resume: None,
                cwd: Path::new("/tmp"),
            },
        );
        assert_eq!(args.iter().filter(|a| a.as_str() == "--help me").count(), 1);
        assert_eq!(&args[args.len() - 2..], ["--", "--help me"]);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let settings = AgentSettings {
            binary: PathBuf::from("/nonexistent/agentgate-agent"),
            ..AgentSettings::default()
        };
        let p = prompt("x");
        let err = spawn(
            &settings,
            &Invocation {
                model: "m",
                prompt: &p,
                resume: None,
                cwd: Path::new("/tmp"),
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn agent binary"));
    }

    #[tokio::test]
    async fn test_output_and_exit_code_observed() {
        let mut process = spawn_sh("echo out; echo err >&2; exit 3", None);
        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(process.stderr.collect().await, "err\n");
        assert_eq!(process.control.wait().await, Some(3));
        assert_eq!(process.control.state(), ProcessState::Exited(Some(3)));
        assert!(!process.control.termination_requested());
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let process = spawn_sh("sleep 30", Some(Duration::from_millis(100)));
        let started = std::time::Instant::now();
        let code = process.control.wait().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(code, None);
        assert!(process.control.termination_requested());
        assert!(process.control.timed_out());
    }

    #[tokio::test]
    async fn test_timeout_reports_timed_out_state() {
        let process = spawn_sh("trap '' TERM; sleep 30", Some(Duration::from_millis(50)));
        let mut rx = process.control.state.clone();
        rx.wait_for(|s| *s == ProcessState::TimedOut).await.unwrap();
        // SIGTERM is ignored, so the grace period escalates to SIGKILL.
        assert_eq!(process.control.wait().await, None);
        assert!(process.control.timed_out());
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let process = spawn_sh("sleep 30", None);
        process.control.cancel();
        assert_eq!(process.control.wait().await, None);
        assert!(process.control.termination_requested());
        assert!(!process.control.timed_out());
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let process = spawn_sh("sleep 30", None);
        {
            let _guard = process.control.cancel_on_drop();
        }
        process.control.wait().await;
        assert!(process.control.termination_requested());
    }

    #[tokio::test]
    async fn test_disarmed_guard_does_not_cancel() {
        let process = spawn_sh("exit 0", None);
        process.control.cancel_on_drop().disarm();
        assert_eq!(process.control.wait().await, Some(0));
        assert!(!process.control.termination_requested());
    }

    #[tokio::test]
    async fn test_cancel_after_exit_is_noop() {
        let process = spawn_sh("exit 0", None);
        process.control.wait().await;
        process.control.cancel();
        assert_eq!(process.control.state(), ProcessState::Exited(Some(0)));
    }

    #[test]
    fn test_format_exit_status() {
        assert_eq!(format_exit_status(Some(1), None), "exited with code 1");
        assert_eq!(
            format_exit_status(None, Some(9)),
            "killed by SIGKILL (signal 9)"
        );
        assert_eq!(format_exit_status(None, Some(42)), "killed by signal 42");
        assert_eq!(format_exit_status(None, None), "exited (unknown status)");
    }
}
