/// Single child-process session: spawn the process in its own process group,
/// reap it exactly once, broadcast the exit outcome to every waiter, and
/// deliver termination signals.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use tracing::Instrument;

/// Recipe for launching one child process.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Label attached to every log line of the session (usually the builder name).
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Complete child environment. `None` inherits the supervisor's environment.
    pub env: Option<Vec<(String, String)>>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            program,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the child's environment with exactly these variables.
    pub fn env_exact(mut self, env: Vec<(String, String)>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Outcome of a process that did not exit cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitError {
    /// The process exited on its own with a non-zero status.
    Status(i32),
    /// The process was terminated by a signal.
    Signaled(Signal),
    /// The exit status could not be collected.
    Wait(String),
}

impl ExitError {
    /// Numeric exit status; -1 when the process did not exit on its own.
    pub fn code(&self) -> i32 {
        match self {
            ExitError::Status(code) => *code,
            ExitError::Signaled(_) | ExitError::Wait(_) => -1,
        }
    }
}

impl std::fmt::Display for ExitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitError::Status(code) => write!(f, "exit status {}", code),
            ExitError::Signaled(signal) => write!(f, "signal: {}", describe_signal(*signal)),
            ExitError::Wait(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

impl std::error::Error for ExitError {}

/// The OS refused to create the child process.
#[derive(Debug)]
pub struct SpawnError {
    pub program: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to spawn {}: {}",
            self.program.display(),
            self.source
        )
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A signal could not be delivered to a process that is still around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalError {
    pub signal: Signal,
    pub pid: u32,
    pub errno: Errno,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send {} to process group {}: {}",
            self.signal.as_str(),
            self.pid,
            self.errno.desc()
        )
    }
}

impl std::error::Error for SignalError {}

/// Callback run by the reaper once the process has exited, before waiters
/// are released.
pub type ExitHook = Box<dyn FnOnce(&Result<i32, ExitError>) + Send + 'static>;

/// Human-readable signal description, matching the wording used by most
/// process runtimes ("signal: terminated", "signal: killed").
pub fn describe_signal(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGTERM => "terminated",
        Signal::SIGKILL => "killed",
        Signal::SIGINT => "interrupt",
        Signal::SIGHUP => "hangup",
        Signal::SIGQUIT => "quit",
        Signal::SIGABRT => "aborted",
        Signal::SIGSEGV => "segmentation fault",
        Signal::SIGPIPE => "broken pipe",
        other => other.as_str(),
    }
}

fn classify(status: ExitStatus) -> Result<i32, ExitError> {
    match (status.code(), status.signal()) {
        (Some(0), _) => Ok(0),
        (Some(code), _) => Err(ExitError::Status(code)),
        (None, Some(raw)) => match Signal::try_from(raw) {
            Ok(signal) => Err(ExitError::Signaled(signal)),
            Err(_) => Err(ExitError::Wait(format!("unknown signal {}", raw))),
        },
        (None, None) => Err(ExitError::Wait(format!("unrecognized exit status {}", status))),
    }
}

/// A live child process.
///
/// The OS wait is performed by a single reaper task spawned in [`Session::start`];
/// [`Session::wait`] only listens for the published outcome, so any number of
/// callers can wait concurrently and all of them see the same result.
#[derive(Debug)]
pub struct Session {
    name: String,
    pid: u32,
    /// Set by the reaper once the process is gone; signals are skipped afterwards.
    exited: Arc<Mutex<bool>>,
    outcome: watch::Receiver<Option<Result<i32, ExitError>>>,
}

impl Session {
    /// Spawn the process described by `invocation`.
    ///
    /// The child gets its own process group (so termination reaches its
    /// descendants), a null stdin, and a discarded stdout. Each stderr line is
    /// logged at info level. Must be called from within a Tokio runtime.
    pub fn start(invocation: Invocation, exit_hooks: Vec<ExitHook>) -> Result<Session, SpawnError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        if let Some(env) = &invocation.env {
            command.env_clear();
            for (key, value) in env {
                command.env(key, value);
            }
        }

        let mut child = command.spawn().map_err(|source| SpawnError {
            program: invocation.program.clone(),
            source,
        })?;
        // A pid of 0 would address our own process group when signaling.
        let pid = child.id().ok_or_else(|| SpawnError {
            program: invocation.program.clone(),
            source: std::io::Error::other("spawned process has no pid"),
        })?;

        tracing::info!(
            builder = %invocation.name,
            pid,
            program = %invocation.program.display(),
            args = ?invocation.args,
            "builder process started"
        );

        let span = tracing::info_span!("session", builder = %invocation.name, pid);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr).instrument(span.clone()));
        }

        let exited = Arc::new(Mutex::new(false));
        let (publish, outcome) = watch::channel(None);
        let reaper_exited = Arc::clone(&exited);
        tokio::spawn(
            async move {
                let result = match child.wait().await {
                    Ok(status) => classify(status),
                    Err(e) => Err(ExitError::Wait(e.to_string())),
                };
                *reaper_exited.lock().unwrap_or_else(PoisonError::into_inner) = true;

                match &result {
                    Ok(code) => tracing::info!(exit_code = code, "builder process exited"),
                    Err(e) => tracing::info!(exit_code = e.code(), error = %e, "builder process exited"),
                }
                for hook in exit_hooks {
                    hook(&result);
                }
                publish.send_replace(Some(result));
            }
            .instrument(span),
        );

        Ok(Session {
            name: invocation.name,
            pid,
            exited,
            outcome,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the process to exit.
    ///
    /// Returns `Ok(0)` on a clean exit. Cancel-safe, and every caller observes
    /// the same outcome.
    pub async fn wait(&self) -> Result<i32, ExitError> {
        let mut outcome = self.outcome.clone();
        let published = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        published.unwrap_or_else(|| {
            Err(ExitError::Wait(
                "reaper stopped before the process exited".to_string(),
            ))
        })
    }

    /// Ask the process group to shut down (SIGTERM).
    pub fn terminate(&self) -> Result<(), SignalError> {
        self.signal(Signal::SIGTERM)
    }

    /// Force the process group down (SIGKILL).
    pub fn kill(&self) -> Result<(), SignalError> {
        self.signal(Signal::SIGKILL)
    }

    /// A process that is already gone counts as delivered.
    fn signal(&self, signal: Signal) -> Result<(), SignalError> {
        let exited = self.exited.lock().unwrap_or_else(PoisonError::into_inner);
        if *exited {
            tracing::debug!(
                pid = self.pid,
                signal = signal.as_str(),
                "process already reaped, not signaling"
            );
            return Ok(());
        }

        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => {
                tracing::info!(
                    builder = %self.name,
                    pid = self.pid,
                    signal = signal.as_str(),
                    "signaled builder process group"
                );
                Ok(())
            }
            Err(Errno::ESRCH) => {
                tracing::debug!(
                    pid = self.pid,
                    signal = signal.as_str(),
                    "process group already gone"
                );
                Ok(())
            }
            Err(errno) => Err(SignalError {
                signal,
                pid: self.pid,
                errno,
            }),
        }
    }
}

/// Log each stderr line at info level. Lines are read as bytes and logged
/// lossily, so output that isn't UTF-8 is still forwarded.
async fn forward_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                tracing::info!("{}", String::from_utf8_lossy(&line));
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read builder stderr, discarding the rest");
                // The read end must stay open while the child lives, or its
                // next write dies with SIGPIPE.
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    tracing::debug!(error = %e, "stopped draining builder stderr");
                }
                break;
            }
        }
    }
}
