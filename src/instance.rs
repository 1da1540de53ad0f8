/// One supervised run of a builder's `run` program for a package.
///
/// `start` launches the process, `stop` asks it to shut down (SIGTERM, then
/// SIGKILL once the grace period runs out), and `wait` resolves to the exit
/// code with the failure classified.
use crate::builder::Builder;
use crate::connection::{PeerConnection, RunMetadata};
use crate::session::{describe_signal, ExitError, ExitHook, Session, SignalError, SpawnError};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Grace period used when none (or zero) is configured.
pub const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lifecycle operation, used to word `NotStarted` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Stop,
    Wait,
}

/// Errors surfaced by [`Instance`] lifecycle calls.
#[derive(Debug)]
pub enum InstanceError {
    /// Stop or Wait without a running session.
    NotStarted(Operation),
    /// Start while a session is already owned.
    AlreadyStarted { package_id: String },
    /// The run-metadata directory could not be prepared.
    Metadata { source: std::io::Error },
    /// The run program could not be launched.
    Spawn(SpawnError),
    /// A termination signal could not be delivered.
    SignalDelivery(SignalError),
    /// The run program exited on its own with a non-zero status.
    RunFailed { builder: String, code: i32 },
    /// The run program died from a signal.
    SignalTerminated { builder: String, signal: Signal },
    /// The exit status could not be collected.
    WaitFailed { builder: String, reason: String },
}

impl InstanceError {
    fn from_exit(builder: &str, err: ExitError) -> Self {
        let builder = builder.to_string();
        match err {
            ExitError::Status(code) => InstanceError::RunFailed { builder, code },
            ExitError::Signaled(signal) => InstanceError::SignalTerminated { builder, signal },
            ExitError::Wait(reason) => InstanceError::WaitFailed { builder, reason },
        }
    }

    /// Exit code reported alongside the error; -1 unless the process exited
    /// on its own.
    pub fn exit_code(&self) -> i32 {
        match self {
            InstanceError::RunFailed { code, .. } => *code,
            _ => -1,
        }
    }
}

impl std::fmt::Display for InstanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceError::NotStarted(Operation::Stop) => {
                write!(f, "instance has not been started")
            }
            InstanceError::NotStarted(Operation::Wait) => {
                write!(f, "instance was not successfully started")
            }
            InstanceError::AlreadyStarted { package_id } => {
                write!(f, "instance '{}' has already been started", package_id)
            }
            InstanceError::Metadata { source } => {
                write!(f, "could not write run metadata: {}", source)
            }
            InstanceError::Spawn(e) => write!(f, "could not execute run: {}", e),
            InstanceError::SignalDelivery(e) => write!(f, "could not stop instance: {}", e),
            InstanceError::RunFailed { builder, code } => {
                write!(f, "builder '{}' run failed: exit status {}", builder, code)
            }
            InstanceError::SignalTerminated { builder, signal } => {
                write!(
                    f,
                    "builder '{}' run failed: signal: {}",
                    builder,
                    describe_signal(*signal)
                )
            }
            InstanceError::WaitFailed { builder, reason } => {
                write!(f, "builder '{}' run failed: {}", builder, reason)
            }
        }
    }
}

impl std::error::Error for InstanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstanceError::Metadata { source } => Some(source),
            InstanceError::Spawn(e) => Some(e),
            InstanceError::SignalDelivery(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    package_id: String,
    builder: Arc<Builder>,
    build_output_dir: PathBuf,
    termination_grace_period: Option<Duration>,
    session: Option<Session>,
    /// Outcome of the first stop; later and concurrent stops share it.
    stopped: OnceCell<Result<(), SignalError>>,
}

impl Instance {
    pub fn new(
        package_id: impl Into<String>,
        builder: Arc<Builder>,
        build_output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            builder,
            build_output_dir: build_output_dir.into(),
            termination_grace_period: None,
            session: None,
            stopped: OnceCell::new(),
        }
    }

    pub fn with_termination_grace_period(mut self, grace: Option<Duration>) -> Self {
        self.termination_grace_period = grace;
        self
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Effective grace period between SIGTERM and SIGKILL.
    pub fn termination_grace_period(&self) -> Duration {
        match self.termination_grace_period {
            Some(grace) if !grace.is_zero() => grace,
            _ => DEFAULT_TERMINATION_GRACE_PERIOD,
        }
    }

    /// Launch the builder's run program.
    ///
    /// The connection payload is written to a fresh run-metadata directory
    /// which is removed once the process has been reaped. On failure no
    /// session is recorded and `start` may be called again. Must be called
    /// from within a Tokio runtime.
    pub fn start(&mut self, connection: &PeerConnection) -> Result<(), InstanceError> {
        if self.session.is_some() {
            return Err(InstanceError::AlreadyStarted {
                package_id: self.package_id.clone(),
            });
        }

        let run_dir = RunMetadata::new(&self.package_id, connection)
            .write_to_temp_dir()
            .map_err(|source| InstanceError::Metadata { source })?;
        let invocation = self
            .builder
            .run_invocation(&self.build_output_dir, run_dir.path());

        let cleanup: ExitHook = Box::new(move |_: &Result<i32, ExitError>| {
            let path = run_dir.path().to_path_buf();
            if let Err(e) = run_dir.close() {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to remove run metadata directory"
                );
            }
        });
        // On spawn failure the hook is dropped unrun, which removes the directory.
        let session = Session::start(invocation, vec![cleanup]).map_err(InstanceError::Spawn)?;

        tracing::info!(
            package_id = %self.package_id,
            builder = %self.builder.name,
            pid = session.pid(),
            "instance started"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Stop the run program.
    ///
    /// Sends SIGTERM and waits up to the grace period for the process to go
    /// away; if it is still running, sends SIGKILL. Returns once the signals
    /// have been delivered; the exit itself is reported by [`Instance::wait`].
    pub async fn stop(&self) -> Result<(), InstanceError> {
        let session = self
            .session
            .as_ref()
            .ok_or(InstanceError::NotStarted(Operation::Stop))?;
        let stopped = *self.stopped.get_or_init(|| self.escalate(session)).await;
        stopped.map_err(InstanceError::SignalDelivery)
    }

    async fn escalate(&self, session: &Session) -> Result<(), SignalError> {
        if session.has_exited() {
            tracing::debug!(package_id = %self.package_id, "builder process already exited");
            return Ok(());
        }
        let grace = self.termination_grace_period();
        session.terminate()?;

        match tokio::time::timeout(grace, session.wait()).await {
            Ok(_) => {
                tracing::info!(
                    package_id = %self.package_id,
                    pid = session.pid(),
                    "builder process terminated"
                );
                Ok(())
            }
            Err(_elapsed) => {
                tracing::warn!(
                    package_id = %self.package_id,
                    pid = session.pid(),
                    grace_ms = grace.as_millis() as u64,
                    "builder process still running after grace period, killing"
                );
                session.kill()
            }
        }
    }

    /// Wait for the run program to exit and return its exit code.
    ///
    /// Fails immediately with exit code -1 if the instance was never started.
    pub async fn wait(&self) -> Result<i32, InstanceError> {
        let session = self
            .session
            .as_ref()
            .ok_or(InstanceError::NotStarted(Operation::Wait))?;
        session
            .wait()
            .await
            .map_err(|err| InstanceError::from_exit(&self.builder.name, err))
    }
}
