//! Worker subprocesses: how they are spawned and how they are stopped.
//!
//! The worker speaks the protocol over its stdin/stdout; stderr is inherited
//! so its tracing output lands next to the host's.

use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::client::{CallError, WorkerClient};
use crate::value::{Value, ValueError};

/// How long a worker gets to exit on its own after its input is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} was not piped")]
    MissingPipe(&'static str),
    #[error("a worker pool needs at least one worker")]
    NoWorkers,
}

/// Extension point for different worker launch strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns a worker executable with fixed arguments and environment.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(program = ?self.program, pid = child.id(), "Spawned worker");
        Ok(child)
    }
}

/// Take the protocol pipes from a freshly spawned child.
pub(crate) fn take_pipes(child: &mut Child) -> Result<(ChildStdout, ChildStdin), SpawnError> {
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    Ok((stdout, stdin))
}

/// Wait for `child` to exit, escalating if it does not.
///
/// On unix: waits `grace`, sends SIGTERM, waits `grace` again, then SIGKILL.
pub(crate) async fn stop_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        tracing::debug!(pid, "Worker did not exit, sending SIGTERM");
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    return status;
                }
            }
            Err(e) => tracing::warn!(pid, error = %e, "Failed to send SIGTERM"),
        }
    }

    tracing::warn!(pid = child.id(), "Killing unresponsive worker");
    child.kill().await?;
    child.wait().await
}

/// A spawned worker and its connection.
pub struct WorkerProcess {
    child: Child,
    client: WorkerClient<ChildStdout, ChildStdin>,
}

impl WorkerProcess {
    pub fn spawn(spawner: &dyn WorkerSpawner) -> Result<Self, SpawnError> {
        Self::spawn_with_max_frame_length(spawner, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn spawn_with_max_frame_length(
        spawner: &dyn WorkerSpawner,
        max_frame_length: usize,
    ) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn()?;
        let (stdout, stdin) = take_pipes(&mut child)?;
        Ok(Self {
            child,
            client: WorkerClient::with_max_frame_length(stdout, stdin, max_frame_length),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn client(&mut self) -> &mut WorkerClient<ChildStdout, ChildStdin> {
        &mut self.client
    }

    pub async fn call(
        &mut self,
        function_name: &str,
        argument: impl Into<Value>,
    ) -> Result<Value, CallError> {
        self.client.call(function_name, argument).await
    }

    pub async fn call_as<T>(
        &mut self,
        function_name: &str,
        argument: impl Into<Value>,
    ) -> Result<T, CallError>
    where
        T: TryFrom<Value>,
        T::Error: Into<ValueError>,
    {
        self.client.call_as(function_name, argument).await
    }

    /// Close the worker's input and wait for it to exit.
    pub async fn shutdown(self) -> Result<ExitStatus, CallError> {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await
    }

    pub async fn shutdown_with_grace(mut self, grace: Duration) -> Result<ExitStatus, CallError> {
        if let Err(e) = self.client.close().await {
            tracing::debug!(error = %e, "Worker input already closed");
        }
        // Dropping the client releases both pipe ends.
        drop(self.client);
        let status = stop_child(&mut self.child, grace)
            .await
            .map_err(CallError::Io)?;
        tracing::debug!(%status, "Worker exited");
        Ok(status)
    }
}
