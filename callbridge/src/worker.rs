//! Worker side of the bridge: read requests, dispatch, write responses.
//!
//! [`serve`] is the transport loop and works over any AsyncRead/AsyncWrite
//! pair. [`execute`] is the process entry point a worker binary calls: it
//! installs tracing, isolates stdio and serves the process's own
//! stdin/stdout until the host closes it.
//!
//! Requests are handled strictly one at a time, so responses go out in the
//! order requests came in.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, WireCodec};
use crate::bridge::protocol::{Request, Response};
use crate::bridge::wire::EncodeError;
use crate::dispatcher::Dispatcher;
use crate::registry::HandlerRegistry;

pub const ENV_MAX_FRAME_BYTES: &str = "CALLBRIDGE_MAX_FRAME_BYTES";
pub const ENV_ISOLATE_STDIO: &str = "CALLBRIDGE_ISOLATE_STDIO";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to read request: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write response: {0}")]
    Write(#[source] io::Error),

    #[error("response could not be encoded: {0}")]
    Encode(#[source] EncodeError),

    #[error("invalid {var}={value:?}: {reason}")]
    Config {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("stdio setup failed: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    fn from_encode(err: EncodeError) -> Self {
        match err {
            EncodeError::Io(e) => Self::Write(e),
            other => Self::Encode(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Upper bound on a single frame in either direction.
    pub max_frame_length: usize,
    /// Move the protocol off fds 0/1 before serving. Unix only.
    pub isolate_stdio: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            isolate_stdio: true,
        }
    }
}

impl WorkerConfig {
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_isolate_stdio(mut self, isolate_stdio: bool) -> Self {
        self.isolate_stdio = isolate_stdio;
        self
    }

    /// Defaults overridden by `CALLBRIDGE_MAX_FRAME_BYTES` and
    /// `CALLBRIDGE_ISOLATE_STDIO`.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_MAX_FRAME_BYTES) {
            config.max_frame_length = match value.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(WorkerError::Config {
                        var: ENV_MAX_FRAME_BYTES,
                        value,
                        reason: "must be positive".into(),
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(WorkerError::Config {
                        var: ENV_MAX_FRAME_BYTES,
                        value,
                        reason: e.to_string(),
                    });
                }
            };
        }

        if let Some(value) = lookup(ENV_ISOLATE_STDIO) {
            config.isolate_stdio = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(WorkerError::Config {
                        var: ENV_ISOLATE_STDIO,
                        value,
                        reason: "expected a boolean".into(),
                    });
                }
            };
        }

        Ok(config)
    }
}

/// Counters for one [`serve`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Well-formed requests dispatched.
    pub requests: u64,
    /// Frames whose payload failed to decode.
    pub malformed: u64,
    /// Error responses sent, malformed frames included.
    pub errors: u64,
}

/// Serve requests from `reader` until it reaches end of stream.
///
/// A frame whose payload fails to decode is answered with an error response
/// and the loop continues. Transport failures (read/write errors, a broken
/// frame, end of stream mid-frame) end the loop with an error.
pub async fn serve<R, W>(
    dispatcher: &Dispatcher,
    reader: R,
    writer: W,
    config: &WorkerConfig,
) -> Result<ServeStats, WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(
        reader,
        WireCodec::<Request>::with_max_frame_length(config.max_frame_length),
    );
    let mut responses = FramedWrite::new(
        writer,
        WireCodec::<Response>::with_max_frame_length(config.max_frame_length),
    );
    let mut stats = ServeStats::default();

    while let Some(frame) = requests.next().await {
        let frame = frame.map_err(|e| {
            tracing::error!(error = %e, "Request stream broken");
            WorkerError::Read(e)
        })?;

        let response = match frame {
            Ok(request) => {
                stats.requests += 1;
                tracing::trace!(function = %request.function_name, "Request received");
                dispatcher.dispatch(request)
            }
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(error = %e, "Malformed request");
                Response::error(format!("malformed request: {e}"))
            }
        };
        if !response.is_ok() {
            stats.errors += 1;
        }

        send_response(&mut responses, response).await?;
    }

    responses.close().await.map_err(WorkerError::from_encode)?;
    tracing::debug!(?stats, "Request stream closed");
    Ok(stats)
}

/// Write one response. A result that cannot be encoded is replaced by an
/// error response so the host still gets its answer.
async fn send_response<W>(
    sink: &mut FramedWrite<W, WireCodec<Response>>,
    response: Response,
) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    match sink.send(response).await {
        Ok(()) => Ok(()),
        Err(EncodeError::Io(e)) => Err(WorkerError::Write(e)),
        Err(e) => {
            tracing::error!(error = %e, "Result could not be encoded");
            sink.send(Response::error(format!("result could not be encoded: {e}")))
                .await
                .map_err(WorkerError::from_encode)
        }
    }
}

/// Run a worker process over stdin/stdout with configuration from the
/// environment. Returns once the host closes the request stream.
pub fn execute(registry: HandlerRegistry) -> Result<ServeStats, WorkerError> {
    crate::logging::init_tracing();
    let config = WorkerConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
    })?;
    execute_with(registry, config)
}

pub fn execute_with(
    registry: HandlerRegistry,
    config: WorkerConfig,
) -> Result<ServeStats, WorkerError> {
    let dispatcher = Dispatcher::new(registry);
    tracing::info!(
        functions = ?dispatcher.registry().names(),
        isolate_stdio = config.isolate_stdio,
        "Worker starting"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)?;

    let result = if config.isolate_stdio {
        serve_isolated(&runtime, &dispatcher, &config)
    } else {
        runtime.block_on(serve(
            &dispatcher,
            tokio::io::stdin(),
            tokio::io::stdout(),
            &config,
        ))
    };

    // A blocked stdin read must not keep the process alive after the loop ends.
    runtime.shutdown_timeout(Duration::from_millis(100));

    match &result {
        Ok(stats) => tracing::info!(?stats, "Worker exiting"),
        Err(e) => tracing::error!(error = %e, "Worker failed"),
    }
    result
}

#[cfg(unix)]
fn serve_isolated(
    runtime: &tokio::runtime::Runtime,
    dispatcher: &Dispatcher,
    config: &WorkerConfig,
) -> Result<ServeStats, WorkerError> {
    let fds = crate::fd_redirect::isolate_stdio()?;
    let reader = tokio::fs::File::from_std(std::fs::File::from(fds.stdin_fd));
    let writer = tokio::fs::File::from_std(std::fs::File::from(fds.stdout_fd));
    runtime.block_on(serve(dispatcher, reader, writer, config))
}

#[cfg(not(unix))]
fn serve_isolated(
    runtime: &tokio::runtime::Runtime,
    dispatcher: &Dispatcher,
    config: &WorkerConfig,
) -> Result<ServeStats, WorkerError> {
    tracing::warn!("Stdio isolation is unavailable on this platform");
    runtime.block_on(serve(
        dispatcher,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
    ))
}
