//! Pool of worker connections.
//!
//! Idle workers sit in a bounded channel. A call takes one out, runs a single
//! request on it and puts it back. Each checked-out worker carries its own
//! sender into the channel, so once the last worker is gone the receiver
//! reports the pool closed instead of waiting forever.
//!
//! A worker whose connection is poisoned (transport failure, or a call that
//! was abandoned midway) is not returned: it is dropped, its process killed,
//! and pool capacity is permanently reduced.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::client::{CallError, WorkerClient};
use crate::process::{DEFAULT_SHUTDOWN_GRACE, SpawnError, WorkerSpawner, stop_child, take_pipes};
use crate::value::{Value, ValueError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_frame_length: usize,
    pub shutdown_grace: Duration,
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

struct Member {
    index: usize,
    client: WorkerClient<BoxedReader, BoxedWriter>,
    child: Option<Child>,
    idle_tx: mpsc::Sender<Member>,
    live: Arc<AtomicUsize>,
}

/// A member checked out for one call. Returns to the pool on drop if its
/// connection is still usable, otherwise retires it.
struct Lease {
    member: Option<Member>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(mut member) = self.member.take() else {
            return;
        };

        if member.client.is_usable() {
            let idle_tx = member.idle_tx.clone();
            if idle_tx.try_send(member).is_err() {
                tracing::error!("Failed to return worker to pool");
            }
            return;
        }

        let remaining = member.live.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::warn!(
            worker = member.index,
            remaining,
            "Worker connection poisoned - capacity reduced"
        );
        if let Some(child) = member.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(worker = member.index, error = %e, "Failed to kill worker");
        }
    }
}

pub struct WorkerPool {
    idle_rx: Mutex<mpsc::Receiver<Member>>,
    size: usize,
    live: Arc<AtomicUsize>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    /// Spawn `config.workers` worker processes.
    pub fn start(spawner: &dyn WorkerSpawner, config: &PoolConfig) -> Result<Self, SpawnError> {
        if config.workers == 0 {
            return Err(SpawnError::NoWorkers);
        }

        let mut members = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let mut child = spawner.spawn()?;
            let (stdout, stdin) = take_pipes(&mut child)?;
            members.push((
                Box::new(stdout) as BoxedReader,
                Box::new(stdin) as BoxedWriter,
                Some(child),
            ));
        }

        let pool = Self::build(members, config);
        tracing::info!(workers = pool.size, "Worker pool started");
        Ok(pool)
    }

    /// Pool over already-established connections, e.g. in-process workers.
    pub fn from_connections<R, W>(connections: Vec<(R, W)>, config: &PoolConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let members = connections
            .into_iter()
            .map(|(r, w)| (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter, None))
            .collect();
        Self::build(members, config)
    }

    fn build(members: Vec<(BoxedReader, BoxedWriter, Option<Child>)>, config: &PoolConfig) -> Self {
        let size = members.len();
        let (idle_tx, idle_rx) = mpsc::channel(size.max(1));
        let live = Arc::new(AtomicUsize::new(size));

        for (index, (reader, writer, child)) in members.into_iter().enumerate() {
            let member = Member {
                index,
                client: WorkerClient::with_max_frame_length(
                    reader,
                    writer,
                    config.max_frame_length,
                ),
                child,
                idle_tx: idle_tx.clone(),
                live: Arc::clone(&live),
            };
            if idle_tx.try_send(member).is_err() {
                tracing::error!(worker = index, "Failed to add worker to pool");
            }
        }

        Self {
            idle_rx: Mutex::new(idle_rx),
            size,
            live,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Number of workers the pool started with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not yet retired.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    async fn acquire(&self) -> Result<Lease, CallError> {
        let mut idle_rx = self.idle_rx.lock().await;
        let member = idle_rx.recv().await.ok_or(CallError::Closed)?;
        Ok(Lease {
            member: Some(member),
        })
    }

    /// Run one call on the next idle worker, waiting for one if all are busy.
    pub async fn call(
        &self,
        function_name: &str,
        argument: impl Into<Value>,
    ) -> Result<Value, CallError> {
        let argument = argument.into();
        let mut lease = self.acquire().await?;
        let Some(member) = lease.member.as_mut() else {
            return Err(CallError::Closed);
        };
        tracing::trace!(worker = member.index, function = function_name, "Dispatching call");
        member.client.call(function_name, argument).await
    }

    pub async fn call_as<T>(
        &self,
        function_name: &str,
        argument: impl Into<Value>,
    ) -> Result<T, CallError>
    where
        T: TryFrom<Value>,
        T::Error: Into<ValueError>,
    {
        let value = self.call(function_name, argument).await?;
        T::try_from(value).map_err(|e| CallError::Convert(e.into()))
    }

    /// Close every worker's input and wait for worker processes to exit.
    /// Returns the number of workers stopped.
    pub async fn shutdown(self) -> usize {
        let mut idle_rx = self.idle_rx.into_inner();
        idle_rx.close();

        let mut stopped = 0;
        while let Some(mut member) = idle_rx.recv().await {
            if let Err(e) = member.client.close().await {
                tracing::debug!(worker = member.index, error = %e, "Worker input already closed");
            }
            let Member {
                index,
                client,
                child,
                ..
            } = member;
            drop(client);

            if let Some(mut child) = child {
                match stop_child(&mut child, self.shutdown_grace).await {
                    Ok(status) => tracing::debug!(worker = index, %status, "Worker exited"),
                    Err(e) => tracing::warn!(worker = index, error = %e, "Failed to stop worker"),
                }
            }
            stopped += 1;
        }

        tracing::info!(stopped, "Worker pool shut down");
        stopped
    }
}
