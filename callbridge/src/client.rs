//! Host side of one worker connection.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, WireCodec};
use crate::bridge::protocol::{Request, Response};
use crate::bridge::wire::{DecodeError, EncodeError};
use crate::value::{Value, ValueError};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The worker ran the call and reported a failure.
    #[error("{0}")]
    Remote(String),

    /// The request was rejected locally; nothing was sent.
    #[error("request could not be encoded: {0}")]
    Encode(#[source] EncodeError),

    #[error("malformed response: {0}")]
    Decode(#[source] DecodeError),

    #[error("worker transport failed: {0}")]
    Io(#[source] io::Error),

    #[error("worker connection closed")]
    Closed,

    #[error("unexpected result: {0}")]
    Convert(#[source] ValueError),
}

impl CallError {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether the connection that produced this error is still usable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Io(_) | Self::Closed)
    }
}

/// Request writer and response reader for one worker.
///
/// One call is in flight at a time. A call abandoned midway (its future
/// dropped) or a transport failure poisons the client: request/response
/// pairing can no longer be trusted, and later calls fail with
/// [`CallError::Closed`].
pub struct WorkerClient<R, W> {
    requests: FramedWrite<W, WireCodec<Request>>,
    responses: FramedRead<R, WireCodec<Response>>,
    poisoned: bool,
}

impl<R, W> WorkerClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame_length(reader, writer, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(reader: R, writer: W, max_frame_length: usize) -> Self {
        Self {
            requests: FramedWrite::new(
                writer,
                WireCodec::with_max_frame_length(max_frame_length),
            ),
            responses: FramedRead::new(
                reader,
                WireCodec::with_max_frame_length(max_frame_length),
            ),
            poisoned: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.poisoned
    }

    /// Call `function_name` with `argument` and wait for its result.
    pub async fn call(
        &mut self,
        function_name: &str,
        argument: impl Into<Value>,
    ) -> Result<Value, CallError> {
        if self.poisoned {
            return Err(CallError::Closed);
        }
        let request = Request::new(function_name, argument);

        // Cleared only once the matching response has been read.
        self.poisoned = true;

        match self.requests.send(request).await {
            Ok(()) => {}
            Err(EncodeError::Io(e)) => return Err(CallError::Io(e)),
            Err(e) => {
                // Rejected before anything reached the stream.
                self.poisoned = false;
                return Err(CallError::Encode(e));
            }
        }

        let response = match self.responses.next().await {
            None => return Err(CallError::Closed),
            Some(Err(e)) => return Err(CallError::Io(e)),
            Some(Ok(Err(e))) => return Err(CallError::Decode(e)),
            Some(Ok(Ok(response))) => response,
        };
        self.poisoned = false;

        tracing::trace!(function = function_name, status = %response.status(), "Response received");
        response.into_result().map_err(CallError::Remote)
    }

    /// [`call`](Self::call), converting the result into `T`.
    pub async fn call_as<T>(
        &mut self,
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

    /// Flush and close the request stream, signalling end of input to the
    /// worker.
    pub async fn close(&mut self) -> Result<(), CallError> {
        self.poisoned = true;
        self.requests.close().await.map_err(|e| match e {
            EncodeError::Io(e) => CallError::Io(e),
            other => CallError::Encode(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::registry::HandlerError;
    use crate::value::NdArray;
    use crate::worker::{ServeStats, WorkerConfig, WorkerError, serve};

    fn add(v: Value) -> Result<Value, HandlerError> {
        Ok(Value::Int64(v.get("a")?.as_i64()? + v.get("b")?.as_i64()?))
    }

    fn identity(v: Value) -> Result<Value, HandlerError> {
        Ok(v)
    }

    type Client = WorkerClient<DuplexStream, DuplexStream>;

    fn connect() -> (Client, tokio::task::JoinHandle<Result<ServeStats, WorkerError>>) {
        let (client_w, worker_r) = duplex(1 << 16);
        let (worker_w, client_r) = duplex(1 << 16);
        let dispatcher = Dispatcher::new(crate::handlers![add, identity].unwrap());
        let worker = tokio::spawn(async move {
            let config = WorkerConfig::default().with_isolate_stdio(false);
            serve(&dispatcher, worker_r, worker_w, &config).await
        });
        (WorkerClient::new(client_r, client_w), worker)
    }

    fn ab(a: i64, b: i64) -> Value {
        Value::mapping([("a", Value::Int64(a)), ("b", Value::Int64(b))])
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let (mut client, worker) = connect();

        assert_eq!(client.call("add", ab(3, 4)).await.unwrap(), Value::Int64(7));
        let n: i64 = client.call_as("add", ab(-1, 1)).await.unwrap();
        assert_eq!(n, 0);

        let arr = NdArray::vector(vec![1.5f32, -2.25]);
        let echoed: NdArray = client.call_as("identity", arr.clone()).await.unwrap();
        assert_eq!(echoed, arr);

        client.close().await.unwrap();
        let stats = worker.await.unwrap().unwrap();
        assert_eq!(stats.requests, 3);
    }

    #[tokio::test]
    async fn remote_errors_leave_client_usable() {
        let (mut client, _worker) = connect();

        let err = client.call("nope", Value::Null).await.unwrap_err();
        assert!(err.is_remote());
        insta::assert_snapshot!(err.to_string(), @"unknown function 'nope'");
        assert!(client.is_usable());

        assert_eq!(client.call("add", ab(1, 2)).await.unwrap(), Value::Int64(3));
    }

    #[tokio::test]
    async fn encode_rejection_sends_nothing() {
        let (mut client, _worker) = connect();

        let err = client.call("", Value::Null).await.unwrap_err();
        assert!(matches!(err, CallError::Encode(EncodeError::EmptyFunctionName)));
        assert!(!err.is_transport());
        assert!(client.is_usable());

        assert_eq!(client.call("identity", 9i64).await.unwrap(), Value::Int64(9));
    }

    #[tokio::test]
    async fn conversion_failure_is_reported() {
        let (mut client, _worker) = connect();
        let err = client.call_as::<String>("add", ab(1, 2)).await.unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"unexpected result: expected string, found int64");
    }

    #[tokio::test]
    async fn worker_gone_is_closed_and_poisons() {
        let (client_w, worker_r) = duplex(1024);
        let (worker_w, client_r) = duplex(1024);
        drop(worker_w);
        let mut client = WorkerClient::new(client_r, client_w);

        let err = client.call("add", ab(1, 2)).await.unwrap_err();
        assert!(matches!(err, CallError::Closed));
        assert!(err.is_transport());
        assert!(!client.is_usable());
        drop(worker_r);

        assert!(matches!(
            client.call("add", ab(1, 2)).await.unwrap_err(),
            CallError::Closed
        ));
    }

    #[tokio::test]
    async fn abandoned_call_poisons_client() {
        // Nobody answers on this connection.
        let (client_w, _worker_r) = duplex(1024);
        let (_worker_w, client_r) = duplex(1024);
        let mut client = WorkerClient::new(client_r, client_w);

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            client.call("add", ab(1, 2)),
        )
        .await;
        assert!(pending.is_err());
        assert!(!client.is_usable());
    }
}
