//! callbridge: call named functions in a worker process and get typed values back.
//!
//! A host sends `Request { function_name, argument }` frames to a worker over
//! a byte stream; the worker looks the name up in its [`HandlerRegistry`],
//! runs the handler and answers with exactly one [`Response`], in order.
//! Values are a small dynamic model ([`Value`]) that carries dense numeric
//! arrays ([`NdArray`]) without reinterpreting their element type.
//!
//! Worker side: build a registry (see [`handlers!`]) and hand it to
//! [`execute`]. Host side: [`WorkerProcess`] for a single worker,
//! [`WorkerPool`] for several.

pub mod bridge;
mod client;
mod dispatcher;
#[cfg(unix)]
mod fd_redirect;
mod json;
mod logging;
mod pool;
mod process;
mod registry;
pub mod value;
pub mod worker;

pub use bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, WireCodec};
pub use bridge::protocol::{Request, Response, Status};
pub use bridge::wire::{DecodeError, EncodeError};
pub use client::{CallError, WorkerClient};
pub use dispatcher::Dispatcher;
pub use json::JsonError;
pub use logging::init_tracing;
pub use pool::{PoolConfig, WorkerPool};
pub use process::{
    CommandSpawner, DEFAULT_SHUTDOWN_GRACE, SpawnError, WorkerProcess, WorkerSpawner,
};
pub use registry::{HandlerError, HandlerFn, HandlerRegistry, RegistryError};
pub use value::{ElementType, Mapping, NdArray, Value, ValueError};
pub use worker::{ServeStats, WorkerConfig, WorkerError, execute, execute_with, serve};
