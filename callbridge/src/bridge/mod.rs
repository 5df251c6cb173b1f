//! Wire bridge between host and worker.
//!
//! - **wire**: binary encoding of [`Value`](crate::Value) trees
//! - **protocol**: request/response messages built on the value encoding
//! - **codec**: length-delimited framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
pub mod wire;

pub use codec::{DEFAULT_MAX_FRAME_LENGTH, WireCodec};
pub use protocol::{Request, Response, Status};
pub use wire::{DecodeError, EncodeError, MAX_DEPTH, WireMessage};
