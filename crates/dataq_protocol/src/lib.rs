//! DataQ plugin protocol.
//!
//! Plugins are separate processes that talk to the worker over stdin/stdout.
//! Each message is a JSON document wrapped in a length-prefixed frame:
//!
//! ```text
//! [LEN:8 big endian][JSON body]
//! ```
//!
//! The worker writes [`PluginRequest`]s and reads [`PluginResponse`]s.
//! Every request is answered by zero or more item/action/error responses
//! followed by exactly one `done`. A plugin writes `closed` when it exits.

pub mod error;
pub mod framing;
pub mod hash;
pub mod types;

pub use error::{FramingError, ProtocolError, Result};
pub use framing::{
    read_frame, read_frame_async, spawn_frame_stream, write_frame, write_frame_async, FrameIter,
    FrameStream, DEFAULT_STREAM_CAPACITY, LENGTH_SIZE, MAX_FRAME_LEN,
};
pub use hash::{encode_id, ContentHash, HASH_LEN};
pub use types::{
    decode_message, encode_message, Action, Config, DataItem, Operation, PluginRequest,
    PluginResponse, ResponsePayload,
};
