//! Boundary Transport
//!
//! Carries every driver operation across the boundary between the caller's
//! context and the isolated worker context that owns the engine.
//!
//! # Design Philosophy
//!
//! The two sides share no memory. Each message is encoded into a CRC-checked
//! frame ([`frame`]) and handed over a channel of bytes:
//! - caller → worker: `{id, method, args}` requests
//! - worker → caller: `{id, ok, result|error}` responses, plus unsolicited
//!   `output`, `runstate` and `registers` events
//!
//! The request/response layer is a generic multiplexer keyed by id
//! ([`PendingRequests`]); it knows nothing about the method set. The worker
//! processes requests strictly one at a time, except `stop`, which is handled
//! out-of-band so it can interrupt a command that is still running.
//!
//! ```text
//!  caller context                          worker context
//! +----------------+   request frames   +--------------------------+
//! | WorkerClient   | -----------------> | dispatcher --> engine    |
//! |  pending table |                    |   (stop)       loop      |
//! |  reader task   | <----------------- | runstate poller  (owns   |
//! +----------------+  responses/events  | supervisor        engine)|
//!                                       +--------------------------+
//! ```

pub mod client;
pub mod frame;
pub mod messages;
pub mod pending;
pub mod worker;

use thiserror::Error;

pub use client::WorkerClient;
pub use messages::{ErrorKind, Event, RemoteError, Request, RequestId, Response, WorkerMessage};
pub use pending::PendingRequests;
pub use worker::{spawn_worker, WorkerHandle, WorkerLink};

/// Transport-level failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The worker context ended; every outstanding request is rejected with this
    #[error("worker context terminated: {0}")]
    ContextTerminated(String),

    /// The channel to the worker is closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Message serialization/deserialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A frame header announced a payload larger than [`frame::MAX_FRAME_SIZE`]
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    /// A frame did not hold exactly its announced payload
    #[error("frame length mismatch: declared {declared:?}, received {received} bytes")]
    FrameLength {
        /// Payload length from the header, if a full header arrived
        declared: Option<usize>,
        /// Bytes present after the header, or the whole frame when short
        received: usize,
    },

    /// Frame checksum mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// The worker does not implement the requested method
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The request arguments did not match the method
    #[error("bad request: {0}")]
    BadRequest(String),
}
