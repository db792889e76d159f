//! nodestream - Node.js-style streams for Rust
//!
//! A single-threaded stream engine modelled on Node.js streams:
//! - Readable, Writable, Duplex, Transform and PassThrough streams
//! - High-water-mark backpressure, corking, flowing and paused modes
//! - `pipe`, supervised `pipeline` and `finished`
//! - File, stdio, in-memory and zlib transports
//!
//! Everything runs on an [`EventLoop`]: callbacks are deferred to its
//! microtask queue and timers use a virtual clock, so stream programs are
//! deterministic.

pub mod cli;
pub mod config;
pub mod encoding;
pub mod error;
pub mod pipe;
pub mod pipeline;
pub mod runtime;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::StreamOptions;
pub use encoding::{Encoding, StringDecoder};
pub use error::{BoxError, ErrorKind, ProtocolViolation, StreamError, StreamResult};
pub use pipe::PipeOptions;
pub use pipeline::{Cleanup, FinishedOptions, Pipeline, PipelineHandle, finished, finished_with, pipeline};
pub use runtime::{EventLoop, ListenerId, RuntimeError, RuntimeResult};
pub use stream::{
    Chunk, Completion, Duplex, PassThrough, Payload, Readable, ReadableController, ReadableStream,
    Sink, Source, Stream, StreamId, StreamKind, Transform, Transformer, Writable, WritableStream,
};
