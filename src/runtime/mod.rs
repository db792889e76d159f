//! Runtime primitives shared by every stream
//!
//! - [`EventLoop`]: the single-threaded cooperative task queue
//! - [`Emitter`]: per-notification listener registries

mod event_loop;
mod events;

pub use event_loop::{EventLoop, TimerId};
pub use events::{Emitter, ListenerId};

use crate::error::StreamError;
use thiserror::Error;

/// Errors that can occur while driving the event loop
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unhandled stream error: {0}")]
    UnhandledError(StreamError),

    #[error("Event loop is already running")]
    Reentrant,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
