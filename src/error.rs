//! Stream error types

use crate::encoding::EncodingError;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by user-supplied stream callbacks
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared, cloneable error cause.
///
/// A stream error is delivered to every `error` listener, to `finished`
/// callbacks and to a pipeline's completion callback, so the cause is shared.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Misuse of a stream that is reported synchronously to the caller
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("write after end")]
    WriteAfterEnd,

    #[error("stream.push() after EOF")]
    PushAfterEnd,

    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    #[error("cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),
}

/// Errors that can occur on a stream
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("Production error: {0}")]
    Production(#[source] SharedError),

    #[error("Consumption error: {0}")]
    Consumption(#[source] SharedError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error("Pipeline stage {stage} failed: {source}")]
    Pipeline {
        stage: usize,
        #[source]
        source: Box<StreamError>,
    },

    #[error("Premature close")]
    PrematureClose,

    #[error("IO error: {0}")]
    Io(#[source] SharedError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("The operation was aborted")]
    Aborted,
}

/// Coarse classification of a [`StreamError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Production,
    Consumption,
    Protocol,
    Pipeline,
    PrematureClose,
    Io,
    Encoding,
    Aborted,
}

impl StreamError {
    /// Wrap a failure raised by a production, transform or finalization callback.
    ///
    /// `std::io::Error` causes are reported as [`StreamError::Io`].
    pub fn production(err: impl Into<BoxError>) -> Self {
        Self::classify(err.into(), StreamError::Production)
    }

    /// Wrap a failure raised by a consumption callback
    pub fn consumption(err: impl Into<BoxError>) -> Self {
        Self::classify(err.into(), StreamError::Consumption)
    }

    fn classify(err: BoxError, wrap: fn(SharedError) -> StreamError) -> Self {
        match err.downcast::<std::io::Error>() {
            Ok(io) => StreamError::Io(Arc::new(*io)),
            Err(other) => wrap(Arc::from(other)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Production(_) => ErrorKind::Production,
            StreamError::Consumption(_) => ErrorKind::Consumption,
            StreamError::Protocol(_) => ErrorKind::Protocol,
            StreamError::Pipeline { .. } => ErrorKind::Pipeline,
            StreamError::PrematureClose => ErrorKind::PrematureClose,
            StreamError::Io(_) => ErrorKind::Io,
            StreamError::Encoding(_) => ErrorKind::Encoding,
            StreamError::Aborted => ErrorKind::Aborted,
        }
    }

    /// The error a pipeline failure originated from
    pub fn root(&self) -> &StreamError {
        match self {
            StreamError::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_display() {
        let err = StreamError::consumption("disk full");
        assert_eq!(err.kind(), ErrorKind::Consumption);
        assert_eq!(err.to_string(), "Consumption error: disk full");
        assert!(err.source().is_some());

        let err: StreamError = ProtocolViolation::WriteAfterEnd.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.to_string(), "write after end");
    }

    #[test]
    fn test_pipeline_root() {
        let inner = StreamError::production("bad chunk");
        let err = StreamError::Pipeline {
            stage: 1,
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::Pipeline);
        assert_eq!(err.root().kind(), ErrorKind::Production);
        assert_eq!(err.to_string(), "Pipeline stage 1 failed: Production error: bad chunk");
    }

    #[test]
    fn test_io_and_encoding_conversions() {
        let err: StreamError = std::io::Error::other("pipe closed").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        let err = StreamError::consumption(std::io::Error::other("disk full"));
        assert_eq!(err.kind(), ErrorKind::Io);

        let err: StreamError = EncodingError::Unknown("ebcdic".into()).into();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert_eq!(err.to_string(), "Unknown encoding: ebcdic");
    }
}
