//! Stream construction options

use crate::encoding::Encoding;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default high-water mark for byte streams (64 KiB)
pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 64 * 1024;

/// Default high-water mark for object-mode streams (in chunks)
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Process-wide default high-water marks, adjustable at runtime
static BYTE_HIGH_WATER_MARK: AtomicUsize = AtomicUsize::new(DEFAULT_BYTE_HIGH_WATER_MARK);
static OBJECT_HIGH_WATER_MARK: AtomicUsize = AtomicUsize::new(DEFAULT_OBJECT_HIGH_WATER_MARK);

/// Get the default high-water mark used when a stream does not set one
pub fn default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        OBJECT_HIGH_WATER_MARK.load(Ordering::SeqCst)
    } else {
        BYTE_HIGH_WATER_MARK.load(Ordering::SeqCst)
    }
}

/// Set the default high-water mark for streams created afterwards
pub fn set_default_high_water_mark(object_mode: bool, value: usize) {
    if object_mode {
        OBJECT_HIGH_WATER_MARK.store(value, Ordering::SeqCst);
    } else {
        BYTE_HIGH_WATER_MARK.store(value, Ordering::SeqCst);
    }
}

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Buffer level (bytes, or chunks in object mode) at which backpressure starts
    pub high_water_mark: Option<usize>,

    /// Count every chunk as one unit regardless of its size
    pub object_mode: bool,

    /// Overrides `high_water_mark` for the readable side of a duplex
    pub readable_high_water_mark: Option<usize>,

    /// Overrides `high_water_mark` for the writable side of a duplex
    pub writable_high_water_mark: Option<usize>,

    /// Overrides `object_mode` for the readable side of a duplex
    pub readable_object_mode: Option<bool>,

    /// Overrides `object_mode` for the writable side of a duplex
    pub writable_object_mode: Option<bool>,

    /// Duplex only: keep one side open after the other one completed (default: true)
    pub allow_half_open: bool,

    /// Destroy the stream once it ended/finished (default: true)
    pub auto_destroy: bool,

    /// Emit `close` after the stream was destroyed (default: true)
    pub emit_close: bool,

    /// Encoding recorded on chunks written without an explicit one
    pub default_encoding: Encoding,

    /// Transport tag recorded on the stream, e.g. "file"
    pub transport: Option<&'static str>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            readable_high_water_mark: None,
            writable_high_water_mark: None,
            readable_object_mode: None,
            writable_object_mode: None,
            allow_half_open: true,
            auto_destroy: true,
            emit_close: true,
            default_encoding: Encoding::Utf8,
            transport: None,
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a stream of arbitrary values
    pub fn objects() -> Self {
        Self::default().object_mode(true)
    }

    pub fn high_water_mark(mut self, value: usize) -> Self {
        self.high_water_mark = Some(value);
        self
    }

    pub fn object_mode(mut self, value: bool) -> Self {
        self.object_mode = value;
        self
    }

    pub fn readable_high_water_mark(mut self, value: usize) -> Self {
        self.readable_high_water_mark = Some(value);
        self
    }

    pub fn writable_high_water_mark(mut self, value: usize) -> Self {
        self.writable_high_water_mark = Some(value);
        self
    }

    pub fn readable_object_mode(mut self, value: bool) -> Self {
        self.readable_object_mode = Some(value);
        self
    }

    pub fn writable_object_mode(mut self, value: bool) -> Self {
        self.writable_object_mode = Some(value);
        self
    }

    pub fn allow_half_open(mut self, value: bool) -> Self {
        self.allow_half_open = value;
        self
    }

    pub fn auto_destroy(mut self, value: bool) -> Self {
        self.auto_destroy = value;
        self
    }

    pub fn emit_close(mut self, value: bool) -> Self {
        self.emit_close = value;
        self
    }

    pub fn default_encoding(mut self, value: Encoding) -> Self {
        self.default_encoding = value;
        self
    }

    pub fn transport(mut self, tag: &'static str) -> Self {
        self.transport = Some(tag);
        self
    }

    /// Resolved `(object_mode, high_water_mark)` for the readable side
    pub(crate) fn readable_side(&self) -> (bool, usize) {
        let object_mode = self.readable_object_mode.unwrap_or(self.object_mode);
        let hwm = self
            .readable_high_water_mark
            .or(self.high_water_mark)
            .unwrap_or_else(|| default_high_water_mark(object_mode));
        (object_mode, hwm)
    }

    /// Resolved `(object_mode, high_water_mark)` for the writable side
    pub(crate) fn writable_side(&self) -> (bool, usize) {
        let object_mode = self.writable_object_mode.unwrap_or(self.object_mode);
        let hwm = self
            .writable_high_water_mark
            .or(self.high_water_mark)
            .unwrap_or_else(|| default_high_water_mark(object_mode));
        (object_mode, hwm)
    }
}
