//! Ready-made stream endpoints
//!
//! - [`memory`] - readables over iterators and sinks that collect into memory
//! - [`fs`] - file, stdin/stdout and generic `Read`/`Write` streams
//! - [`zlib`] - gzip, zlib and raw deflate compression transforms

pub mod fs;
pub mod memory;
pub mod zlib;

pub use fs::{WriteMode, create_read_stream, create_write_stream};
pub use memory::{Collected, collect, from_iter};
pub use zlib::{ZlibError, ZlibMode, zlib_stream};
