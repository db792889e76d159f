//! `cat` command: copy bytes through an optional chain of transforms

use crate::config::StreamOptions;
use crate::encoding::{Encoding, StringDecoder};
use crate::error::{StreamError, StreamResult};
use crate::pipeline::{Pipeline, pipeline};
use crate::runtime::{EventLoop, RuntimeError};
use crate::stream::{Chunk, Completion, ReadableController, ReadableStream, Transform, Transformer};
use crate::transport::{
    WriteMode, create_read_stream, create_write_stream,
    fs::{stdin, stdout},
    zlib::{ZlibMode, compression_level, zlib_stream},
};
use colored::Colorize;
use std::{
    cell::{Cell, RefCell},
    io,
    path::PathBuf,
    rc::Rc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Errors reported by the `cat` command
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type CliResult<T> = Result<T, CliError>;

/// `cat` configuration
#[derive(Debug, Clone)]
pub struct CatConfig {
    /// Input file, stdin when `None`
    pub input: Option<PathBuf>,
    /// Output file, stdout when `None`
    pub output: Option<PathBuf>,
    /// Compression step applied first
    pub codec: Option<ZlibMode>,
    /// Compression level, -1 for the default
    pub level: i32,
    /// Render the bytes as text in this encoding
    pub encode: Option<Encoding>,
    /// Default byte high-water mark for every stream in the chain
    pub high_water_mark: Option<usize>,
}

impl Default for CatConfig {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            codec: None,
            level: -1,
            encode: None,
            high_water_mark: None,
        }
    }
}

/// What a finished `cat` moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatSummary {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
}

impl CatSummary {
    /// One-line report for stderr
    pub fn report(&self) -> String {
        format!(
            "{}: {} bytes in, {} bytes out ({:.1?})",
            "Done".green(),
            self.bytes_in.to_string().bold(),
            self.bytes_out.to_string().bold(),
            self.elapsed
        )
    }
}

/// Renders bytes as text, re-emitted as bytes so it chains with other stages
struct EncodeTransformer {
    decoder: StringDecoder,
}

impl Transformer<Vec<u8>, Vec<u8>> for EncodeTransformer {
    fn transform(&mut self, chunk: Chunk<Vec<u8>>, out: &ReadableController<Vec<u8>>, done: Completion) {
        let text = self.decoder.write(&chunk.payload);
        if !text.is_empty() {
            out.push(text.into_bytes());
        }
        done.complete();
    }

    fn flush(&mut self, out: &ReadableController<Vec<u8>>, done: Completion) {
        let text = self.decoder.end(None);
        if !text.is_empty() {
            out.push(text.into_bytes());
        }
        done.complete();
    }
}

type ByteStage = Transform<Vec<u8>, Vec<u8>>;

impl CatConfig {
    /// Options for every stream of the chain
    fn stream_options(&self) -> StreamOptions {
        match self.high_water_mark {
            Some(hwm) => StreamOptions::new().high_water_mark(hwm),
            None => StreamOptions::new(),
        }
    }
}

fn stages(rt: &EventLoop, config: &CatConfig) -> Vec<ByteStage> {
    let mut stages = Vec::new();
    if let Some(mode) = config.codec {
        stages.push(zlib_stream(
            rt,
            mode,
            compression_level(config.level),
            config.stream_options(),
        ));
    }
    if let Some(encoding) = config.encode {
        stages.push(Transform::new(
            rt,
            config.stream_options(),
            EncodeTransformer {
                decoder: StringDecoder::new(encoding),
            },
        ));
    }
    stages
}

/// Run `cat` to completion on a fresh event loop
pub fn run_cat(config: &CatConfig) -> CliResult<CatSummary> {
    let started = Instant::now();
    let rt = EventLoop::new();

    let src = match &config.input {
        Some(path) => create_read_stream(&rt, path, config.stream_options()).map_err(|source| {
            CliError::Open {
                path: path.clone(),
                source,
            }
        })?,
        None => stdin(&rt, config.stream_options()),
    };
    let sink = match &config.output {
        Some(path) => create_write_stream(&rt, path, WriteMode::Truncate, config.stream_options())
            .map_err(|source| CliError::Open {
                path: path.clone(),
                source,
            })?,
        None => stdout(&rt, config.stream_options()),
    };

    let bytes_in = Rc::new(Cell::new(0u64));
    let counter = bytes_in.clone();
    src.on_data(move |chunk| counter.set(counter.get() + chunk.len() as u64));

    let stages = stages(&rt, config);
    let bytes_out = Rc::new(Cell::new(0u64));
    let counter = bytes_out.clone();
    match stages.last() {
        Some(last) => last.on_data(move |chunk| counter.set(counter.get() + chunk.len() as u64)),
        None => src.on_data(move |chunk| counter.set(counter.get() + chunk.len() as u64)),
    };

    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    let callback = move |result: StreamResult<()>| *slot.borrow_mut() = Some(result);

    let mut stages = stages.into_iter();
    match stages.next() {
        None => {
            pipeline(src, sink, callback);
        }
        Some(first) => {
            let mut chain = Pipeline::new(src).pipe(first);
            for stage in stages {
                chain = chain.pipe(stage);
            }
            chain.finish(sink, callback);
        }
    }

    rt.run()?;
    tracing::debug!(
        bytes_in = bytes_in.get(),
        bytes_out = bytes_out.get(),
        "cat finished"
    );

    match outcome.borrow_mut().take() {
        Some(Ok(())) => Ok(CatSummary {
            bytes_in: bytes_in.get(),
            bytes_out: bytes_out.get(),
            elapsed: started.elapsed(),
        }),
        Some(Err(err)) => Err(err.into()),
        // The loop drained without the pipeline settling
        None => Err(StreamError::PrematureClose.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_high_water_mark;
    use crate::error::ErrorKind;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_plain_copy() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"hello streams").unwrap();

        let summary = run_cat(&CatConfig {
            input: Some(input),
            output: Some(output.clone()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"hello streams");
        assert_eq!(summary.bytes_in, 13);
        assert_eq!(summary.bytes_out, 13);
    }

    #[test]
    fn test_gzip_then_gunzip() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let packed = dir.path().join("in.gz");
        let unpacked = dir.path().join("out");
        let content = "line of text\n".repeat(500);
        std::fs::write(&input, &content).unwrap();

        let summary = run_cat(&CatConfig {
            input: Some(input),
            output: Some(packed.clone()),
            codec: Some(ZlibMode::Gzip),
            level: 9,
            ..Default::default()
        })
        .unwrap();
        assert!(summary.bytes_out < summary.bytes_in);

        run_cat(&CatConfig {
            input: Some(packed),
            output: Some(unpacked.clone()),
            codec: Some(ZlibMode::Gunzip),
            level: -1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(std::fs::read_to_string(&unpacked).unwrap(), content);
    }

    #[test]
    fn test_hex_encode() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, [0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        run_cat(&CatConfig {
            input: Some(input),
            output: Some(output.clone()),
            encode: Some(Encoding::Hex),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "deadbeef");
    }

    #[test]
    fn test_high_water_mark_is_per_run() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        let content = "abcdefgh".repeat(64);
        std::fs::write(&input, &content).unwrap();
        let default = default_high_water_mark(false);

        run_cat(&CatConfig {
            input: Some(input),
            output: Some(output.clone()),
            codec: Some(ZlibMode::Deflate),
            high_water_mark: Some(7),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(default_high_water_mark(false), default);
        let packed = std::fs::read(&output).unwrap();
        let mut plain = String::new();
        flate2::read::ZlibDecoder::new(&packed[..])
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain, content);
    }

    #[test]
    fn test_missing_input() {
        let dir = tempdir().unwrap();
        let err = run_cat(&CatConfig {
            input: Some(dir.path().join("missing")),
            output: Some(dir.path().join("out")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CliError::Open { .. }));
    }

    #[test]
    fn test_corrupt_gzip_reports_stage() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::write(&input, b"not compressed at all").unwrap();

        let err = run_cat(&CatConfig {
            input: Some(input),
            output: Some(dir.path().join("out")),
            codec: Some(ZlibMode::Gunzip),
            ..Default::default()
        })
        .unwrap_err();
        match err {
            CliError::Stream(err) => {
                assert_eq!(err.kind(), ErrorKind::Pipeline);
                assert!(matches!(err, StreamError::Pipeline { stage: 1, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
