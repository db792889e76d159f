//! Compression transforms
//!
//! Uses flate2 with zlib-rs backend for maximum performance.
//! Provides gzip/gunzip, deflate/inflate (zlib format with header),
//! deflate_raw/inflate_raw and unzip (gzip or zlib, detected from the header).

use crate::config::StreamOptions;
use crate::error::StreamError;
use crate::runtime::EventLoop;
use crate::stream::{Chunk, Completion, ReadableController, Transform, Transformer};
use flate2::{
    Compression,
    write::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder},
};
use std::{collections::VecDeque, fmt, io::Write};
use thiserror::Error;

const TRANSPORT: &str = "zlib";

/// Default compression level
pub const DEFAULT_LEVEL: u32 = 6;

/// Largest output chunk pushed to the readable side
pub const CHUNK_SIZE: usize = 16 * 1024;

/// First two bytes of a gzip member
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Failure of a compression transform, e.g. corrupt input
#[derive(Error, Debug)]
#[error("{mode} error: {source}")]
pub struct ZlibError {
    pub mode: ZlibMode,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZlibMode {
    Gzip,
    Gunzip,
    Deflate,
    Inflate,
    DeflateRaw,
    InflateRaw,
    Unzip,
}

impl fmt::Display for ZlibMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ZlibMode::Gzip => "gzip",
            ZlibMode::Gunzip => "gunzip",
            ZlibMode::Deflate => "deflate",
            ZlibMode::Inflate => "inflate",
            ZlibMode::DeflateRaw => "deflateRaw",
            ZlibMode::InflateRaw => "inflateRaw",
            ZlibMode::Unzip => "unzip",
        })
    }
}

/// Map a Node.js style level (-1 for default, 0-9) to a flate2 level
pub fn compression_level(level: i32) -> Compression {
    if level == -1 {
        Compression::new(DEFAULT_LEVEL)
    } else {
        Compression::new(level.clamp(0, 9) as u32)
    }
}

enum Codec {
    GzEncode(GzEncoder<Vec<u8>>),
    GzDecode(GzDecoder<Vec<u8>>),
    ZlibEncode(ZlibEncoder<Vec<u8>>),
    ZlibDecode(ZlibDecoder<Vec<u8>>),
    RawEncode(DeflateEncoder<Vec<u8>>),
    RawDecode(DeflateDecoder<Vec<u8>>),
    /// Unzip before the header was seen
    Detect(Vec<u8>),
}

impl Codec {
    fn new(mode: ZlibMode, level: Compression) -> Self {
        match mode {
            ZlibMode::Gzip => Codec::GzEncode(GzEncoder::new(Vec::new(), level)),
            ZlibMode::Gunzip => Codec::GzDecode(GzDecoder::new(Vec::new())),
            ZlibMode::Deflate => Codec::ZlibEncode(ZlibEncoder::new(Vec::new(), level)),
            ZlibMode::Inflate => Codec::ZlibDecode(ZlibDecoder::new(Vec::new())),
            ZlibMode::DeflateRaw => Codec::RawEncode(DeflateEncoder::new(Vec::new(), level)),
            ZlibMode::InflateRaw => Codec::RawDecode(DeflateDecoder::new(Vec::new())),
            ZlibMode::Unzip => Codec::Detect(Vec::new()),
        }
    }

    /// Feed input; returns the output produced so far
    fn write(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        if let Codec::Detect(head) = self {
            head.extend_from_slice(input);
            if head.len() < GZIP_MAGIC.len() {
                return Ok(Vec::new());
            }
            let head = std::mem::take(head);
            *self = if head[..2] == GZIP_MAGIC {
                Codec::GzDecode(GzDecoder::new(Vec::new()))
            } else {
                Codec::ZlibDecode(ZlibDecoder::new(Vec::new()))
            };
            return self.write(&head);
        }

        match self {
            Codec::GzEncode(c) => c.write_all(input)?,
            Codec::GzDecode(c) => c.write_all(input)?,
            Codec::ZlibEncode(c) => c.write_all(input)?,
            Codec::ZlibDecode(c) => c.write_all(input)?,
            Codec::RawEncode(c) => c.write_all(input)?,
            Codec::RawDecode(c) => c.write_all(input)?,
            Codec::Detect(_) => {}
        }
        Ok(self.take_output())
    }

    /// Write trailers and return the remaining output
    fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::GzEncode(c) => c.try_finish()?,
            Codec::GzDecode(c) => c.try_finish()?,
            Codec::ZlibEncode(c) => c.try_finish()?,
            Codec::ZlibDecode(c) => c.try_finish()?,
            Codec::RawEncode(c) => c.try_finish()?,
            Codec::RawDecode(c) => c.try_finish()?,
            Codec::Detect(head) if head.is_empty() => {}
            Codec::Detect(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "unexpected end of file",
                ));
            }
        }
        Ok(self.take_output())
    }

    fn take_output(&mut self) -> Vec<u8> {
        let out = match self {
            Codec::GzEncode(c) => c.get_mut(),
            Codec::GzDecode(c) => c.get_mut(),
            Codec::ZlibEncode(c) => c.get_mut(),
            Codec::ZlibDecode(c) => c.get_mut(),
            Codec::RawEncode(c) => c.get_mut(),
            Codec::RawDecode(c) => c.get_mut(),
            Codec::Detect(_) => return Vec::new(),
        };
        std::mem::take(out)
    }
}

struct ZlibTransformer {
    mode: ZlibMode,
    codec: Codec,
    chunk_size: usize,
    /// Output not pushed yet because the readable side is full
    backlog: VecDeque<Vec<u8>>,
    /// Completion of the write or flush that produced the backlog
    parked: Option<Completion>,
    bytes_in: u64,
    bytes_out: u64,
}

impl ZlibTransformer {
    /// Push backlog pieces until the readable side asks to stop.
    /// Returns whether the backlog is empty.
    fn drain(&mut self, out: &ReadableController<Vec<u8>>) -> bool {
        while let Some(piece) = self.backlog.pop_front() {
            self.bytes_out += piece.len() as u64;
            if !out.push(piece) {
                break;
            }
        }
        self.backlog.is_empty()
    }

    fn emit(&mut self, out: &ReadableController<Vec<u8>>, result: std::io::Result<Vec<u8>>, done: Completion) {
        match result {
            Ok(bytes) => {
                self.backlog
                    .extend(bytes.chunks(self.chunk_size).map(<[u8]>::to_vec));
                if self.drain(out) {
                    done.complete();
                } else {
                    tracing::trace!(mode = %self.mode, pieces = self.backlog.len(), "output held back");
                    self.parked = Some(done);
                }
            }
            Err(source) => {
                tracing::debug!(mode = %self.mode, "{}", source);
                done.fail(ZlibError {
                    mode: self.mode,
                    source,
                });
            }
        }
    }
}

impl Transformer<Vec<u8>, Vec<u8>> for ZlibTransformer {
    fn transform(&mut self, chunk: Chunk<Vec<u8>>, out: &ReadableController<Vec<u8>>, done: Completion) {
        self.bytes_in += chunk.payload.len() as u64;
        let result = self.codec.write(&chunk.payload);
        self.emit(out, result, done);
    }

    fn flush(&mut self, out: &ReadableController<Vec<u8>>, done: Completion) {
        let result = self.codec.finish();
        self.emit(out, result, done);
        tracing::debug!(
            mode = %self.mode,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            "flushed"
        );
    }

    fn pull(&mut self, out: &ReadableController<Vec<u8>>) {
        if self.parked.is_none() || !self.drain(out) {
            return;
        }
        let (Some(done), Some(rt)) = (self.parked.take(), out.event_loop()) else {
            return;
        };
        // Settled outside the transformer, the next write may arrive right away
        rt.next_tick(move || done.complete());
    }

    fn destroy(&mut self, _err: Option<&StreamError>) {
        self.backlog.clear();
        if let Some(done) = self.parked.take() {
            done.discard();
        }
    }
}

/// Byte transform applying `mode` at the given level
pub fn zlib_stream(
    rt: &EventLoop,
    mode: ZlibMode,
    level: Compression,
    options: StreamOptions,
) -> Transform<Vec<u8>, Vec<u8>> {
    let chunk_size = match options.readable_side() {
        (false, hwm) if hwm > 0 => hwm.min(CHUNK_SIZE),
        _ => CHUNK_SIZE,
    };
    Transform::new(
        rt,
        options.transport(TRANSPORT),
        ZlibTransformer {
            mode,
            codec: Codec::new(mode, level),
            chunk_size,
            backlog: VecDeque::new(),
            parked: None,
            bytes_in: 0,
            bytes_out: 0,
        },
    )
}

fn with_defaults(rt: &EventLoop, mode: ZlibMode) -> Transform<Vec<u8>, Vec<u8>> {
    zlib_stream(rt, mode, Compression::new(DEFAULT_LEVEL), StreamOptions::default())
}

pub fn gzip(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::Gzip)
}

pub fn gunzip(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::Gunzip)
}

pub fn deflate(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::Deflate)
}

pub fn inflate(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::Inflate)
}

pub fn deflate_raw(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::DeflateRaw)
}

pub fn inflate_raw(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::InflateRaw)
}

pub fn unzip(rt: &EventLoop) -> Transform<Vec<u8>, Vec<u8>> {
    with_defaults(rt, ZlibMode::Unzip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::Pipeline;
    use crate::stream::{ReadableStream, Stream, WritableStream};
    use crate::transport::memory;
    use flate2::read::GzDecoder as GzReader;
    use std::{cell::RefCell, io::Read, rc::Rc};

    fn text() -> Vec<u8> {
        "the quick brown fox jumps over the lazy dog\n"
            .repeat(200)
            .into_bytes()
    }

    /// Run `input` split into small chunks through the given stages
    fn run(rt: &EventLoop, stages: Vec<Transform<Vec<u8>, Vec<u8>>>, input: Vec<u8>) -> Result<Vec<u8>, StreamError> {
        let chunks: Vec<Vec<u8>> = input.chunks(97).map(<[u8]>::to_vec).collect();
        let src = memory::from_iter(rt, StreamOptions::default(), chunks);
        let (sink, collected) = memory::collect(rt, StreamOptions::default());

        let mut stages = stages.into_iter();
        let first = stages.next().expect("at least one stage");
        let mut pipeline = Pipeline::new(src).pipe(first);
        for stage in stages {
            pipeline = pipeline.pipe(stage);
        }
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        pipeline.finish(sink, move |res| *r.borrow_mut() = Some(res));
        rt.run().unwrap();

        let outcome = result.borrow_mut().take().unwrap();
        outcome.map(|()| collected.concat())
    }

    #[test]
    fn test_gzip_output_is_standard() {
        let rt = EventLoop::new();
        let compressed = run(&rt, vec![gzip(&rt)], text()).unwrap();
        assert_eq!(compressed[..2], GZIP_MAGIC);
        assert!(compressed.len() < text().len());

        let mut plain = Vec::new();
        GzReader::new(&compressed[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(plain, text());
    }

    #[test]
    fn test_chained_codecs() {
        let rt = EventLoop::new();
        let out = run(&rt, vec![gzip(&rt), gunzip(&rt)], text()).unwrap();
        assert_eq!(out, text());

        let rt = EventLoop::new();
        let out = run(&rt, vec![deflate(&rt), inflate(&rt)], text()).unwrap();
        assert_eq!(out, text());

        let rt = EventLoop::new();
        let out = run(&rt, vec![deflate_raw(&rt), inflate_raw(&rt)], text()).unwrap();
        assert_eq!(out, text());
    }

    #[test]
    fn test_unzip_detects_format() {
        let rt = EventLoop::new();
        let out = run(&rt, vec![gzip(&rt), unzip(&rt)], text()).unwrap();
        assert_eq!(out, text());

        let rt = EventLoop::new();
        let out = run(&rt, vec![deflate(&rt), unzip(&rt)], text()).unwrap();
        assert_eq!(out, text());
    }

    #[test]
    fn test_corrupt_input_fails_pipeline() {
        let rt = EventLoop::new();
        let err = run(&rt, vec![gunzip(&rt)], b"definitely not gzip data".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pipeline);
        assert_eq!(err.root().kind(), ErrorKind::Production);
        assert!(err.to_string().contains("gunzip error"));
    }

    #[test]
    fn test_output_respects_high_water_mark() {
        let hwm = 16 * 1024;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&vec![0u8; 8 << 20]).unwrap();
        let packed = encoder.finish().unwrap();

        let rt = EventLoop::new();
        let stream = zlib_stream(
            &rt,
            ZlibMode::Gunzip,
            Compression::default(),
            StreamOptions::new().high_water_mark(hwm),
        );
        stream.pause();
        assert!(stream.write(packed.clone()).unwrap());
        rt.run().unwrap();
        // One piece is buffered, the rest waits with the write unfinished
        assert_eq!(stream.readable_length(), hwm);
        assert_eq!(stream.writable_length(), packed.len());

        let sizes = Rc::new(RefCell::new(Vec::new()));
        let s = sizes.clone();
        stream.on_data(move |chunk| s.borrow_mut().push(chunk.len()));
        stream.resume();
        stream.end().unwrap();
        rt.run().unwrap();

        assert_eq!(sizes.borrow().iter().sum::<usize>(), 8 << 20);
        assert!(sizes.borrow().iter().all(|n| *n <= hwm));
        assert!(stream.is_readable_ended());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(compression_level(-1).level(), DEFAULT_LEVEL);
        assert_eq!(compression_level(12).level(), 9);
        assert_eq!(compression_level(0).level(), 0);
    }

    #[test]
    fn test_transport_tag() {
        let rt = EventLoop::new();
        let stream = gzip(&rt);
        assert_eq!(stream.capabilities().transport, Some("zlib"));
        stream.end().unwrap();
        rt.run().unwrap();
    }
}
