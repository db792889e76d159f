//! File and standard I/O streams
//!
//! Reads and writes are blocking calls on the event loop thread, issued one
//! chunk at a time so backpressure still bounds memory use.

use crate::config::StreamOptions;
use crate::error::{BoxError, StreamError};
use crate::runtime::EventLoop;
use crate::stream::{Chunk, Completion, Readable, ReadableController, Sink, Source, Writable};
use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::Path,
};

const FILE: &str = "file";
const STDIO: &str = "stdio";

/// How [`create_write_stream`] opens an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
    /// Fail if the file already exists
    CreateNew,
}

struct ReaderSource<T> {
    reader: Option<T>,
    label: String,
    bytes_read: u64,
}

impl<T: Read + 'static> Source<Vec<u8>> for ReaderSource<T> {
    fn read(&mut self, ctl: &ReadableController<Vec<u8>>, size_hint: usize) -> Result<(), BoxError> {
        let Some(reader) = self.reader.as_mut() else {
            ctl.end();
            return Ok(());
        };

        let mut buf = vec![0; size_hint.max(1)];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if n == 0 {
            tracing::debug!(source = %self.label, bytes = self.bytes_read, "end of input");
            self.reader = None;
            ctl.end();
        } else {
            buf.truncate(n);
            self.bytes_read += n as u64;
            tracing::trace!(source = %self.label, bytes = n, "read");
            ctl.push(buf);
        }
        Ok(())
    }

    fn destroy(&mut self, err: Option<&StreamError>) -> Result<(), BoxError> {
        if self.reader.take().is_some() {
            tracing::debug!(source = %self.label, error = ?err.map(|e| e.to_string()), "closed early");
        }
        Ok(())
    }
}

struct WriterSink<T: Write> {
    writer: Option<BufWriter<T>>,
    label: String,
    bytes_written: u64,
}

impl<T: Write> WriterSink<T> {
    fn writer(&mut self) -> io::Result<&mut BufWriter<T>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer already closed"))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

impl<T: Write + 'static> Sink<Vec<u8>> for WriterSink<T> {
    fn write(&mut self, chunk: Chunk<Vec<u8>>, done: Completion) {
        done.done(self.write_bytes(&chunk.payload).map_err(Into::into));
    }

    fn has_writev(&self) -> bool {
        true
    }

    fn writev(&mut self, chunks: Vec<Chunk<Vec<u8>>>, done: Completion) {
        let result = chunks
            .iter()
            .try_for_each(|chunk| self.write_bytes(&chunk.payload));
        done.done(result.map_err(Into::into));
    }

    fn finish(&mut self, done: Completion) {
        let result = self.writer().and_then(|w| w.flush());
        tracing::debug!(sink = %self.label, bytes = self.bytes_written, "finished");
        done.done(result.map_err(Into::into));
    }

    fn destroy(&mut self, _err: Option<&StreamError>) -> Result<(), BoxError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Byte readable over any [`Read`] implementation
pub fn from_reader<T: Read + 'static>(rt: &EventLoop, options: StreamOptions, reader: T) -> Readable<Vec<u8>> {
    let label = options.transport.unwrap_or("reader").to_string();
    reader_stream(rt, options, reader, label)
}

/// Byte writable over any [`Write`] implementation
pub fn to_writer<T: Write + 'static>(rt: &EventLoop, options: StreamOptions, writer: T) -> Writable<Vec<u8>> {
    let label = options.transport.unwrap_or("writer").to_string();
    writer_stream(rt, options, writer, label)
}

fn reader_stream<T: Read + 'static>(
    rt: &EventLoop,
    options: StreamOptions,
    reader: T,
    label: String,
) -> Readable<Vec<u8>> {
    Readable::new(
        rt,
        options,
        ReaderSource {
            reader: Some(reader),
            label,
            bytes_read: 0,
        },
    )
}

fn writer_stream<T: Write + 'static>(
    rt: &EventLoop,
    options: StreamOptions,
    writer: T,
    label: String,
) -> Writable<Vec<u8>> {
    Writable::new(
        rt,
        options,
        WriterSink {
            writer: Some(BufWriter::new(writer)),
            label,
            bytes_written: 0,
        },
    )
}

/// Readable over the contents of the file at `path`
pub fn create_read_stream(
    rt: &EventLoop,
    path: impl AsRef<Path>,
    options: StreamOptions,
) -> io::Result<Readable<Vec<u8>>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    tracing::debug!(path = %path.display(), "opened for reading");
    Ok(reader_stream(
        rt,
        options.transport(FILE),
        file,
        path.display().to_string(),
    ))
}

/// Writable into the file at `path`, created if missing
pub fn create_write_stream(
    rt: &EventLoop,
    path: impl AsRef<Path>,
    mode: WriteMode,
    options: StreamOptions,
) -> io::Result<Writable<Vec<u8>>> {
    let path = path.as_ref();
    let mut open = OpenOptions::new();
    match mode {
        WriteMode::Truncate => open.write(true).create(true).truncate(true),
        WriteMode::Append => open.append(true).create(true),
        WriteMode::CreateNew => open.write(true).create_new(true),
    };
    let file = open.open(path)?;
    tracing::debug!(path = %path.display(), ?mode, "opened for writing");
    Ok(writer_stream(
        rt,
        options.transport(FILE),
        file,
        path.display().to_string(),
    ))
}

/// Readable over the process's standard input
pub fn stdin(rt: &EventLoop, options: StreamOptions) -> Readable<Vec<u8>> {
    reader_stream(rt, options.transport(STDIO), io::stdin(), "stdin".to_string())
}

/// Writable into the process's standard output
pub fn stdout(rt: &EventLoop, options: StreamOptions) -> Writable<Vec<u8>> {
    writer_stream(rt, options.transport(STDIO), io::stdout(), "stdout".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::stream::{ReadableStream, Stream, WritableStream};
    use crate::transport::memory;
    use std::{cell::RefCell, rc::Rc};
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn test_copy_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        let content: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        std::fs::write(&input, &content).unwrap();

        let rt = EventLoop::new();
        let src = create_read_stream(&rt, &input, StreamOptions::new().high_water_mark(1024)).unwrap();
        let dest = create_write_stream(
            &rt,
            &output,
            WriteMode::Truncate,
            StreamOptions::new().high_water_mark(512),
        )
        .unwrap();
        assert_eq!(src.capabilities().transport, Some("file"));

        src.pipe(&dest);
        rt.run().unwrap();

        assert!(dest.is_writable_finished());
        assert_eq!(std::fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_read_chunks_respect_high_water_mark() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 100]).unwrap();

        let rt = EventLoop::new();
        let src = create_read_stream(&rt, file.path(), StreamOptions::new().high_water_mark(32)).unwrap();
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let s = sizes.clone();
        src.on_data(move |chunk| s.borrow_mut().push(chunk.len()));
        rt.run().unwrap();

        assert_eq!(sizes.borrow().iter().sum::<usize>(), 100);
        assert!(sizes.borrow().iter().all(|n| *n <= 32));
        assert!(src.is_readable_ended());
    }

    #[test]
    fn test_append_mode() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"head,").unwrap();

        let rt = EventLoop::new();
        let dest = create_write_stream(&rt, file.path(), WriteMode::Append, StreamOptions::new()).unwrap();
        dest.write(b"tail".to_vec()).unwrap();
        dest.end().unwrap();
        rt.run().unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"head,tail");
    }

    #[test]
    fn test_create_new_refuses_existing_file() {
        let file = NamedTempFile::new().unwrap();
        let rt = EventLoop::new();
        let result = create_write_stream(&rt, file.path(), WriteMode::CreateNew, StreamOptions::new());
        assert_eq!(result.err().map(|e| e.kind()), Some(io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let rt = EventLoop::new();
        assert!(create_read_stream(&rt, dir.path().join("nope"), StreamOptions::new()).is_err());
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device gone"))
        }
    }

    #[test]
    fn test_read_failure_is_io_error() {
        let rt = EventLoop::new();
        let src = from_reader(&rt, StreamOptions::new(), FailingReader);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        src.on_error(move |err| e.borrow_mut().push(err.kind()));
        src.resume();
        rt.run().unwrap();
        assert_eq!(*errors.borrow(), vec![ErrorKind::Io]);
        assert!(src.is_destroyed());
    }

    #[test]
    fn test_memory_to_writer() {
        let rt = EventLoop::new();
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines");
        let file = File::create(&path).unwrap();
        let src = memory::from_iter(&rt, StreamOptions::new(), ["a\n", "b\n"].map(|s| s.as_bytes().to_vec()));
        let dest = to_writer(&rt, StreamOptions::new(), file);
        src.pipe(&dest);
        rt.run().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
