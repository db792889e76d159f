//! In-memory endpoints

use crate::config::StreamOptions;
use crate::error::BoxError;
use crate::runtime::EventLoop;
use crate::stream::{Chunk, Completion, Payload, Readable, ReadableController, Sink, Source, Writable};
use std::{cell::RefCell, rc::Rc};

const TRANSPORT: &str = "memory";

struct IterSource<I> {
    iter: I,
}

impl<R, I> Source<R> for IterSource<I>
where
    R: Payload,
    I: Iterator<Item = R> + 'static,
{
    fn read(&mut self, ctl: &ReadableController<R>, _size_hint: usize) -> Result<(), BoxError> {
        loop {
            match self.iter.next() {
                Some(chunk) => {
                    if !ctl.push(chunk) {
                        return Ok(());
                    }
                }
                None => {
                    ctl.end();
                    return Ok(());
                }
            }
        }
    }
}

/// Readable producing the items of `iter`, then ending
pub fn from_iter<R, I>(rt: &EventLoop, options: StreamOptions, iter: I) -> Readable<R>
where
    R: Payload,
    I: IntoIterator<Item = R>,
    I::IntoIter: 'static,
{
    Readable::new(
        rt,
        options.transport(TRANSPORT),
        IterSource {
            iter: iter.into_iter(),
        },
    )
}

/// Chunks received by a [`collect`] sink
pub struct Collected<W> {
    chunks: Rc<RefCell<Vec<W>>>,
}

impl<W> Clone for Collected<W> {
    fn clone(&self) -> Self {
        Self {
            chunks: self.chunks.clone(),
        }
    }
}

impl<W: Clone> Collected<W> {
    pub fn to_vec(&self) -> Vec<W> {
        self.chunks.borrow().clone()
    }
}

impl<W> Collected<W> {
    pub fn len(&self) -> usize {
        self.chunks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.borrow().is_empty()
    }

    /// Move the received chunks out
    pub fn take(&self) -> Vec<W> {
        std::mem::take(&mut *self.chunks.borrow_mut())
    }
}

impl Collected<Vec<u8>> {
    /// All received bytes, concatenated
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.borrow().concat()
    }
}

impl Collected<String> {
    pub fn concat(&self) -> String {
        self.chunks.borrow().concat()
    }
}

struct CollectSink<W> {
    chunks: Rc<RefCell<Vec<W>>>,
}

impl<W: Payload> Sink<W> for CollectSink<W> {
    fn write(&mut self, chunk: Chunk<W>, done: Completion) {
        self.chunks.borrow_mut().push(chunk.payload);
        done.complete();
    }

    fn has_writev(&self) -> bool {
        true
    }

    fn writev(&mut self, chunks: Vec<Chunk<W>>, done: Completion) {
        self.chunks
            .borrow_mut()
            .extend(chunks.into_iter().map(|c| c.payload));
        done.complete();
    }
}

/// Writable storing every chunk it receives
pub fn collect<W: Payload>(rt: &EventLoop, options: StreamOptions) -> (Writable<W>, Collected<W>) {
    let chunks = Rc::new(RefCell::new(Vec::new()));
    let sink = CollectSink {
        chunks: chunks.clone(),
    };
    (
        Writable::new(rt, options.transport(TRANSPORT), sink),
        Collected { chunks },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ReadableStream, Stream, WritableStream};
    use std::cell::Cell;

    #[test]
    fn test_iter_to_collect() {
        let rt = EventLoop::new();
        let source = from_iter(&rt, StreamOptions::objects().high_water_mark(2), 1..=10u32);
        let (sink, collected) = collect(&rt, StreamOptions::objects().high_water_mark(1));
        let finished = Rc::new(Cell::new(false));
        let f = finished.clone();
        sink.on_finish(move || f.set(true));

        source.pipe(&sink);
        rt.run().unwrap();

        assert!(finished.get());
        assert_eq!(collected.to_vec(), (1..=10).collect::<Vec<_>>());
        assert_eq!(source.capabilities().transport, Some("memory"));
        assert_eq!(sink.capabilities().transport, Some("memory"));
    }

    #[test]
    fn test_empty_iter_ends() {
        let rt = EventLoop::new();
        let source = from_iter(&rt, StreamOptions::objects(), Vec::<u8>::new());
        let ended = Rc::new(Cell::new(false));
        let e = ended.clone();
        source.on_end(move || e.set(true));
        source.resume();
        rt.run().unwrap();
        assert!(ended.get());
    }

    #[test]
    fn test_collect_bytes() {
        let rt = EventLoop::new();
        let (sink, collected) = collect::<Vec<u8>>(&rt, StreamOptions::default());
        sink.cork();
        sink.write(b"ab".to_vec()).unwrap();
        sink.write(b"cd".to_vec()).unwrap();
        sink.uncork();
        sink.end_with(b"e".to_vec()).unwrap();
        rt.run().unwrap();
        assert_eq!(collected.concat(), b"abcde");
        assert_eq!(collected.take().len(), 3);
        assert!(collected.is_empty());
    }
}
