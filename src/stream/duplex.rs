//! Duplex: a readable and a writable side under one stream identity

use super::{
    Payload, ReadableHalf, ReadableStream, Sink, Source, Stream, StreamCore, StreamKind,
    WritableHalf, WritableStream,
};
use crate::config::StreamOptions;
use crate::runtime::{EventLoop, ListenerId};
use std::rc::Rc;

/// Stream that is both readable (`R`) and writable (`W`).
///
/// The two sides buffer and complete independently; destroying the stream
/// tears both down. Without `allow_half_open`, completing one side ends the
/// other.
pub struct Duplex<W: Payload, R: Payload> {
    core: Rc<StreamCore>,
    readable: Rc<ReadableHalf<R>>,
    writable: Rc<WritableHalf<W>>,
}

impl<W: Payload, R: Payload> Clone for Duplex<W, R> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<W: Payload, R: Payload> Duplex<W, R> {
    pub fn new(
        rt: &EventLoop,
        options: StreamOptions,
        source: impl Source<R>,
        sink: impl Sink<W>,
    ) -> Self {
        Self::with_kind(
            rt,
            StreamKind::Duplex,
            options,
            Box::new(source),
            Box::new(sink),
        )
    }

    pub(crate) fn with_kind(
        rt: &EventLoop,
        kind: StreamKind,
        options: StreamOptions,
        source: Box<dyn Source<R>>,
        sink: Box<dyn Sink<W>>,
    ) -> Self {
        let core = StreamCore::new(
            rt,
            kind,
            options.transport,
            options.auto_destroy,
            options.emit_close,
        );
        let readable = ReadableHalf::new(&core, &options, source);
        let writable = WritableHalf::new(&core, &options, sink);

        if !options.allow_half_open {
            let weak = Rc::downgrade(&writable);
            let rt = rt.clone();
            core.on_end.once(move |_| {
                let weak = weak.clone();
                rt.next_tick(move || {
                    if let Some(writable) = weak.upgrade() {
                        if !writable.is_ending() {
                            // Ending a destroyed stream is a no-op here
                            let _ = writable.end(None);
                        }
                    }
                });
            });

            let weak = Rc::downgrade(&readable);
            core.on_finish.once(move |_| {
                if let Some(readable) = weak.upgrade() {
                    readable.push(None);
                }
            });
        }

        Self {
            core,
            readable,
            writable,
        }
    }
}

impl<W: Payload, R: Payload> Stream for Duplex<W, R> {
    fn core(&self) -> &Rc<StreamCore> {
        &self.core
    }

    fn off(&self, id: ListenerId) -> bool {
        self.core.off(id) || self.readable.off(id) || self.writable.off(id)
    }
}

impl<W: Payload, R: Payload> ReadableStream for Duplex<W, R> {
    type Output = R;

    fn readable_half(&self) -> &Rc<ReadableHalf<R>> {
        &self.readable
    }
}

impl<W: Payload, R: Payload> WritableStream for Duplex<W, R> {
    type Input = W;

    fn writable_half(&self) -> &Rc<WritableHalf<W>> {
        &self.writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::stream::{Chunk, Completion, ReadableController};
    use std::cell::{Cell, RefCell};

    /// Echo server: every written line is answered on the readable side
    struct Echo {
        out: Rc<RefCell<Option<ReadableController<String>>>>,
    }

    impl Sink<String> for Echo {
        fn write(&mut self, chunk: Chunk<String>, done: Completion) {
            if let Some(out) = self.out.borrow().as_ref() {
                out.push(format!("echo: {}", chunk.payload));
            }
            done.complete();
        }
    }

    struct Idle;

    impl Source<String> for Idle {
        fn read(&mut self, _ctl: &ReadableController<String>, _size: usize) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn echo(rt: &EventLoop, options: StreamOptions) -> Duplex<String, String> {
        let out = Rc::new(RefCell::new(None));
        let duplex = Duplex::new(rt, options, Idle, Echo { out: out.clone() });
        *out.borrow_mut() = Some(duplex.readable_half().controller());
        duplex
    }

    #[test]
    fn test_sides_are_independent() {
        let rt = EventLoop::new();
        let duplex = echo(&rt, StreamOptions::objects());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        duplex.on_data(move |line| s.borrow_mut().push(line.clone()));
        let finished = Rc::new(Cell::new(false));
        let f = finished.clone();
        duplex.on_finish(move || f.set(true));

        duplex.write("hi".to_string()).unwrap();
        duplex.end().unwrap();
        rt.run().unwrap();

        assert_eq!(*seen.borrow(), vec!["echo: hi"]);
        assert!(finished.get());
        // Readable side is still open: no auto-destroy yet
        assert!(!duplex.is_readable_ended());
        assert!(!duplex.is_destroyed());
        assert_eq!(duplex.capabilities().kind, StreamKind::Duplex);
    }

    #[test]
    fn test_no_half_open_ends_readable_after_finish() {
        let rt = EventLoop::new();
        let duplex = echo(&rt, StreamOptions::objects().allow_half_open(false));
        let ended = Rc::new(Cell::new(false));
        let e = ended.clone();
        duplex.on_end(move || e.set(true));
        duplex.resume();

        duplex.end().unwrap();
        rt.run().unwrap();
        assert!(ended.get());
        assert!(duplex.is_destroyed());
    }

    #[test]
    fn test_no_half_open_ends_writable_after_end() {
        let rt = EventLoop::new();
        let duplex = echo(&rt, StreamOptions::objects().allow_half_open(false));
        let finished = Rc::new(Cell::new(false));
        let f = finished.clone();
        duplex.on_finish(move || f.set(true));
        duplex.resume();

        duplex.readable_half().controller().end();
        rt.run().unwrap();
        assert!(duplex.is_writable_ended());
        assert!(finished.get());
        assert!(duplex.is_closed());
    }

    #[test]
    fn test_destroy_tears_down_both_sides() {
        let rt = EventLoop::new();
        let duplex = echo(&rt, StreamOptions::objects());
        duplex.pause();
        duplex.write("queued".to_string()).unwrap();
        assert_eq!(duplex.readable_length(), 1);

        duplex.destroy();
        assert_eq!(duplex.readable_length(), 0);
        assert!(duplex.write("late".to_string()).is_err());
        rt.run().unwrap();
        assert!(duplex.is_closed());
    }
}
