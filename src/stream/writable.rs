//! Writable side: write queue, corking, backpressure and finalization
//!
//! Chunks are handed to the [`Sink`] one at a time (or batched through
//! `writev`). The next write is issued only after the sink settled the
//! [`Completion`] of the previous one.

use super::{Chunk, Payload, Side, Stream, StreamCore, StreamId, StreamKind};
use crate::config::StreamOptions;
use crate::encoding::Encoding;
use crate::error::{BoxError, ProtocolViolation, StreamError, StreamResult};
use crate::runtime::{Emitter, EventLoop, ListenerId};
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

type Settle = Box<dyn FnOnce(Result<(), StreamError>)>;

/// One-shot continuation handed to a sink or transformer.
///
/// Settling consumes the handle, so a write can only complete once. Settling
/// after the stream was destroyed has no effect.
pub struct Completion {
    settle: Option<Settle>,
    wrap: fn(BoxError) -> StreamError,
}

impl Completion {
    pub(crate) fn new(
        wrap: fn(BoxError) -> StreamError,
        settle: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Self {
        Self {
            settle: Some(Box::new(settle)),
            wrap,
        }
    }

    /// The operation succeeded
    pub fn complete(self) {
        self.settle(Ok(()));
    }

    /// The operation failed; the stream is destroyed with `err`
    pub fn fail(self, err: impl Into<BoxError>) {
        let err = (self.wrap)(err.into());
        self.settle(Err(err));
    }

    pub fn done(self, result: Result<(), BoxError>) {
        match result {
            Ok(()) => self.complete(),
            Err(e) => self.fail(e),
        }
    }

    pub(crate) fn settle(mut self, result: Result<(), StreamError>) {
        if let Some(settle) = self.settle.take() {
            settle(result);
        }
    }

    /// Drop without settling, for continuations orphaned by a destroy
    pub(crate) fn discard(mut self) {
        self.settle = None;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.settle.is_some() {
            tracing::warn!("write completion dropped without being settled; the stream will stall");
        }
    }
}

/// Consumption function of a writable stream
pub trait Sink<W: Payload>: 'static {
    /// Consume one chunk and settle `done` once it was handled
    fn write(&mut self, chunk: Chunk<W>, done: Completion);

    /// Whether [`Sink::writev`] is implemented
    fn has_writev(&self) -> bool {
        false
    }

    /// Consume several buffered chunks at once
    fn writev(&mut self, chunks: Vec<Chunk<W>>, done: Completion) {
        drop(chunks);
        done.fail("writev is not implemented by this sink");
    }

    /// Finalization step, run once after the last write completed
    fn finish(&mut self, done: Completion) {
        done.complete();
    }

    /// Release resources; called once when the stream is destroyed
    fn destroy(&mut self, _err: Option<&StreamError>) -> Result<(), BoxError> {
        Ok(())
    }
}

struct FnSink<F>(F);

impl<W, F> Sink<W> for FnSink<F>
where
    W: Payload,
    F: FnMut(Chunk<W>, Completion) + 'static,
{
    fn write(&mut self, chunk: Chunk<W>, done: Completion) {
        (self.0)(chunk, done)
    }
}

struct WritableState<W> {
    buffer: VecDeque<Chunk<W>>,
    /// Buffered size, including the write in flight
    length: usize,
    high_water_mark: usize,
    object_mode: bool,
    default_encoding: Encoding,
    corked: usize,
    writing: bool,
    /// Size of the write in flight
    write_len: usize,
    pumping: bool,
    ending: bool,
    final_called: bool,
    finished: bool,
    need_drain: bool,
    drain_scheduled: bool,
}

impl<W: Payload> WritableState<W> {
    fn measure(&self, chunk: &W) -> usize {
        if self.object_mode { 1 } else { chunk.size() }
    }
}

enum Batch<W> {
    One(Chunk<W>),
    Many(Vec<Chunk<W>>),
}

/// Writable state machine, shared by [`Writable`], [`super::Duplex`] and
/// [`super::Transform`].
#[doc(hidden)]
pub struct WritableHalf<W: Payload> {
    core: Rc<StreamCore>,
    state: RefCell<WritableState<W>>,
    sink: RefCell<Box<dyn Sink<W>>>,
    drain: Emitter<()>,
    pub(crate) pipe: Emitter<StreamId>,
    pub(crate) unpipe: Emitter<StreamId>,
}

impl<W: Payload> WritableHalf<W> {
    pub(crate) fn new(
        core: &Rc<StreamCore>,
        options: &StreamOptions,
        sink: Box<dyn Sink<W>>,
    ) -> Rc<Self> {
        let (object_mode, high_water_mark) = options.writable_side();
        let half = Rc::new(Self {
            core: core.clone(),
            state: RefCell::new(WritableState {
                buffer: VecDeque::new(),
                length: 0,
                high_water_mark,
                object_mode,
                default_encoding: options.default_encoding,
                corked: 0,
                writing: false,
                write_len: 0,
                pumping: false,
                ending: false,
                final_called: false,
                finished: false,
                need_drain: false,
                drain_scheduled: false,
            }),
            sink: RefCell::new(sink),
            drain: Emitter::new(),
            pipe: Emitter::new(),
            unpipe: Emitter::new(),
        });

        let weak = Rc::downgrade(&half);
        core.on_teardown(move |err| weak.upgrade().and_then(|half| half.teardown(err)));
        half
    }

    fn rt(&self) -> &EventLoop {
        self.core.event_loop()
    }

    fn teardown(self: &Rc<Self>, err: Option<&StreamError>) -> Option<StreamError> {
        {
            let mut st = self.state.borrow_mut();
            st.buffer.clear();
            st.length = 0;
            st.need_drain = false;
        }

        let result = match self.sink.try_borrow_mut() {
            Ok(mut sink) => sink.destroy(err),
            Err(_) => {
                let this = self.clone();
                let err = err.cloned();
                self.rt().next_tick(move || {
                    if let Err(e) = this.sink.borrow_mut().destroy(err.as_ref()) {
                        tracing::warn!(stream = %this.core.id(), "sink destroy failed: {}", e);
                    }
                });
                Ok(())
            }
        };
        result.err().map(StreamError::consumption)
    }

    pub(crate) fn length(&self) -> usize {
        self.state.borrow().length
    }

    pub(crate) fn high_water_mark(&self) -> usize {
        self.state.borrow().high_water_mark
    }

    pub(crate) fn need_drain(&self) -> bool {
        self.state.borrow().need_drain
    }

    pub(crate) fn is_ending(&self) -> bool {
        self.state.borrow().ending
    }

    pub(crate) fn write(
        self: &Rc<Self>,
        payload: W,
        encoding: Option<Encoding>,
    ) -> StreamResult<bool> {
        if self.core.is_destroyed() {
            return Err(ProtocolViolation::Destroyed("write").into());
        }

        let ok = {
            let mut st = self.state.borrow_mut();
            if st.ending {
                return Err(ProtocolViolation::WriteAfterEnd.into());
            }
            let encoding = if st.object_mode {
                encoding
            } else {
                encoding.or(Some(st.default_encoding))
            };
            st.length += st.measure(&payload);
            st.buffer.push_back(Chunk { payload, encoding });

            let ok = st.length <= st.high_water_mark;
            if !ok {
                st.need_drain = true;
            }
            ok
        };

        self.pump();
        Ok(ok)
    }

    /// Hand queued chunks to the sink while nothing is in flight
    fn pump(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            if st.pumping {
                return;
            }
            st.pumping = true;
        }

        loop {
            if self.core.is_destroyed() {
                break;
            }
            let Ok(mut sink) = self.sink.try_borrow_mut() else {
                // Re-entered from inside the sink
                let this = self.clone();
                self.rt().next_tick(move || this.pump());
                break;
            };

            let batch = {
                let mut st = self.state.borrow_mut();
                if st.writing || st.corked > 0 || st.buffer.is_empty() {
                    None
                } else if st.buffer.len() > 1 && sink.has_writev() {
                    let chunks: Vec<Chunk<W>> = st.buffer.drain(..).collect();
                    let len: usize = chunks.iter().map(|c| st.measure(&c.payload)).sum();
                    st.writing = true;
                    st.write_len = len;
                    Some(Batch::Many(chunks))
                } else {
                    st.buffer.pop_front().map(|chunk| {
                        st.writing = true;
                        st.write_len = st.measure(&chunk.payload);
                        Batch::One(chunk)
                    })
                }
            };
            let Some(batch) = batch else {
                break;
            };

            let done = self.write_completion();
            match batch {
                Batch::One(chunk) => sink.write(chunk, done),
                Batch::Many(chunks) => {
                    tracing::trace!(stream = %self.core.id(), chunks = chunks.len(), "writev");
                    sink.writev(chunks, done)
                }
            }
        }

        self.state.borrow_mut().pumping = false;
        self.maybe_finish();
    }

    /// The pending completion owns the half, so an in-flight write keeps the
    /// stream alive after every handle was dropped
    fn write_completion(self: &Rc<Self>) -> Completion {
        let half = self.clone();
        Completion::new(|e: BoxError| StreamError::consumption(e), move |result| {
            half.on_write_complete(result)
        })
    }

    fn on_write_complete(self: &Rc<Self>, result: Result<(), StreamError>) {
        if self.core.is_destroyed() {
            return;
        }
        if let Err(err) = result {
            self.state.borrow_mut().writing = false;
            self.core.destroy(Some(err));
            return;
        }

        let (drain, pump) = {
            let mut st = self.state.borrow_mut();
            st.writing = false;
            st.length -= st.write_len;
            st.write_len = 0;
            let drain = st.need_drain
                && !st.drain_scheduled
                && !st.ending
                && st.length <= st.high_water_mark;
            if drain {
                st.drain_scheduled = true;
            }
            (drain, !st.pumping)
        };

        if drain {
            let this = self.clone();
            self.rt().next_tick(move || this.emit_drain());
        }
        // A synchronous completion is picked up by the running pump loop
        if pump {
            self.pump();
        }
    }

    fn emit_drain(&self) {
        {
            let mut st = self.state.borrow_mut();
            st.drain_scheduled = false;
            if !st.need_drain || self.core.is_destroyed() {
                return;
            }
            st.need_drain = false;
        }
        self.drain.emit(&());
    }

    fn maybe_finish(self: &Rc<Self>) {
        let ready = {
            let mut st = self.state.borrow_mut();
            let ready = st.ending
                && !st.writing
                && st.buffer.is_empty()
                && !st.final_called
                && !st.finished
                && !self.core.is_destroyed();
            if ready {
                st.final_called = true;
            }
            ready
        };
        if ready {
            let this = self.clone();
            self.rt().next_tick(move || this.call_final());
        }
    }

    fn call_final(self: &Rc<Self>) {
        if self.core.is_destroyed() {
            return;
        }
        let Ok(mut sink) = self.sink.try_borrow_mut() else {
            let this = self.clone();
            self.rt().next_tick(move || this.call_final());
            return;
        };

        let half = self.clone();
        let done = Completion::new(|e: BoxError| StreamError::production(e), move |result| {
            half.on_final_complete(result)
        });
        sink.finish(done);
    }

    fn on_final_complete(self: &Rc<Self>, result: Result<(), StreamError>) {
        if self.core.is_destroyed() {
            return;
        }
        match result {
            Err(err) => self.core.destroy(Some(err)),
            Ok(()) => {
                let this = self.clone();
                self.rt().next_tick(move || this.finish_now());
            }
        }
    }

    fn finish_now(self: &Rc<Self>) {
        if self.core.is_destroyed() {
            return;
        }
        {
            let mut st = self.state.borrow_mut();
            if st.finished {
                return;
            }
            st.finished = true;
        }
        self.core.writable_finished();
    }

    pub(crate) fn end(self: &Rc<Self>, chunk: Option<W>) -> StreamResult<()> {
        if self.core.is_destroyed() {
            return Err(ProtocolViolation::Destroyed("end").into());
        }
        if self.is_ending() {
            return match chunk {
                Some(_) => Err(ProtocolViolation::WriteAfterEnd.into()),
                None => Ok(()),
            };
        }
        if let Some(chunk) = chunk {
            self.write(chunk, None)?;
        }

        {
            let mut st = self.state.borrow_mut();
            st.corked = 0;
            st.ending = true;
        }
        tracing::trace!(stream = %self.core.id(), "writable ending");
        self.pump();
        Ok(())
    }

    pub(crate) fn cork(&self) {
        self.state.borrow_mut().corked += 1;
    }

    pub(crate) fn uncork(self: &Rc<Self>) {
        let flush = {
            let mut st = self.state.borrow_mut();
            st.corked = st.corked.saturating_sub(1);
            st.corked == 0
        };
        if flush {
            self.pump();
        }
    }

    pub(crate) fn on_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.drain.on(move |_| listener())
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        self.drain.off(id) || self.pipe.off(id) || self.unpipe.off(id)
    }
}

/// Writable capability: write queue, corking, end and finish
pub trait WritableStream: Stream {
    type Input: Payload;

    #[doc(hidden)]
    fn writable_half(&self) -> &Rc<WritableHalf<Self::Input>>;

    /// Queue a chunk. `Ok(false)` asks the caller to wait for `drain`.
    fn write(&self, chunk: Self::Input) -> StreamResult<bool> {
        self.writable_half().write(chunk, None)
    }

    fn write_with_encoding(&self, chunk: Self::Input, encoding: Encoding) -> StreamResult<bool> {
        self.writable_half().write(chunk, Some(encoding))
    }

    /// Encode `text` into bytes and queue them
    fn write_str(&self, text: &str, encoding: Encoding) -> StreamResult<bool>
    where
        Self::Input: From<Vec<u8>>,
    {
        let bytes = encoding.encode(text)?;
        self.writable_half()
            .write(Self::Input::from(bytes), Some(encoding))
    }

    /// No more writes: flush the queue, finalize, then emit `finish`
    fn end(&self) -> StreamResult<()> {
        self.writable_half().end(None)
    }

    /// Write one last chunk, then [`WritableStream::end`]
    fn end_with(&self, chunk: Self::Input) -> StreamResult<()> {
        self.writable_half().end(Some(chunk))
    }

    /// Hold writes in the buffer until the matching `uncork`
    fn cork(&self) {
        self.writable_half().cork();
    }

    fn uncork(&self) {
        self.writable_half().uncork();
    }

    fn writable_length(&self) -> usize {
        self.writable_half().length()
    }

    fn writable_high_water_mark(&self) -> usize {
        self.writable_half().high_water_mark()
    }

    fn writable_corked(&self) -> usize {
        self.writable_half().state.borrow().corked
    }

    /// Whether `end` was called
    fn is_writable_ended(&self) -> bool {
        self.writable_half().is_ending()
    }

    /// Whether `finish` was emitted
    fn is_writable_finished(&self) -> bool {
        self.core().writable_side() == Side::Done
    }

    fn writable_need_drain(&self) -> bool {
        self.writable_half().need_drain()
    }

    fn on_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.writable_half().on_drain(listener)
    }

    fn on_finish(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.core().on_finish.on(move |_| listener())
    }

    /// A readable started piping into this stream
    fn on_pipe(&self, listener: impl Fn(StreamId) + 'static) -> ListenerId {
        self.writable_half().pipe.on(move |id| listener(*id))
    }

    fn on_unpipe(&self, listener: impl Fn(StreamId) + 'static) -> ListenerId {
        self.writable_half().unpipe.on(move |id| listener(*id))
    }
}

/// A stream that only consumes chunks
pub struct Writable<W: Payload> {
    core: Rc<StreamCore>,
    half: Rc<WritableHalf<W>>,
}

impl<W: Payload> Clone for Writable<W> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            half: self.half.clone(),
        }
    }
}

impl<W: Payload> Writable<W> {
    pub fn new(rt: &EventLoop, options: StreamOptions, sink: impl Sink<W>) -> Self {
        let core = StreamCore::new(
            rt,
            StreamKind::Writable,
            options.transport,
            options.auto_destroy,
            options.emit_close,
        );
        let half = WritableHalf::new(&core, &options, Box::new(sink));
        Self { core, half }
    }

    /// Writable whose consumption function is a closure
    pub fn from_fn(
        rt: &EventLoop,
        options: StreamOptions,
        write: impl FnMut(Chunk<W>, Completion) + 'static,
    ) -> Self {
        Self::new(rt, options, FnSink(write))
    }
}

impl<W: Payload> Stream for Writable<W> {
    fn core(&self) -> &Rc<StreamCore> {
        &self.core
    }

    fn off(&self, id: ListenerId) -> bool {
        self.core.off(id) || self.half.off(id)
    }
}

impl<W: Payload> WritableStream for Writable<W> {
    type Input = W;

    fn writable_half(&self) -> &Rc<WritableHalf<W>> {
        &self.half
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call<W> {
        Write(W),
        Writev(Vec<W>),
    }

    /// Sink that records every call and completes after `delay`
    struct Recorder<W> {
        rt: EventLoop,
        delay: Option<Duration>,
        calls: Rc<RefCell<Vec<Call<W>>>>,
    }

    impl<W> Recorder<W> {
        fn settle(&self, done: Completion) {
            match self.delay {
                Some(delay) => {
                    self.rt.set_timeout(delay, move || done.complete());
                }
                None => done.complete(),
            }
        }
    }

    impl<W: Payload + Clone> Sink<W> for Recorder<W> {
        fn write(&mut self, chunk: Chunk<W>, done: Completion) {
            self.calls.borrow_mut().push(Call::Write(chunk.payload));
            self.settle(done);
        }

        fn has_writev(&self) -> bool {
            true
        }

        fn writev(&mut self, chunks: Vec<Chunk<W>>, done: Completion) {
            let payloads = chunks.into_iter().map(|c| c.payload).collect();
            self.calls.borrow_mut().push(Call::Writev(payloads));
            self.settle(done);
        }
    }

    fn recorder<W: Payload + Clone>(
        rt: &EventLoop,
        options: StreamOptions,
        delay: Option<Duration>,
    ) -> (Writable<W>, Rc<RefCell<Vec<Call<W>>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = Recorder {
            rt: rt.clone(),
            delay,
            calls: calls.clone(),
        };
        (Writable::new(rt, options, sink), calls)
    }

    #[test]
    fn test_writes_in_order_then_finish() {
        let rt = EventLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let stream = Writable::<u32>::from_fn(&rt, StreamOptions::objects(), move |chunk, done| {
            s.borrow_mut().push(chunk.payload);
            done.complete();
        });
        let finished = Rc::new(Cell::new(0));
        let f = finished.clone();
        stream.on_finish(move || f.set(f.get() + 1));

        for v in 1..=3 {
            assert!(stream.write(v).unwrap());
        }
        stream.end().unwrap();
        stream.end().unwrap();
        assert!(stream.is_writable_ended());
        rt.run().unwrap();

        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert_eq!(finished.get(), 1);
        assert!(stream.is_writable_finished());
        assert!(stream.is_destroyed());
        assert_eq!(stream.writable_length(), 0);
    }

    #[test]
    fn test_drain_round_trip() {
        let rt = EventLoop::new();
        let (stream, calls) =
            recorder::<u32>(&rt, StreamOptions::objects().high_water_mark(3), Some(Duration::from_millis(1)));
        let drains = Rc::new(Cell::new(0));
        let d = drains.clone();
        stream.on_drain(move || d.set(d.get() + 1));

        assert!(stream.write(1).unwrap());
        assert!(stream.write(2).unwrap());
        assert!(stream.write(3).unwrap());
        assert!(!stream.write(4).unwrap());
        assert!(!stream.write(5).unwrap());
        assert!(stream.writable_need_drain());
        assert_eq!(stream.writable_length(), 5);

        // Nothing drains while anything is still buffered or in flight
        while stream.writable_length() > 0 {
            assert_eq!(drains.get(), 0);
            assert!(stream.writable_need_drain());
            assert!(rt.run_once());
        }
        assert_eq!(drains.get(), 0);

        rt.run().unwrap();
        assert_eq!(drains.get(), 1);
        assert!(!stream.writable_need_drain());
        assert_eq!(stream.writable_length(), 0);
        // The first write went out alone, the rest were batched
        assert_eq!(
            *calls.borrow(),
            vec![Call::Write(1), Call::Writev(vec![2, 3, 4, 5])]
        );
    }

    #[test]
    fn test_byte_length_counts_bytes() {
        let rt = EventLoop::new();
        let (stream, _calls) =
            recorder::<Vec<u8>>(&rt, StreamOptions::new().high_water_mark(4), Some(Duration::from_millis(1)));
        assert!(stream.write(vec![0; 4]).unwrap());
        assert!(!stream.write(vec![0; 1]).unwrap());
        assert_eq!(stream.writable_length(), 5);
    }

    #[test]
    fn test_cork_batches_into_one_writev() {
        let rt = EventLoop::new();
        let (stream, calls) = recorder::<&'static str>(&rt, StreamOptions::objects(), None);
        stream.cork();
        stream.cork();
        stream.write("a").unwrap();
        stream.write("b").unwrap();
        stream.write("c").unwrap();
        assert_eq!(stream.writable_corked(), 2);
        stream.uncork();
        assert!(calls.borrow().is_empty());
        stream.uncork();
        assert_eq!(*calls.borrow(), vec![Call::Writev(vec!["a", "b", "c"])]);
    }

    #[test]
    fn test_end_uncorks() {
        let rt = EventLoop::new();
        let (stream, calls) = recorder::<u8>(&rt, StreamOptions::objects(), None);
        stream.cork();
        stream.write(1).unwrap();
        stream.end_with(2).unwrap();
        assert_eq!(stream.writable_corked(), 0);
        rt.run().unwrap();
        assert_eq!(*calls.borrow(), vec![Call::Writev(vec![1, 2])]);
        assert!(stream.is_writable_finished());
    }

    #[test]
    fn test_write_after_end_is_reported_synchronously() {
        let rt = EventLoop::new();
        let (stream, _calls) = recorder::<u8>(&rt, StreamOptions::objects(), None);
        stream.end().unwrap();
        let err = stream.write(1).unwrap_err();
        assert!(matches!(err, StreamError::Protocol(ProtocolViolation::WriteAfterEnd)));
        assert!(stream.end_with(2).is_err());
        assert!(stream.errored().is_none());
        rt.run().unwrap();
        assert!(stream.is_writable_finished());
    }

    #[test]
    fn test_write_on_destroyed_stream() {
        let rt = EventLoop::new();
        let (stream, calls) = recorder::<u8>(&rt, StreamOptions::objects(), None);
        stream.destroy();
        assert!(matches!(
            stream.write(1),
            Err(StreamError::Protocol(ProtocolViolation::Destroyed("write")))
        ));
        assert!(stream.end().is_err());
        rt.run().unwrap();
        assert!(calls.borrow().is_empty());
        assert!(stream.is_closed());
    }

    #[test]
    fn test_consumption_error_aborts_queue() {
        let rt = EventLoop::new();
        let timer_rt = rt.clone();
        let writes = Rc::new(Cell::new(0));
        let w = writes.clone();
        let stream = Writable::<u32>::from_fn(&rt, StreamOptions::objects(), move |chunk, done| {
            w.set(w.get() + 1);
            timer_rt.set_timeout(Duration::from_millis(1), move || {
                if chunk.payload == 2 {
                    done.fail("disk full");
                } else {
                    done.complete();
                }
            });
        });
        let errors = Rc::new(RefCell::new(Vec::new()));
        let e = errors.clone();
        stream.on_error(move |err| e.borrow_mut().push(err.kind()));
        let finished = Rc::new(Cell::new(false));
        let f = finished.clone();
        stream.on_finish(move || f.set(true));

        for v in 1..=4 {
            stream.write(v).unwrap();
        }
        stream.end().unwrap();
        rt.run().unwrap();

        assert_eq!(writes.get(), 2);
        assert_eq!(*errors.borrow(), vec![ErrorKind::Consumption]);
        assert!(!finished.get());
        assert_eq!(stream.writable_length(), 0);
    }

    #[test]
    fn test_final_step_runs_before_finish() {
        struct Flushing(Rc<RefCell<Vec<&'static str>>>);

        impl Sink<u8> for Flushing {
            fn write(&mut self, _chunk: Chunk<u8>, done: Completion) {
                self.0.borrow_mut().push("write");
                done.complete();
            }

            fn finish(&mut self, done: Completion) {
                self.0.borrow_mut().push("final");
                done.complete();
            }
        }

        let rt = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let stream = Writable::new(&rt, StreamOptions::objects(), Flushing(log.clone()));
        let l = log.clone();
        stream.on_finish(move || l.borrow_mut().push("finish"));
        stream.end_with(1).unwrap();
        rt.run().unwrap();
        assert_eq!(*log.borrow(), vec!["write", "final", "finish"]);
    }

    #[test]
    fn test_failing_final_step_errors() {
        struct BadFinal;

        impl Sink<u8> for BadFinal {
            fn write(&mut self, _chunk: Chunk<u8>, done: Completion) {
                done.complete();
            }

            fn finish(&mut self, done: Completion) {
                done.fail("could not flush");
            }
        }

        let rt = EventLoop::new();
        let stream = Writable::new(&rt, StreamOptions::objects(), BadFinal);
        let kind = Rc::new(Cell::new(None));
        let k = kind.clone();
        stream.on_error(move |err| k.set(Some(err.kind())));
        stream.end().unwrap();
        rt.run().unwrap();
        assert_eq!(kind.get(), Some(ErrorKind::Production));
        assert!(!stream.is_writable_finished());
    }

    #[test]
    fn test_write_str_encodes() {
        let rt = EventLoop::new();
        let (stream, calls) = recorder::<Vec<u8>>(&rt, StreamOptions::new(), None);
        stream.write_str("cafe", Encoding::Hex).unwrap();
        assert!(stream.write_str("zz", Encoding::Hex).is_err());
        assert_eq!(*calls.borrow(), vec![Call::Write(vec![0xCA, 0xFE])]);
    }

    #[test]
    fn test_completion_after_destroy_is_noop() {
        let rt = EventLoop::new();
        let pending = Rc::new(RefCell::new(None));
        let p = pending.clone();
        let stream = Writable::<u8>::from_fn(&rt, StreamOptions::objects(), move |_, done| {
            *p.borrow_mut() = Some(done);
        });
        stream.write(1).unwrap();
        stream.destroy();
        if let Some(done) = pending.borrow_mut().take() {
            done.fail("too late");
        }
        rt.run().unwrap();
        assert!(stream.errored().is_none());
    }

    proptest! {
        #[test]
        fn prop_cork_preserves_order(values in proptest::collection::vec(any::<u16>(), 1..32)) {
            let rt = EventLoop::new();
            let (stream, calls) = recorder::<u16>(&rt, StreamOptions::objects(), None);
            stream.cork();
            for v in &values {
                stream.write(*v).unwrap();
            }
            stream.uncork();
            rt.run().unwrap();

            let expected = if values.len() == 1 {
                vec![Call::Write(values[0])]
            } else {
                vec![Call::Writev(values.clone())]
            };
            prop_assert_eq!(&*calls.borrow(), &expected);
        }
    }
}
