//! Readable side: buffering, flow control and end-of-stream signaling
//!
//! A readable pulls chunks from its [`Source`] whenever the buffer is below the
//! high-water mark. In flowing mode chunks are delivered as `data`
//! notifications; in paused mode they wait in the buffer until `read()`.

use super::{Payload, Side, Stream, StreamCore, StreamKind};
use crate::config::StreamOptions;
use crate::error::{BoxError, ProtocolViolation, StreamError};
use crate::pipe::{self, PipeEdge, PipeOptions};
use crate::runtime::{Emitter, EventLoop, ListenerId};
use crate::stream::WritableStream;
use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    rc::{Rc, Weak},
};

/// Production function of a readable stream.
///
/// `read` is called when the stream wants more data; the implementation
/// answers by pushing through the controller, now or later. It is not called
/// again until something was pushed.
pub trait Source<R: Payload>: 'static {
    fn read(&mut self, ctl: &ReadableController<R>, size_hint: usize) -> Result<(), BoxError>;

    /// Release resources; called once when the stream is destroyed
    fn destroy(&mut self, _err: Option<&StreamError>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Adapter turning a closure into a [`Source`]
struct FnSource<F>(F);

impl<R, F> Source<R> for FnSource<F>
where
    R: Payload,
    F: FnMut(&ReadableController<R>) -> Result<(), BoxError> + 'static,
{
    fn read(&mut self, ctl: &ReadableController<R>, _size_hint: usize) -> Result<(), BoxError> {
        (self.0)(ctl)
    }
}

/// Flow mode of a readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// No consumer attached yet
    Initial,
    /// Chunks are pushed to `data` listeners as they arrive
    Flowing,
    /// Chunks wait in the buffer until pulled
    Paused,
}

struct ReadableState<R> {
    buffer: VecDeque<R>,
    length: usize,
    high_water_mark: usize,
    object_mode: bool,
    flow: Flow,
    ended: bool,
    end_emitted: bool,
    reading: bool,
    /// Inside a synchronous call to the source
    sync: bool,
    need_readable: bool,
    emitted_readable: bool,
    readable_listening: bool,
    resume_scheduled: bool,
    reading_more: bool,
    data_emitted: bool,
    /// Pipe edges whose destination signalled backpressure
    awaiting_drain: HashSet<u64>,
}

impl<R: Payload> ReadableState<R> {
    fn measure(&self, chunk: &R) -> usize {
        if self.object_mode { 1 } else { chunk.size() }
    }
}

/// Readable state machine, shared by [`Readable`], [`super::Duplex`] and
/// [`super::Transform`].
#[doc(hidden)]
pub struct ReadableHalf<R: Payload> {
    core: Rc<StreamCore>,
    state: RefCell<ReadableState<R>>,
    source: RefCell<Box<dyn Source<R>>>,
    data: Emitter<R>,
    readable: Emitter<()>,
    pause: Emitter<()>,
    resume: Emitter<()>,
    pub(crate) pipes: RefCell<Vec<PipeEdge>>,
}

impl<R: Payload> ReadableHalf<R> {
    pub(crate) fn new(
        core: &Rc<StreamCore>,
        options: &StreamOptions,
        source: Box<dyn Source<R>>,
    ) -> Rc<Self> {
        let (object_mode, high_water_mark) = options.readable_side();
        let half = Rc::new(Self {
            core: core.clone(),
            state: RefCell::new(ReadableState {
                buffer: VecDeque::new(),
                length: 0,
                high_water_mark,
                object_mode,
                flow: Flow::Initial,
                ended: false,
                end_emitted: false,
                reading: false,
                sync: true,
                need_readable: false,
                emitted_readable: false,
                readable_listening: false,
                resume_scheduled: false,
                reading_more: false,
                data_emitted: false,
                awaiting_drain: HashSet::new(),
            }),
            source: RefCell::new(source),
            data: Emitter::new(),
            readable: Emitter::new(),
            pause: Emitter::new(),
            resume: Emitter::new(),
            pipes: RefCell::new(Vec::new()),
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
            st.awaiting_drain.clear();
        }

        let result = match self.source.try_borrow_mut() {
            Ok(mut source) => source.destroy(err),
            Err(_) => {
                // The source destroyed its own stream from inside `read`
                let this = self.clone();
                let err = err.cloned();
                self.rt().next_tick(move || {
                    if let Err(e) = this.source.borrow_mut().destroy(err.as_ref()) {
                        tracing::warn!(stream = %this.core.id(), "source destroy failed: {}", e);
                    }
                });
                Ok(())
            }
        };
        result.err().map(StreamError::production)
    }

    pub(crate) fn controller(self: &Rc<Self>) -> ReadableController<R> {
        ReadableController {
            half: Rc::downgrade(self),
        }
    }

    fn flow_mode(&self) -> Flow {
        self.state.borrow().flow
    }

    pub(crate) fn length(&self) -> usize {
        self.state.borrow().length
    }

    pub(crate) fn high_water_mark(&self) -> usize {
        self.state.borrow().high_water_mark
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.state.borrow().ended
    }

    fn call_source(self: &Rc<Self>) {
        let ctl = self.controller();
        let size_hint = self.state.borrow().high_water_mark;
        let result = match self.source.try_borrow_mut() {
            Ok(mut source) => source.read(&ctl, size_hint),
            Err(_) => {
                self.state.borrow_mut().reading = false;
                return;
            }
        };
        if let Err(e) = result {
            self.core.destroy(Some(StreamError::production(e)));
        }
    }

    /// Append a chunk, or signal end of data with `None`
    pub(crate) fn push(self: &Rc<Self>, chunk: Option<R>) -> bool {
        if self.core.is_destroyed() {
            return false;
        }

        let Some(chunk) = chunk else {
            self.state.borrow_mut().reading = false;
            self.on_eof();
            return false;
        };

        if self.state.borrow().ended {
            self.core.destroy(Some(ProtocolViolation::PushAfterEnd.into()));
            return false;
        }

        self.state.borrow_mut().reading = false;
        self.add_chunk(chunk, false);

        let st = self.state.borrow();
        !st.ended && (st.length < st.high_water_mark || st.length == 0)
    }

    pub(crate) fn unshift(self: &Rc<Self>, chunk: R) {
        if self.core.is_destroyed() {
            return;
        }
        if self.state.borrow().end_emitted {
            self.core.destroy(Some(ProtocolViolation::UnshiftAfterEnd.into()));
            return;
        }
        self.add_chunk(chunk, true);
    }

    fn add_chunk(self: &Rc<Self>, chunk: R, to_front: bool) {
        let direct = {
            let st = self.state.borrow();
            !to_front
                && st.flow == Flow::Flowing
                && st.length == 0
                && !st.sync
                && self.data.listener_count() > 0
        };

        if direct {
            self.state.borrow_mut().data_emitted = true;
            self.data.emit(&chunk);
        } else {
            let need_readable = {
                let mut st = self.state.borrow_mut();
                st.length += st.measure(&chunk);
                if to_front {
                    st.buffer.push_front(chunk);
                } else {
                    st.buffer.push_back(chunk);
                }
                st.need_readable
            };
            if need_readable {
                self.emit_readable();
            }
        }

        self.maybe_read_more();
    }

    fn on_eof(self: &Rc<Self>) {
        let sync = {
            let mut st = self.state.borrow_mut();
            if st.ended {
                return;
            }
            st.ended = true;
            st.sync
        };

        if sync {
            self.emit_readable();
        } else {
            {
                let mut st = self.state.borrow_mut();
                st.need_readable = false;
                st.emitted_readable = true;
            }
            self.emit_readable_now();
        }
    }

    fn emit_readable(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            st.need_readable = false;
            if st.emitted_readable {
                return;
            }
            st.emitted_readable = true;
        }
        let this = self.clone();
        self.rt().next_tick(move || this.emit_readable_now());
    }

    fn emit_readable_now(self: &Rc<Self>) {
        let notify = {
            let st = self.state.borrow();
            !self.core.is_destroyed() && (st.length > 0 || st.ended)
        };
        if notify {
            self.readable.emit(&());
            self.state.borrow_mut().emitted_readable = false;
        }

        {
            let mut st = self.state.borrow_mut();
            st.need_readable =
                st.flow != Flow::Flowing && !st.ended && st.length <= st.high_water_mark;
        }
        self.flow();
    }

    /// Deliver buffered chunks while flowing
    fn flow(self: &Rc<Self>) {
        loop {
            if self.flow_mode() != Flow::Flowing {
                break;
            }
            if self.read_impl(true).is_none() {
                break;
            }
        }
    }

    fn maybe_read_more(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            if st.reading_more {
                return;
            }
            st.reading_more = true;
        }
        let this = self.clone();
        self.rt().next_tick(move || this.read_more());
    }

    /// Top the buffer up to the high-water mark
    fn read_more(self: &Rc<Self>) {
        loop {
            let (go, length) = {
                let st = self.state.borrow();
                let go = !st.reading
                    && !st.ended
                    && (st.length < st.high_water_mark
                        || (st.flow == Flow::Flowing && st.length == 0));
                (go, st.length)
            };
            if !go || self.core.is_destroyed() {
                break;
            }
            self.read_impl(false);
            if length == self.length() {
                break;
            }
        }
        self.state.borrow_mut().reading_more = false;
    }

    /// Pull one chunk (`consume`) or only poke the source (`!consume`)
    fn read_impl(self: &Rc<Self>, consume: bool) -> Option<R> {
        if self.core.is_destroyed() {
            return None;
        }

        enum Next {
            End,
            Readable,
            Proceed(bool),
        }

        let next = {
            let mut st = self.state.borrow_mut();
            if consume {
                st.emitted_readable = false;
            }
            let full = if st.high_water_mark != 0 {
                st.length >= st.high_water_mark
            } else {
                st.length > 0
            };

            if !consume && st.need_readable && (full || st.ended) {
                if st.length == 0 && st.ended {
                    Next::End
                } else {
                    Next::Readable
                }
            } else if consume && st.length == 0 && st.ended {
                Next::End
            } else {
                let front = if consume {
                    st.buffer.front().map_or(0, |chunk| st.measure(chunk))
                } else {
                    0
                };
                let mut do_read = st.need_readable
                    || st.length == 0
                    || st.length - front < st.high_water_mark;
                if st.ended || st.reading {
                    do_read = false;
                }
                if do_read {
                    st.reading = true;
                    st.sync = true;
                    if st.length == 0 {
                        st.need_readable = true;
                    }
                }
                Next::Proceed(do_read)
            }
        };

        match next {
            Next::End => {
                self.end_readable();
                return None;
            }
            Next::Readable => {
                self.emit_readable();
                return None;
            }
            Next::Proceed(true) => {
                self.call_source();
                self.state.borrow_mut().sync = false;
            }
            Next::Proceed(false) => {}
        }

        if !consume {
            return None;
        }

        let (chunk, drained) = {
            let mut st = self.state.borrow_mut();
            let chunk = st.buffer.pop_front();
            match &chunk {
                Some(c) => {
                    let n = st.measure(c);
                    st.length -= n;
                }
                None => st.need_readable = st.length <= st.high_water_mark,
            }
            if st.length == 0 && !st.ended {
                st.need_readable = true;
            }
            (chunk, st.length == 0 && st.ended)
        };

        if drained {
            self.end_readable();
        }

        if let Some(c) = &chunk {
            if !self.core.error_emitted() && !self.core.close_emitted() {
                self.state.borrow_mut().data_emitted = true;
                self.data.emit(c);
            }
        }
        chunk
    }

    pub(crate) fn read(self: &Rc<Self>) -> Option<R> {
        self.read_impl(true)
    }

    fn end_readable(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            if st.end_emitted {
                return;
            }
            st.ended = true;
        }
        let this = self.clone();
        self.rt().next_tick(move || this.end_readable_now());
    }

    fn end_readable_now(self: &Rc<Self>) {
        let emit = {
            let mut st = self.state.borrow_mut();
            let emit = !self.core.is_destroyed()
                && self.core.errored().is_none()
                && !st.end_emitted
                && st.length == 0;
            if emit {
                st.end_emitted = true;
            }
            emit
        };
        if emit {
            self.core.readable_ended();
        }
    }

    pub(crate) fn resume(self: &Rc<Self>) {
        let schedule = {
            let mut st = self.state.borrow_mut();
            if st.flow == Flow::Flowing {
                false
            } else {
                st.flow = if st.readable_listening {
                    Flow::Paused
                } else {
                    Flow::Flowing
                };
                !std::mem::replace(&mut st.resume_scheduled, true)
            }
        };
        if schedule {
            let this = self.clone();
            self.rt().next_tick(move || this.resume_now());
        }
    }

    fn resume_now(self: &Rc<Self>) {
        if self.core.is_destroyed() {
            return;
        }
        if !self.state.borrow().reading {
            self.read_impl(false);
        }
        self.state.borrow_mut().resume_scheduled = false;
        self.resume.emit(&());
        self.flow();

        let poke = {
            let st = self.state.borrow();
            st.flow == Flow::Flowing && !st.reading
        };
        if poke {
            self.read_impl(false);
        }
    }

    pub(crate) fn pause(self: &Rc<Self>) {
        let emit = {
            let mut st = self.state.borrow_mut();
            std::mem::replace(&mut st.flow, Flow::Paused) != Flow::Paused
        };
        if emit {
            self.pause.emit(&());
        }
    }

    pub(crate) fn on_data(self: &Rc<Self>, listener: impl Fn(&R) + 'static) -> ListenerId {
        let id = self.data.on(listener);
        if self.flow_mode() != Flow::Paused {
            self.resume();
        }
        id
    }

    /// Internal data subscription that does not change the flow mode
    pub(crate) fn subscribe_data(&self, listener: impl Fn(&R) + 'static) -> ListenerId {
        self.data.on(listener)
    }

    pub(crate) fn on_readable(self: &Rc<Self>, listener: impl Fn() + 'static) -> ListenerId {
        let id = self.readable.on(move |_| listener());

        enum Kick {
            Nothing,
            Readable,
            Read,
        }
        let kick = {
            let mut st = self.state.borrow_mut();
            if st.end_emitted {
                Kick::Nothing
            } else {
                st.readable_listening = true;
                st.need_readable = true;
                st.flow = Flow::Paused;
                st.emitted_readable = false;
                if st.length > 0 {
                    Kick::Readable
                } else if !st.reading {
                    Kick::Read
                } else {
                    Kick::Nothing
                }
            }
        };
        match kick {
            Kick::Readable => self.emit_readable(),
            Kick::Read => {
                let this = self.clone();
                self.rt().next_tick(move || {
                    this.read_impl(false);
                });
            }
            Kick::Nothing => {}
        }
        id
    }

    pub(crate) fn off(self: &Rc<Self>, id: ListenerId) -> bool {
        if self.readable.off(id) {
            let listening = self.readable.listener_count() > 0;
            self.state.borrow_mut().readable_listening = listening;
            if !listening && self.data.listener_count() > 0 {
                self.resume();
            } else if !listening {
                let mut st = self.state.borrow_mut();
                if st.flow == Flow::Paused && !st.resume_scheduled {
                    st.flow = Flow::Initial;
                }
            }
            return true;
        }
        self.data.off(id) || self.pause.off(id) || self.resume.off(id)
    }

    /// A pipe destination signalled backpressure
    pub(crate) fn pipe_wait(self: &Rc<Self>, edge: u64) {
        self.state.borrow_mut().awaiting_drain.insert(edge);
        self.pause();
    }

    /// A pipe destination drained; true when no destination is waiting anymore
    pub(crate) fn pipe_drained(&self, edge: u64) -> bool {
        let mut st = self.state.borrow_mut();
        st.awaiting_drain.remove(&edge) && st.awaiting_drain.is_empty()
    }
}

/// Producer-side handle of a readable.
///
/// Holds a weak reference: once the stream is gone or destroyed every
/// operation is a no-op.
pub struct ReadableController<R: Payload> {
    half: Weak<ReadableHalf<R>>,
}

impl<R: Payload> Clone for ReadableController<R> {
    fn clone(&self) -> Self {
        Self {
            half: self.half.clone(),
        }
    }
}

impl<R: Payload> ReadableController<R> {
    /// Push a chunk; returns whether the producer should keep producing
    pub fn push(&self, chunk: R) -> bool {
        self.half
            .upgrade()
            .is_some_and(|half| half.push(Some(chunk)))
    }

    /// Signal that no more chunks will be pushed
    pub fn end(&self) {
        if let Some(half) = self.half.upgrade() {
            half.push(None);
        }
    }

    /// Put a chunk back at the head of the buffer
    pub fn unshift(&self, chunk: R) {
        if let Some(half) = self.half.upgrade() {
            half.unshift(chunk);
        }
    }

    /// Fail the stream with a production error
    pub fn fail(&self, err: impl Into<BoxError>) {
        if let Some(half) = self.half.upgrade() {
            half.core.destroy(Some(StreamError::production(err)));
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.half
            .upgrade()
            .is_none_or(|half| half.core.is_destroyed())
    }

    /// Event loop of the stream, for scheduling asynchronous pushes
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.half
            .upgrade()
            .map(|half| half.core.event_loop().clone())
    }
}

/// Readable capability: pull, flow control, data notifications and piping
pub trait ReadableStream: Stream {
    type Output: Payload;

    #[doc(hidden)]
    fn readable_half(&self) -> &Rc<ReadableHalf<Self::Output>>;

    /// Pull the next buffered chunk; also emitted as `data`
    fn read(&self) -> Option<Self::Output> {
        self.readable_half().read()
    }

    /// Stop `data` delivery; chunks accumulate in the buffer
    fn pause(&self) {
        self.readable_half().pause();
    }

    /// Switch to flowing mode; buffered chunks are delivered first
    fn resume(&self) {
        self.readable_half().resume();
    }

    fn is_paused(&self) -> bool {
        self.readable_half().flow_mode() == Flow::Paused
    }

    /// `None` until a consumer attached, then whether the stream is flowing
    fn readable_flowing(&self) -> Option<bool> {
        match self.readable_half().flow_mode() {
            Flow::Initial => None,
            Flow::Flowing => Some(true),
            Flow::Paused => Some(false),
        }
    }

    fn readable_length(&self) -> usize {
        self.readable_half().length()
    }

    fn readable_high_water_mark(&self) -> usize {
        self.readable_half().high_water_mark()
    }

    fn readable_object_mode(&self) -> bool {
        self.readable_half().state.borrow().object_mode
    }

    /// Whether `end` was emitted
    fn is_readable_ended(&self) -> bool {
        self.core().readable_side() == Side::Done
    }

    /// Put a chunk back at the head of the buffer
    fn unshift(&self, chunk: Self::Output) {
        self.readable_half().unshift(chunk);
    }

    /// Listen for chunks; switches the stream to flowing unless it was paused
    fn on_data(&self, listener: impl Fn(&Self::Output) + 'static) -> ListenerId {
        self.readable_half().on_data(listener)
    }

    fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.core().on_end.on(move |_| listener())
    }

    /// Listen for data becoming available; switches the stream to paused mode
    fn on_readable(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable_half().on_readable(listener)
    }

    fn on_pause(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable_half().pause.on(move |_| listener())
    }

    fn on_resume(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable_half().resume.on(move |_| listener())
    }

    /// Pipe into `dest`, ending it when this stream ends. Returns `dest`.
    fn pipe<D>(&self, dest: &D) -> D
    where
        D: WritableStream<Input = Self::Output>,
        Self::Output: Clone,
    {
        pipe::pipe(self, dest, PipeOptions::default())
    }

    fn pipe_with<D>(&self, dest: &D, options: PipeOptions) -> D
    where
        D: WritableStream<Input = Self::Output>,
        Self::Output: Clone,
    {
        pipe::pipe(self, dest, options)
    }

    /// Detach `dest`; returns whether it was piped from this stream
    fn unpipe<D: Stream>(&self, dest: &D) -> bool {
        pipe::unpipe(self.readable_half(), Some(dest.id()))
    }

    fn unpipe_all(&self) {
        pipe::unpipe(self.readable_half(), None);
    }
}

/// A stream that only produces chunks
pub struct Readable<R: Payload> {
    core: Rc<StreamCore>,
    half: Rc<ReadableHalf<R>>,
}

impl<R: Payload> Clone for Readable<R> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            half: self.half.clone(),
        }
    }
}

impl<R: Payload> Readable<R> {
    pub fn new(rt: &EventLoop, options: StreamOptions, source: impl Source<R>) -> Self {
        let core = StreamCore::new(
            rt,
            StreamKind::Readable,
            options.transport,
            options.auto_destroy,
            options.emit_close,
        );
        let half = ReadableHalf::new(&core, &options, Box::new(source));
        Self { core, half }
    }

    /// Readable whose production function is a closure
    pub fn from_fn(
        rt: &EventLoop,
        options: StreamOptions,
        read: impl FnMut(&ReadableController<R>) -> Result<(), BoxError> + 'static,
    ) -> Self {
        Self::new(rt, options, FnSource(read))
    }

    /// Readable fed only through its controller
    pub fn manual(rt: &EventLoop, options: StreamOptions) -> (Self, ReadableController<R>) {
        let readable = Self::from_fn(rt, options, |_| Ok(()));
        let ctl = readable.controller();
        (readable, ctl)
    }

    /// Producer-side handle
    pub fn controller(&self) -> ReadableController<R> {
        self.half.controller()
    }
}

impl<R: Payload> Stream for Readable<R> {
    fn core(&self) -> &Rc<StreamCore> {
        &self.core
    }

    fn off(&self, id: ListenerId) -> bool {
        self.core.off(id) || self.half.off(id)
    }
}

impl<R: Payload> ReadableStream for Readable<R> {
    type Output = R;

    fn readable_half(&self) -> &Rc<ReadableHalf<R>> {
        &self.half
    }
}
