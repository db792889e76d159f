//! Stream engine - Node.js compatible stream semantics
//!
//! Provides:
//! - [`Readable`] - produces chunks pulled from a [`Source`]
//! - [`Writable`] - consumes chunks through a [`Sink`]
//! - [`Duplex`] - independent readable and writable sides under one identity
//! - [`Transform`] - maps written chunks to read chunks
//! - [`PassThrough`] - identity transform
//!
//! Capabilities are traits: [`Stream`] for lifecycle, [`ReadableStream`] and
//! [`WritableStream`] for the data sides. Operations such as `pipe`,
//! `pipeline` and `finished` are generic over these traits.

mod duplex;
mod readable;
mod transform;
mod writable;

pub use duplex::Duplex;
pub use readable::{Flow, Readable, ReadableController, ReadableHalf, ReadableStream, Source};
pub use transform::{PassThrough, Transform, Transformer};
pub use writable::{Completion, Sink, Writable, WritableHalf, WritableStream};

use crate::encoding::Encoding;
use crate::error::StreamError;
use crate::runtime::{Emitter, EventLoop, ListenerId};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

/// Global stream ID counter
static STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        StreamId(STREAM_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Class a stream was created as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Readable,
    Writable,
    Duplex,
    Transform,
    PassThrough,
}

impl StreamKind {
    pub fn is_readable(self) -> bool {
        !matches!(self, StreamKind::Writable)
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, StreamKind::Readable)
    }
}

/// Immutable capability tags fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub kind: StreamKind,
    /// Transport backing the stream, e.g. "file" or "memory"
    pub transport: Option<&'static str>,
}

/// A value that can travel through a stream.
///
/// `size` is the unit counted against the high-water mark outside object
/// mode. Byte-like payloads report their length, everything else counts as one.
pub trait Payload: 'static {
    fn size(&self) -> usize {
        1
    }
}

impl Payload for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }
}

impl Payload for Box<[u8]> {
    fn size(&self) -> usize {
        self.len()
    }
}

impl Payload for String {
    fn size(&self) -> usize {
        self.len()
    }
}

impl Payload for &'static str {
    fn size(&self) -> usize {
        self.len()
    }
}

macro_rules! unit_payload {
    ($($ty:ty),*) => {
        $(impl Payload for $ty {})*
    };
}

unit_payload!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

impl<T: Payload> Payload for Option<T> {
    fn size(&self) -> usize {
        self.as_ref().map_or(0, Payload::size)
    }
}

impl<A: Payload, B: Payload> Payload for (A, B) {
    fn size(&self) -> usize {
        self.0.size() + self.1.size()
    }
}

/// A written payload together with its encoding tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<W> {
    pub payload: W,
    pub encoding: Option<Encoding>,
}

impl<W> Chunk<W> {
    pub fn new(payload: W) -> Self {
        Self {
            payload,
            encoding: None,
        }
    }
}

/// Completion state of one side of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Absent,
    Open,
    Done,
}

type TeardownHook = Box<dyn FnOnce(Option<&StreamError>) -> Option<StreamError>>;

/// Lifecycle shared by both sides of a stream: identity, destroy, the
/// terminal `error`/`close` notifications and the `end`/`finish` milestones.
#[doc(hidden)]
pub struct StreamCore {
    id: StreamId,
    caps: Capabilities,
    rt: EventLoop,
    auto_destroy: bool,
    emit_close: bool,
    destroyed: Cell<bool>,
    closed: Cell<bool>,
    error_emitted: Cell<bool>,
    close_emitted: Cell<bool>,
    errored: RefCell<Option<StreamError>>,
    readable: Cell<Side>,
    writable: Cell<Side>,
    teardown: RefCell<Vec<TeardownHook>>,
    pub(crate) on_error: Emitter<StreamError>,
    pub(crate) on_close: Emitter<()>,
    pub(crate) on_end: Emitter<()>,
    pub(crate) on_finish: Emitter<()>,
    /// Fired after `close`, also when `emit_close` is off
    pub(crate) on_terminated: Emitter<()>,
}

impl StreamCore {
    pub(crate) fn new(
        rt: &EventLoop,
        kind: StreamKind,
        transport: Option<&'static str>,
        auto_destroy: bool,
        emit_close: bool,
    ) -> Rc<Self> {
        let side = |present: bool| if present { Side::Open } else { Side::Absent };
        Rc::new(Self {
            id: StreamId::next(),
            caps: Capabilities { kind, transport },
            rt: rt.clone(),
            auto_destroy,
            emit_close,
            destroyed: Cell::new(false),
            closed: Cell::new(false),
            error_emitted: Cell::new(false),
            close_emitted: Cell::new(false),
            errored: RefCell::new(None),
            readable: Cell::new(side(kind.is_readable())),
            writable: Cell::new(side(kind.is_writable())),
            teardown: RefCell::new(Vec::new()),
            on_error: Emitter::new(),
            on_close: Emitter::new(),
            on_end: Emitter::new(),
            on_finish: Emitter::new(),
            on_terminated: Emitter::new(),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.rt
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.errored.borrow().clone()
    }

    pub(crate) fn readable_side(&self) -> Side {
        self.readable.get()
    }

    pub(crate) fn writable_side(&self) -> Side {
        self.writable.get()
    }

    pub(crate) fn error_emitted(&self) -> bool {
        self.error_emitted.get()
    }

    pub(crate) fn close_emitted(&self) -> bool {
        self.close_emitted.get()
    }

    /// Register cleanup run once on destroy; it may report a destroy error
    pub(crate) fn on_teardown(
        &self,
        hook: impl FnOnce(Option<&StreamError>) -> Option<StreamError> + 'static,
    ) {
        self.teardown.borrow_mut().push(Box::new(hook));
    }

    fn set_errored(&self, err: StreamError) {
        let mut slot = self.errored.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Destroy the stream. Idempotent: later calls have no effect.
    ///
    /// Buffers are released synchronously; `error` (if any) and then `close`
    /// are emitted on the next tick.
    pub fn destroy(self: &Rc<Self>, err: Option<StreamError>) {
        if self.destroyed.replace(true) {
            return;
        }

        match &err {
            Some(e) => tracing::debug!(stream = %self.id, kind = ?self.caps.kind, "destroying stream: {}", e),
            None => tracing::trace!(stream = %self.id, kind = ?self.caps.kind, "destroying stream"),
        }

        if let Some(err) = err {
            self.set_errored(err);
        }

        let hooks = std::mem::take(&mut *self.teardown.borrow_mut());
        for hook in hooks {
            let errored = self.errored();
            if let Some(err) = hook(errored.as_ref()) {
                self.set_errored(err);
            }
        }

        let core = self.clone();
        self.rt.next_tick(move || core.emit_error_and_close());
    }

    fn emit_error_and_close(&self) {
        self.closed.set(true);

        if let Some(err) = self.errored() {
            if !self.error_emitted.replace(true) && !self.on_error.emit(&err) {
                self.rt.report_unhandled(err);
            }
        }

        if self.emit_close && !self.close_emitted.replace(true) {
            self.on_close.emit(&());
        }
        self.on_terminated.emit(&());
        self.on_terminated.clear();
    }

    /// Readable side delivered its last chunk: emit `end`, maybe auto-destroy
    pub(crate) fn readable_ended(self: &Rc<Self>) {
        self.readable.set(Side::Done);
        self.on_end.emit(&());
        if self.auto_destroy && self.writable.get() != Side::Open {
            self.destroy(None);
        }
    }

    /// Writable side flushed everything: emit `finish`, maybe auto-destroy
    pub(crate) fn writable_finished(self: &Rc<Self>) {
        self.writable.set(Side::Done);
        self.on_finish.emit(&());
        if self.auto_destroy && self.readable.get() != Side::Open {
            self.destroy(None);
        }
    }

    /// Remove a lifecycle listener
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        self.on_error.off(id)
            || self.on_close.off(id)
            || self.on_end.off(id)
            || self.on_finish.off(id)
            || self.on_terminated.off(id)
    }
}

/// Base capability: identity, lifecycle and the terminal notifications
pub trait Stream: Clone + 'static {
    #[doc(hidden)]
    fn core(&self) -> &Rc<StreamCore>;

    /// Remove a listener registered through any notification of this stream
    fn off(&self, id: ListenerId) -> bool;

    fn id(&self) -> StreamId {
        self.core().id()
    }

    fn capabilities(&self) -> Capabilities {
        self.core().capabilities()
    }

    fn event_loop(&self) -> &EventLoop {
        self.core().event_loop()
    }

    /// Destroy without an error; a no-op on an already destroyed stream
    fn destroy(&self) {
        self.core().destroy(None);
    }

    /// Destroy and emit `error` with `err`
    fn destroy_with(&self, err: StreamError) {
        self.core().destroy(Some(err));
    }

    fn is_destroyed(&self) -> bool {
        self.core().is_destroyed()
    }

    /// Whether `close` was emitted (or would have been, with `emit_close` off)
    fn is_closed(&self) -> bool {
        self.core().is_closed()
    }

    fn errored(&self) -> Option<StreamError> {
        self.core().errored()
    }

    fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.core().on_error.on(listener)
    }

    fn once_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.core().on_error.once(listener)
    }

    fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.core().on_close.on(move |_| listener())
    }
}
