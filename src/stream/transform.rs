//! Transform and PassThrough streams
//!
//! A transform is a duplex whose writable side feeds a [`Transformer`] and
//! whose readable side carries what the transformer pushes. Writes are handed
//! to the transformer one at a time, so output keeps the input order even when
//! the transformer completes asynchronously.

use super::{
    Chunk, Completion, Duplex, Payload, ReadableController, ReadableHalf, ReadableStream, Sink,
    Source, Stream, StreamCore, StreamKind, WritableHalf, WritableStream,
};
use crate::config::StreamOptions;
use crate::error::{BoxError, StreamError};
use crate::runtime::{EventLoop, ListenerId};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

/// Mapping function of a [`Transform`]
pub trait Transformer<W: Payload, R: Payload>: 'static {
    /// Push zero or more output chunks for `chunk`, then settle `done`
    fn transform(&mut self, chunk: Chunk<W>, out: &ReadableController<R>, done: Completion);

    /// Push trailing output once the writable side ended
    fn flush(&mut self, _out: &ReadableController<R>, done: Completion) {
        done.complete();
    }

    /// The readable side wants more output. Transformers that hold back
    /// output under backpressure resume pushing here.
    fn pull(&mut self, _out: &ReadableController<R>) {}

    /// The stream was destroyed; drop held output and parked completions
    fn destroy(&mut self, _err: Option<&StreamError>) {}
}

struct FnTransformer<F>(F);

impl<W, R, F> Transformer<W, R> for FnTransformer<F>
where
    W: Payload,
    R: Payload,
    F: FnMut(W, &ReadableController<R>) -> Result<(), BoxError> + 'static,
{
    fn transform(&mut self, chunk: Chunk<W>, out: &ReadableController<R>, done: Completion) {
        done.done((self.0)(chunk.payload, out));
    }
}

struct Identity;

impl<T: Payload> Transformer<T, T> for Identity {
    fn transform(&mut self, chunk: Chunk<T>, out: &ReadableController<T>, done: Completion) {
        out.push(chunk.payload);
        done.complete();
    }
}

fn production(err: BoxError) -> StreamError {
    StreamError::production(err)
}

/// State shared by the two halves of a transform
struct Shared<W: Payload, R: Payload> {
    transformer: RefCell<Box<dyn Transformer<W, R>>>,
    /// Write completion held back until the readable side is pulled
    pending: RefCell<Option<Completion>>,
    readable: RefCell<Weak<ReadableHalf<R>>>,
    writable: RefCell<Weak<WritableHalf<W>>>,
}

impl<W: Payload, R: Payload> Shared<W, R> {
    fn readable(&self) -> Option<Rc<ReadableHalf<R>>> {
        self.readable.borrow().upgrade()
    }

    fn writable_ending(&self) -> bool {
        self.writable
            .borrow()
            .upgrade()
            .is_some_and(|w| w.is_ending())
    }

    /// Complete a write now, or park it while the readable buffer is full
    fn after_transform(&self, before: usize, done: Completion) {
        let Some(readable) = self.readable() else {
            done.complete();
            return;
        };
        let length = readable.length();
        if readable.is_ended()
            || self.writable_ending()
            || length == before
            || length < readable.high_water_mark()
        {
            done.complete();
        } else {
            *self.pending.borrow_mut() = Some(done);
        }
    }
}

struct TransformSource<W: Payload, R: Payload>(Rc<Shared<W, R>>);

impl<W: Payload, R: Payload> Source<R> for TransformSource<W, R> {
    fn read(&mut self, ctl: &ReadableController<R>, _size_hint: usize) -> Result<(), BoxError> {
        match self.0.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.pull(ctl),
            Err(_) => {
                // Pulled from inside the transformer; retry once it returned
                if let Some(rt) = ctl.event_loop() {
                    let shared = self.0.clone();
                    let ctl = ctl.clone();
                    rt.next_tick(move || {
                        if let Ok(mut transformer) = shared.transformer.try_borrow_mut() {
                            transformer.pull(&ctl);
                        }
                    });
                }
            }
        }

        let pending = self.0.pending.borrow_mut().take();
        if let Some(done) = pending {
            done.complete();
        }
        Ok(())
    }

    fn destroy(&mut self, err: Option<&StreamError>) -> Result<(), BoxError> {
        let pending = self.0.pending.borrow_mut().take();
        if let Some(done) = pending {
            done.discard();
        }
        if let Ok(mut transformer) = self.0.transformer.try_borrow_mut() {
            transformer.destroy(err);
        }
        Ok(())
    }
}

struct TransformSink<W: Payload, R: Payload>(Rc<Shared<W, R>>);

impl<W: Payload, R: Payload> Sink<W> for TransformSink<W, R> {
    fn write(&mut self, chunk: Chunk<W>, done: Completion) {
        let Some(readable) = self.0.readable() else {
            done.complete();
            return;
        };
        let before = readable.length();
        let out = readable.controller();

        let shared = self.0.clone();
        let inner = Completion::new(production, move |result| match result {
            Ok(()) => shared.after_transform(before, done),
            Err(err) => done.settle(Err(err)),
        });

        match self.0.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.transform(chunk, &out, inner),
            Err(_) => inner.fail("transformer re-entered"),
        }
    }

    fn finish(&mut self, done: Completion) {
        let Some(readable) = self.0.readable() else {
            done.complete();
            return;
        };
        let out = readable.controller();

        let end = out.clone();
        let inner = Completion::new(production, move |result| match result {
            Ok(()) => {
                end.end();
                done.complete();
            }
            Err(err) => done.settle(Err(err)),
        });

        match self.0.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.flush(&out, inner),
            Err(_) => inner.fail("transformer re-entered"),
        }
    }
}

/// Duplex whose output is computed from its input
pub struct Transform<W: Payload, R: Payload> {
    inner: Duplex<W, R>,
}

impl<W: Payload, R: Payload> Clone for Transform<W, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Payload, R: Payload> Transform<W, R> {
    pub fn new(rt: &EventLoop, options: StreamOptions, transformer: impl Transformer<W, R>) -> Self {
        Self::with_kind(rt, StreamKind::Transform, options, Box::new(transformer))
    }

    fn with_kind(
        rt: &EventLoop,
        kind: StreamKind,
        options: StreamOptions,
        transformer: Box<dyn Transformer<W, R>>,
    ) -> Self {
        let shared = Rc::new(Shared {
            transformer: RefCell::new(transformer),
            pending: RefCell::new(None),
            readable: RefCell::new(Weak::new()),
            writable: RefCell::new(Weak::new()),
        });
        let inner = Duplex::with_kind(
            rt,
            kind,
            options,
            Box::new(TransformSource(shared.clone())),
            Box::new(TransformSink(shared.clone())),
        );
        *shared.readable.borrow_mut() = Rc::downgrade(inner.readable_half());
        *shared.writable.borrow_mut() = Rc::downgrade(inner.writable_half());
        Self { inner }
    }

    /// Transform whose mapping is a closure pushing through the controller
    pub fn from_fn(
        rt: &EventLoop,
        options: StreamOptions,
        transform: impl FnMut(W, &ReadableController<R>) -> Result<(), BoxError> + 'static,
    ) -> Self {
        Self::new(rt, options, FnTransformer(transform))
    }

    /// One output chunk per input chunk
    pub fn map(rt: &EventLoop, options: StreamOptions, mut f: impl FnMut(W) -> R + 'static) -> Self {
        Self::from_fn(rt, options, move |chunk, out| {
            out.push(f(chunk));
            Ok(())
        })
    }
}

impl<W: Payload, R: Payload> Stream for Transform<W, R> {
    fn core(&self) -> &Rc<StreamCore> {
        self.inner.core()
    }

    fn off(&self, id: ListenerId) -> bool {
        self.inner.off(id)
    }
}

impl<W: Payload, R: Payload> ReadableStream for Transform<W, R> {
    type Output = R;

    fn readable_half(&self) -> &Rc<ReadableHalf<R>> {
        self.inner.readable_half()
    }
}

impl<W: Payload, R: Payload> WritableStream for Transform<W, R> {
    type Input = W;

    fn writable_half(&self) -> &Rc<WritableHalf<W>> {
        self.inner.writable_half()
    }
}

/// Transform that forwards every chunk unchanged
pub struct PassThrough<T: Payload>(Transform<T, T>);

impl<T: Payload> Clone for PassThrough<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Payload> PassThrough<T> {
    pub fn new(rt: &EventLoop, options: StreamOptions) -> Self {
        Self(Transform::with_kind(
            rt,
            StreamKind::PassThrough,
            options,
            Box::new(Identity),
        ))
    }
}

impl<T: Payload> Stream for PassThrough<T> {
    fn core(&self) -> &Rc<StreamCore> {
        self.0.core()
    }

    fn off(&self, id: ListenerId) -> bool {
        self.0.off(id)
    }
}

impl<T: Payload> ReadableStream for PassThrough<T> {
    type Output = T;

    fn readable_half(&self) -> &Rc<ReadableHalf<T>> {
        self.0.readable_half()
    }
}

impl<T: Payload> WritableStream for PassThrough<T> {
    type Input = T;

    fn writable_half(&self) -> &Rc<WritableHalf<T>> {
        self.0.writable_half()
    }
}
