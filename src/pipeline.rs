//! Supervised pipelines and end-of-stream detection
//!
//! - [`finished`] - one-shot notification when a stream is done
//! - [`Pipeline`] - a chain of pipes torn down as a unit on the first failure

use crate::error::{StreamError, StreamResult};
use crate::pipe::PipeOptions;
use crate::runtime::ListenerId;
use crate::stream::{ReadableStream, Side, Stream, StreamCore, WritableStream};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

type Callback = Box<dyn FnOnce(StreamResult<()>)>;

/// Which sides [`finished_with`] waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedOptions {
    pub readable: bool,
    pub writable: bool,
}

impl Default for FinishedOptions {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }
}

struct Watch {
    core: Weak<StreamCore>,
    listeners: RefCell<Vec<ListenerId>>,
    callback: RefCell<Option<Callback>>,
    readable: bool,
    writable: bool,
}

impl Watch {
    fn sides_done(&self, core: &StreamCore) -> bool {
        (!self.readable || core.readable_side() == Side::Done)
            && (!self.writable || core.writable_side() == Side::Done)
    }

    fn detach(&self) {
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        if let Some(core) = self.core.upgrade() {
            for id in listeners {
                core.off(id);
            }
        }
    }

    fn settle(&self, result: StreamResult<()>) {
        let callback = self.callback.borrow_mut().take();
        self.detach();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn on_closed(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let result = match core.errored() {
            Some(err) => Err(err),
            None if self.sides_done(&core) => Ok(()),
            None => Err(StreamError::PrematureClose),
        };
        self.settle(result);
    }
}

/// Handle returned by [`finished`]; drops the callback when disposed
pub struct Cleanup {
    watch: Rc<Watch>,
}

impl Cleanup {
    /// Deregister the callback. Idempotent.
    pub fn dispose(&self) {
        self.watch.callback.borrow_mut().take();
        self.watch.detach();
    }

    /// Whether the callback has neither fired nor been disposed
    pub fn is_pending(&self) -> bool {
        self.watch.callback.borrow().is_some()
    }
}

/// Call `callback` once the stream ended and finished, failed, or closed early
pub fn finished<S: Stream>(
    stream: &S,
    callback: impl FnOnce(StreamResult<()>) + 'static,
) -> Cleanup {
    finished_with(stream, FinishedOptions::default(), callback)
}

pub fn finished_with<S: Stream>(
    stream: &S,
    options: FinishedOptions,
    callback: impl FnOnce(StreamResult<()>) + 'static,
) -> Cleanup {
    watch(stream.core(), options, Box::new(callback))
}

fn watch(core: &Rc<StreamCore>, options: FinishedOptions, callback: Callback) -> Cleanup {
    let kind = core.capabilities().kind;
    let watch = Rc::new(Watch {
        core: Rc::downgrade(core),
        listeners: RefCell::new(Vec::new()),
        callback: RefCell::new(Some(callback)),
        readable: options.readable && kind.is_readable(),
        writable: options.writable && kind.is_writable(),
    });

    if core.is_closed() || watch.sides_done(core) {
        let w = watch.clone();
        core.event_loop().next_tick(move || {
            if w.core.upgrade().is_some_and(|core| core.is_closed()) {
                w.on_closed();
            } else {
                w.settle(Ok(()));
            }
        });
        return Cleanup { watch };
    }

    let mut ids = Vec::with_capacity(4);

    let w = watch.clone();
    ids.push(core.on_error.on(move |err| w.settle(Err(err.clone()))));

    let w = watch.clone();
    ids.push(core.on_terminated.on(move |_| w.on_closed()));

    for emitter in [&core.on_end, &core.on_finish] {
        let w = watch.clone();
        ids.push(emitter.on(move |_| {
            let done = w.core.upgrade().is_some_and(|core| w.sides_done(&core));
            if done {
                w.settle(Ok(()));
            }
        }));
    }

    *watch.listeners.borrow_mut() = ids;
    Cleanup { watch }
}

struct Supervisor {
    stages: Vec<Rc<StreamCore>>,
    /// Stream handles owned until the pipeline settles
    handles: RefCell<Vec<Box<dyn Any>>>,
    done: Cell<bool>,
    callback: RefCell<Option<Callback>>,
    watches: RefCell<Vec<Cleanup>>,
}

impl Supervisor {
    /// Drop the stage watches and report `result`
    fn complete(&self, result: StreamResult<()>) {
        let watches = std::mem::take(&mut *self.watches.borrow_mut());
        for watch in watches {
            watch.dispose();
        }
        let callback = self.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(result);
        }

        // Released on the next tick, after the settling stage ran its teardown
        let handles = std::mem::take(&mut *self.handles.borrow_mut());
        if let Some(core) = self.stages.first() {
            core.event_loop().next_tick(move || drop(handles));
        }
    }

    /// Destroy every stage with `err`; the pipeline callback handles the error
    fn teardown(&self, err: &StreamError) {
        for core in &self.stages {
            if !core.is_closed() {
                core.on_error.once(|_| {});
            }
            core.destroy(Some(err.clone()));
        }
    }

    fn stage_done(&self, stage: usize, result: StreamResult<()>) {
        if self.done.get() {
            return;
        }
        match result {
            Ok(()) if stage + 1 == self.stages.len() => {
                self.done.set(true);
                tracing::debug!(stages = self.stages.len(), "pipeline finished");
                self.complete(Ok(()));
            }
            Ok(()) => {}
            Err(err) => {
                self.done.set(true);
                let err = StreamError::Pipeline {
                    stage,
                    source: Box::new(err),
                };
                tracing::debug!(stage, "pipeline failed, destroying all stages: {}", err);
                self.teardown(&err);
                self.complete(Err(err));
            }
        }
    }
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    supervisor: Rc<Supervisor>,
}

impl PipelineHandle {
    /// Destroy every stage and report [`StreamError::Aborted`]
    pub fn abort(&self) {
        let sup = &self.supervisor;
        if sup.done.replace(true) {
            return;
        }
        tracing::debug!("pipeline aborted");
        sup.teardown(&StreamError::Aborted);
        sup.complete(Err(StreamError::Aborted));
    }

    /// Whether the completion callback already fired
    pub fn is_done(&self) -> bool {
        self.supervisor.done.get()
    }
}

/// Builder for a chain `src → stage → ... → sink`.
///
/// Nothing is connected until [`Pipeline::finish`].
pub struct Pipeline<S: ReadableStream> {
    tail: S,
    stages: Vec<Rc<StreamCore>>,
    handles: Vec<Box<dyn Any>>,
    links: Vec<Box<dyn FnOnce()>>,
}

impl<S> Pipeline<S>
where
    S: ReadableStream,
    S::Output: Clone,
{
    pub fn new(src: S) -> Self {
        Self {
            stages: vec![src.core().clone()],
            handles: vec![Box::new(src.clone()) as Box<dyn Any>],
            tail: src,
            links: Vec::new(),
        }
    }

    /// Append an intermediate stage
    pub fn pipe<T>(mut self, stage: T) -> Pipeline<T>
    where
        T: ReadableStream + WritableStream<Input = S::Output>,
        T::Output: Clone,
    {
        self.stages.push(stage.core().clone());
        self.handles.push(Box::new(stage.clone()));
        self.links.push(link(&self.tail, &stage));
        Pipeline {
            tail: stage,
            stages: self.stages,
            handles: self.handles,
            links: self.links,
        }
    }

    /// Connect the final stage and start supervising.
    ///
    /// `callback` fires exactly once: `Ok` when `sink` finished, or the first
    /// stage failure wrapped in [`StreamError::Pipeline`].
    pub fn finish<D>(
        mut self,
        sink: D,
        callback: impl FnOnce(StreamResult<()>) + 'static,
    ) -> PipelineHandle
    where
        D: WritableStream<Input = S::Output>,
    {
        self.stages.push(sink.core().clone());
        self.links.push(link(&self.tail, &sink));
        self.handles.push(Box::new(sink));

        let supervisor = Rc::new(Supervisor {
            stages: self.stages,
            handles: RefCell::new(self.handles),
            done: Cell::new(false),
            callback: RefCell::new(Some(Box::new(callback))),
            watches: RefCell::new(Vec::new()),
        });
        tracing::debug!(stages = supervisor.stages.len(), "pipeline started");

        // Pipe listeners go first so a stage failure reaches them before the
        // supervisor tears the other stages down
        for link in self.links {
            link();
        }

        let last = supervisor.stages.len() - 1;
        let watches = supervisor
            .stages
            .iter()
            .enumerate()
            .map(|(stage, core)| {
                let options = FinishedOptions {
                    readable: stage < last,
                    writable: stage > 0,
                };
                let sup = supervisor.clone();
                let callback = Box::new(move |result| sup.stage_done(stage, result));
                watch(core, options, callback)
            })
            .collect();
        *supervisor.watches.borrow_mut() = watches;

        PipelineHandle { supervisor }
    }
}

fn link<S, D>(src: &S, dest: &D) -> Box<dyn FnOnce()>
where
    S: ReadableStream,
    D: WritableStream<Input = S::Output>,
    S::Output: Clone,
{
    let (src, dest) = (src.clone(), dest.clone());
    Box::new(move || {
        src.pipe_with(&dest, PipeOptions::default());
    })
}

/// Two-stage [`Pipeline`]
pub fn pipeline<S, D>(
    src: S,
    sink: D,
    callback: impl FnOnce(StreamResult<()>) + 'static,
) -> PipelineHandle
where
    S: ReadableStream,
    S::Output: Clone,
    D: WritableStream<Input = S::Output>,
{
    Pipeline::new(src).finish(sink, callback)
}
