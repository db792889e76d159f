//! Readable → writable piping with backpressure
//!
//! A pipe edge subscribes to the source's `data` and forwards each chunk to
//! the destination. A `false` write pauses the source until the destination
//! drains. With several destinations the source stays paused while any of
//! them is waiting for `drain`.
//!
//! While an edge is attached the source and the destination own each other,
//! so a pipe keeps running after the caller dropped both handles.

use crate::stream::{Payload, ReadableHalf, ReadableStream, StreamId, WritableStream};
use std::{
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

/// Global pipe edge counter
static EDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Options for [`ReadableStream::pipe_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// End the destination when the source ends (default: true)
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// One source → destination subscription, owned by the source
pub(crate) struct PipeEdge {
    id: u64,
    dest: StreamId,
    cleanup: Box<dyn FnOnce()>,
}

pub(crate) fn pipe<S, D>(src: &S, dest: &D, options: PipeOptions) -> D
where
    S: ReadableStream,
    D: WritableStream<Input = S::Output>,
    S::Output: Clone,
{
    let half = src.readable_half().clone();
    let src_core = src.core().clone();
    let dest_core = dest.core().clone();
    let edge_id = EDGE_ID.fetch_add(1, Ordering::Relaxed);
    let src_id = src.id();
    let dest_id = dest.id();
    tracing::debug!(src = %src_id, dest = %dest_id, end = options.end, "pipe");

    let weak = Rc::downgrade(&half);
    let target = dest.clone();
    let data_id = half.subscribe_data(move |chunk| match target.write(chunk.clone()) {
        Ok(true) => {}
        Ok(false) => {
            if let Some(half) = weak.upgrade() {
                half.pipe_wait(edge_id);
            }
        }
        Err(err) => {
            tracing::debug!(src = %src_id, dest = %dest_id, "pipe write rejected: {}", err);
            detach_weak(&weak, edge_id);
        }
    });

    let weak = Rc::downgrade(&half);
    let target = dest.clone();
    let on_src_end = move || {
        if options.end {
            if let Err(err) = target.end() {
                tracing::trace!(src = %src_id, dest = %dest_id, "pipe could not end destination: {}", err);
            }
        } else {
            detach_weak(&weak, edge_id);
        }
    };
    let end_id = if src.is_readable_ended() {
        src.event_loop().next_tick(on_src_end);
        None
    } else {
        Some(src_core.on_end.once(move |_| on_src_end()))
    };

    let source = half.clone();
    let drain_id = dest.on_drain(move || {
        if source.pipe_drained(edge_id) {
            source.resume();
        }
    });

    let weak = Rc::downgrade(&half);
    let weak_dest = Rc::downgrade(&dest_core);
    let error_id = dest_core.on_error.on(move |err| {
        detach_weak(&weak, edge_id);
        // The pipe's own listener does not count as handling the error
        if let Some(core) = weak_dest.upgrade() {
            if core.on_error.listener_count() == 0 {
                core.event_loop().report_unhandled(err.clone());
            }
        }
    });

    let weak = Rc::downgrade(&half);
    let dest_close_id = dest_core.on_terminated.once(move |_| detach_weak(&weak, edge_id));
    let weak = Rc::downgrade(&half);
    let dest_finish_id = dest_core.on_finish.once(move |_| detach_weak(&weak, edge_id));
    let weak = Rc::downgrade(&half);
    let src_close_id = src_core.on_terminated.once(move |_| detach_weak(&weak, edge_id));

    let weak = Rc::downgrade(&half);
    let weak_src = Rc::downgrade(&src_core);
    let target = dest.clone();
    let cleanup = move || {
        if let Some(half) = weak.upgrade() {
            half.off(data_id);
        }
        if let Some(core) = weak_src.upgrade() {
            if let Some(id) = end_id {
                core.on_end.off(id);
            }
            core.on_terminated.off(src_close_id);
        }
        let core = target.core();
        core.on_error.off(error_id);
        core.on_terminated.off(dest_close_id);
        core.on_finish.off(dest_finish_id);
        target.writable_half().off(drain_id);

        tracing::debug!(src = %src_id, dest = %dest_id, "unpipe");
        target.writable_half().unpipe.emit(&src_id);
    };

    half.pipes.borrow_mut().push(PipeEdge {
        id: edge_id,
        dest: dest_id,
        cleanup: Box::new(cleanup),
    });
    dest.writable_half().pipe.emit(&src_id);

    if dest.writable_need_drain() {
        half.pipe_wait(edge_id);
    } else if src.readable_flowing() != Some(true) {
        half.resume();
    }

    dest.clone()
}

fn detach_weak<R: Payload>(half: &Weak<ReadableHalf<R>>, edge_id: u64) {
    if let Some(half) = half.upgrade() {
        detach(&half, edge_id);
    }
}

/// Remove one edge and undo its subscriptions
fn detach<R: Payload>(half: &Rc<ReadableHalf<R>>, edge_id: u64) -> bool {
    let (edge, remaining) = {
        let mut pipes = half.pipes.borrow_mut();
        let Some(pos) = pipes.iter().position(|edge| edge.id == edge_id) else {
            return false;
        };
        let edge = pipes.remove(pos);
        (edge, pipes.len())
    };

    let drained = half.pipe_drained(edge_id);
    if remaining == 0 {
        half.pause();
    } else if drained {
        half.resume();
    }

    (edge.cleanup)();
    true
}

/// Detach the edge to `dest`, or every edge when `dest` is `None`
pub(crate) fn unpipe<R: Payload>(half: &Rc<ReadableHalf<R>>, dest: Option<StreamId>) -> bool {
    let edges: Vec<u64> = half
        .pipes
        .borrow()
        .iter()
        .filter(|edge| dest.is_none_or(|id| edge.dest == id))
        .map(|edge| edge.id)
        .collect();

    let mut detached = false;
    for edge in edges {
        detached |= detach(half, edge);
    }
    detached
}
