//! Cooperative event loop driving every stream callback
//!
//! All stream work runs on one logical task queue:
//! - Microtasks (`next_tick`) - processed first, in FIFO order
//! - Timers (`set_timeout`) - a min-heap keyed by virtual deadline
//!
//! Timers run on a virtual clock: when only timers are pending the clock jumps
//! to the earliest deadline instead of sleeping, which keeps scheduling
//! deterministic.

use super::{RuntimeError, RuntimeResult};
use crate::error::StreamError;
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, HashSet, VecDeque},
    rc::Rc,
    time::Duration,
};

type Task = Box<dyn FnOnce()>;

/// Handle returned by [`EventLoop::set_timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A timer entry in the priority queue
struct TimerEntry {
    /// When this timer should fire
    deadline: Duration,
    /// Unique ID for ordering timers with same deadline
    id: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct LoopInner {
    /// Queue of microtasks - processed before any timer
    microtasks: RefCell<VecDeque<Task>>,
    /// Priority queue of timers (min-heap by deadline)
    timers: RefCell<BinaryHeap<TimerEntry>>,
    cancelled: RefCell<HashSet<u64>>,
    /// Counter for unique timer IDs
    timer_counter: Cell<u64>,
    /// Virtual clock
    now: Cell<Duration>,
    running: Cell<bool>,
    /// Stream errors nobody listened for
    unhandled: RefCell<VecDeque<StreamError>>,
}

/// Single-threaded task queue shared by a group of streams.
///
/// Cloning is cheap and yields a handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create a new event loop
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner {
                microtasks: RefCell::new(VecDeque::with_capacity(64)),
                timers: RefCell::new(BinaryHeap::with_capacity(32)),
                cancelled: RefCell::new(HashSet::new()),
                timer_counter: Cell::new(0),
                now: Cell::new(Duration::ZERO),
                running: Cell::new(false),
                unhandled: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Queue a task to run after the current one, before any timer
    pub fn next_tick(&self, task: impl FnOnce() + 'static) {
        self.inner.microtasks.borrow_mut().push_back(Box::new(task));
    }

    /// Queue a task to run once the virtual clock has advanced by `delay`
    pub fn set_timeout(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        let id = self.inner.timer_counter.get() + 1;
        self.inner.timer_counter.set(id);
        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline: self.inner.now.get() + delay,
            id,
            task: Box::new(task),
        });
        TimerId(id)
    }

    /// Cancel a pending timer; cancelling a fired timer has no effect
    pub fn clear_timeout(&self, timer: TimerId) {
        let pending = self.inner.timers.borrow().iter().any(|entry| entry.id == timer.0);
        if pending {
            self.inner.cancelled.borrow_mut().insert(timer.0);
        }
    }

    /// Current virtual time since the loop was created
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    /// Check if there's any pending work
    pub fn has_pending_work(&self) -> bool {
        !self.inner.microtasks.borrow().is_empty()
            || self.inner.timers.borrow().len() > self.inner.cancelled.borrow().len()
    }

    /// Get time until next timer fires
    pub fn time_until_next_timer(&self) -> Option<Duration> {
        let now = self.inner.now.get();
        self.inner
            .timers
            .borrow()
            .peek()
            .map(|entry| entry.deadline.saturating_sub(now))
    }

    /// Whether [`EventLoop::run`] is currently executing
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Record a stream error that no listener handled
    pub(crate) fn report_unhandled(&self, err: StreamError) {
        tracing::error!("Unhandled stream error: {}", err);
        self.inner.unhandled.borrow_mut().push_back(err);
    }

    /// Pop the next runnable task, advancing the clock for timers
    fn next_task(&self) -> Option<Task> {
        // Phase 1: microtasks (highest priority)
        if let Some(task) = self.inner.microtasks.borrow_mut().pop_front() {
            return Some(task);
        }

        // Phase 2: earliest live timer
        loop {
            let entry = self.inner.timers.borrow_mut().pop()?;
            if self.inner.cancelled.borrow_mut().remove(&entry.id) {
                continue;
            }
            if entry.deadline > self.inner.now.get() {
                self.inner.now.set(entry.deadline);
            }
            return Some(entry.task);
        }
    }

    /// Run one task. Returns false when there was nothing to run.
    pub fn run_once(&self) -> bool {
        match self.next_task() {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run the event loop until all work is complete.
    ///
    /// Stops with [`RuntimeError::UnhandledError`] as soon as a stream emits
    /// `error` without any listener; remaining tasks stay queued.
    pub fn run(&self) -> RuntimeResult<()> {
        if self.inner.running.replace(true) {
            return Err(RuntimeError::Reentrant);
        }

        let result = loop {
            if let Some(err) = self.inner.unhandled.borrow_mut().pop_front() {
                break Err(RuntimeError::UnhandledError(err));
            }
            if !self.run_once() {
                break Ok(());
            }
        };

        self.inner.running.set(false);
        result
    }
}
