//! Typed notification registry
//!
//! Each notification kind of a stream owns one [`Emitter`]: an ordered list of
//! listeners invoked in registration order. Registration hands out a
//! [`ListenerId`] used to unregister; `once` listeners deregister themselves
//! before they are invoked.

use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

/// Global listener ID counter
static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Token identifying one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct Listener<A: ?Sized> {
    id: ListenerId,
    once: bool,
    callback: Rc<dyn Fn(&A)>,
}

impl<A: ?Sized> Clone for Listener<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: self.callback.clone(),
        }
    }
}

/// Listener list for a single notification kind carrying an `A`
pub struct Emitter<A: ?Sized> {
    listeners: RefCell<Vec<Listener<A>>>,
}

impl<A: ?Sized> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized> fmt::Debug for Emitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl<A: ?Sized> Emitter<A> {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
        }
    }

    fn add(&self, once: bool, callback: Rc<dyn Fn(&A)>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.borrow_mut().push(Listener { id, once, callback });
        id
    }

    /// Register a listener invoked on every emission
    pub fn on(&self, callback: impl Fn(&A) + 'static) -> ListenerId {
        self.add(false, Rc::new(callback))
    }

    /// Register a listener invoked on the next emission only
    pub fn once(&self, callback: impl Fn(&A) + 'static) -> ListenerId {
        self.add(true, Rc::new(callback))
    }

    /// Remove a listener; returns whether it was registered here
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }

    /// Invoke the listeners registered at the time of the call, in order.
    ///
    /// Listeners removed by an earlier listener during the same emission are
    /// skipped; listeners added during the emission are not invoked.
    /// Returns whether there was any listener.
    pub fn emit(&self, arg: &A) -> bool {
        let snapshot: Vec<Listener<A>> = self.listeners.borrow().clone();
        if snapshot.is_empty() {
            return false;
        }

        for listener in snapshot {
            let live = {
                let mut listeners = self.listeners.borrow_mut();
                match listeners.iter().position(|registered| registered.id == listener.id) {
                    Some(pos) if listener.once => {
                        listeners.remove(pos);
                        true
                    }
                    Some(_) => true,
                    None => false,
                }
            };
            if live {
                (listener.callback)(arg);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_registration_order() {
        let emitter: Emitter<u32> = Emitter::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = log.clone();
            emitter.on(move |v| log.borrow_mut().push(format!("{tag}{v}")));
        }

        assert!(emitter.emit(&1));
        assert_eq!(*log.borrow(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_once_and_off() {
        let emitter: Emitter<()> = Emitter::new();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        emitter.once(move |_| c.set(c.get() + 1));
        let c = count.clone();
        let id = emitter.on(move |_| c.set(c.get() + 10));

        emitter.emit(&());
        emitter.emit(&());
        assert_eq!(count.get(), 21);

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        assert!(!emitter.emit(&()));
        assert_eq!(count.get(), 21);
    }

    #[test]
    fn test_removal_during_emit() {
        let emitter: Rc<Emitter<()>> = Rc::new(Emitter::new());
        let second_called = Rc::new(Cell::new(false));
        let second = Rc::new(Cell::new(None));

        let e = emitter.clone();
        let s = second.clone();
        emitter.on(move |_| {
            if let Some(id) = s.get() {
                e.off(id);
            }
        });
        let called = second_called.clone();
        second.set(Some(emitter.on(move |_| called.set(true))));

        emitter.emit(&());
        assert!(!second_called.get());
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_once_removed_during_emit() {
        let emitter: Rc<Emitter<()>> = Rc::new(Emitter::new());
        let fired = Rc::new(Cell::new(false));
        let target = Rc::new(Cell::new(None));

        let e = emitter.clone();
        let t = target.clone();
        emitter.on(move |_| {
            if let Some(id) = t.get() {
                assert!(e.off(id));
            }
        });
        let f = fired.clone();
        target.set(Some(emitter.once(move |_| f.set(true))));

        emitter.emit(&());
        assert!(!fired.get());
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_once_fires_once_on_nested_emit() {
        let emitter: Rc<Emitter<u32>> = Rc::new(Emitter::new());
        let count = Rc::new(Cell::new(0));

        let e = emitter.clone();
        emitter.on(move |depth| {
            if *depth == 0 {
                e.emit(&1);
            }
        });
        let c = count.clone();
        emitter.once(move |_| c.set(c.get() + 1));

        emitter.emit(&0);
        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count(), 1);
    }
}
