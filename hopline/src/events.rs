//! Typed event dispatch.
//!
//! Every emitter in hopline exposes one [`Event`] per event kind, with the
//! listener signature tied to that kind. Dispatch is synchronous and
//! in-order over a snapshot of the listener list, so a listener may add or
//! remove subscriptions (including itself) without invalidating the current
//! emission. When no listeners are registered, an optional fallback sink
//! receives the event instead.

use std::cell::RefCell;
use std::rc::Rc;

/// Token returned by [`Event::on`] / [`Event::once`], used to remove the
/// listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Callback<A> = Rc<RefCell<dyn FnMut(A)>>;

struct Entry<A> {
    id: u64,
    once: bool,
    callback: Callback<A>,
}

struct Inner<A> {
    next_id: u64,
    entries: Vec<Entry<A>>,
    fallback: Option<Callback<A>>,
}

/// A single-threaded listener list for one event kind.
///
/// `A` is the event payload; multi-argument events use a tuple. Payloads are
/// cloned per listener, so they should be cheap to clone (`Bytes`, small
/// structs).
pub struct Event<A> {
    inner: RefCell<Inner<A>>,
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Event<A> {
    pub fn new() -> Self {
        Event {
            inner: RefCell::new(Inner {
                next_id: 1,
                entries: Vec::new(),
                fallback: None,
            }),
        }
    }

    /// Remove a listener. A listener removed while an emission is in flight
    /// still receives that emission (snapshot semantics).
    pub fn remove(&self, id: ListenerId) {
        self.inner.borrow_mut().entries.retain(|e| e.id != id.0);
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.borrow_mut().entries.clear();
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.borrow().entries.is_empty()
    }
}

impl<A: Clone> Event<A> {
    /// Call `listener` every time the event is emitted.
    pub fn on(&self, listener: impl FnMut(A) + 'static) -> ListenerId {
        self.add(false, listener)
    }

    /// Call `listener` the first time the event is emitted, then drop it.
    pub fn once(&self, listener: impl FnOnce(A) + 'static) -> ListenerId {
        let mut slot = Some(listener);
        self.add(true, move |args| {
            if let Some(f) = slot.take() {
                f(args);
            }
        })
    }

    /// Install the fallback sink, invoked only when an emission finds no
    /// registered listeners.
    pub fn set_fallback(&self, sink: impl FnMut(A) + 'static) {
        self.inner.borrow_mut().fallback = Some(Rc::new(RefCell::new(sink)));
    }

    /// Emit the event to the current listener list.
    pub fn emit(&self, args: A) {
        let snapshot: Vec<(u64, bool, Callback<A>)> = {
            let inner = self.inner.borrow();
            inner
                .entries
                .iter()
                .map(|e| (e.id, e.once, e.callback.clone()))
                .collect()
        };

        if snapshot.is_empty() {
            let fallback = self.inner.borrow().fallback.clone();
            if let Some(cb) = fallback {
                (cb.borrow_mut())(args);
            }
            return;
        }

        for (id, once, callback) in snapshot {
            if once {
                // Removed before invocation so a reentrant emit cannot fire
                // the listener twice.
                self.remove(ListenerId(id));
            }
            (callback.borrow_mut())(args.clone());
        }
    }

    fn add(&self, once: bool, listener: impl FnMut(A) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            once,
            callback: Rc::new(RefCell::new(listener)),
        });
        ListenerId(id)
    }
}
