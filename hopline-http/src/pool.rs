//! The idle-connection pool.
//!
//! A mapping from origin key to a FIFO queue of idle streams. Every idle
//! stream carries an arming idle-timer and a pair of watchdog listeners:
//! a peer close removes it from the pool, and any data arriving while
//! idle is fatal to reuse (the stream is evicted and closed). Checkout
//! cancels the timer and detaches the watchdogs before handing the
//! stream over.
//!
//! Discipline: every checkout is paired with either a checkin (clean
//! return) or a discard; a stream is in at most one place at any time —
//! pool, exchange, or closed.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use hopline::{ListenerId, Loop, Stream, TimeoutHandle};
use log::{debug, trace};

use crate::metrics;
use crate::uri::Origin;

pub(crate) type SharedPool = Rc<RefCell<Pool>>;

struct IdleEntry {
    stream: Rc<dyn Stream>,
    idle_timer: Option<TimeoutHandle>,
    data_id: ListenerId,
    close_id: ListenerId,
}

#[derive(Default)]
pub(crate) struct Pool {
    idle: HashMap<Origin, VecDeque<IdleEntry>>,
    /// Connections currently open per origin (idle or checked out).
    counts: HashMap<Origin, usize>,
}

impl Pool {
    pub fn new() -> SharedPool {
        Rc::new(RefCell::new(Pool::default()))
    }

    /// Record a freshly dialed connection for `origin`.
    pub fn note_dial(pool: &SharedPool, origin: &Origin) {
        *pool.borrow_mut().counts.entry(origin.clone()).or_insert(0) += 1;
    }

    /// Record that a connection for `origin` is gone.
    pub fn note_dead(pool: &SharedPool, origin: &Origin) {
        let mut pool = pool.borrow_mut();
        if let Some(count) = pool.counts.get_mut(origin) {
            *count = count.saturating_sub(1);
        }
    }

    /// Open connections for `origin` (idle and checked out).
    pub fn count(pool: &SharedPool, origin: &Origin) -> usize {
        pool.borrow().counts.get(origin).copied().unwrap_or(0)
    }

    /// Idle connections across all origins.
    pub fn idle_total(pool: &SharedPool) -> usize {
        pool.borrow().idle.values().map(VecDeque::len).sum()
    }

    /// Take the oldest healthy idle stream for `origin`, if any.
    pub fn checkout(pool: &SharedPool, origin: &Origin) -> Option<Rc<dyn Stream>> {
        loop {
            let entry = pool.borrow_mut().idle.get_mut(origin)?.pop_front()?;
            if let Some(timer) = entry.idle_timer {
                timer.delete();
            }
            entry.stream.remove_data_listener(entry.data_id);
            entry.stream.remove_close_listener(entry.close_id);
            if entry.stream.is_connected() {
                // Back to the constructed contract: paused until the next
                // user attaches listeners and resumes.
                entry.stream.pause(true);
                metrics::POOL_CHECKOUTS.increment();
                trace!("pool checkout for {origin}");
                return Some(entry.stream);
            }
            // Raced with a close; drop it and keep looking.
            Pool::note_dead(pool, origin);
        }
    }

    /// Return a clean stream to the pool. With pooling disabled
    /// (`idle_timeout` of `None`) the stream is closed instead.
    pub fn checkin(
        pool: &SharedPool,
        lp: &Loop,
        origin: Origin,
        stream: Rc<dyn Stream>,
        idle_timeout: Option<Duration>,
    ) {
        let Some(idle_timeout) = idle_timeout else {
            stream.close();
            Pool::note_dead(pool, &origin);
            return;
        };

        let close_id = {
            let pool = Rc::downgrade(pool);
            let origin = origin.clone();
            let target = Rc::downgrade(&stream);
            stream.on_close(Box::new(move |reason| {
                if let (Some(pool), Some(target)) = (pool.upgrade(), target.upgrade()) {
                    if Pool::evict(&pool, &origin, &target) {
                        metrics::POOL_EVICTIONS.increment();
                        match reason {
                            Some(err) => {
                                debug!("idle connection to {origin} failed: {err}");
                            }
                            None => debug!("idle connection to {origin} closed by peer"),
                        }
                    }
                }
            }))
        };
        let data_id = {
            let pool = Rc::downgrade(pool);
            let origin = origin.clone();
            let target = Rc::downgrade(&stream);
            stream.on_data(Box::new(move |_chunk| {
                // Unsolicited bytes on an idle connection; it can never be
                // reused safely.
                if let (Some(pool), Some(target)) = (pool.upgrade(), target.upgrade()) {
                    if Pool::evict(&pool, &origin, &target) {
                        metrics::POOL_EVICTIONS.increment();
                        debug!("unsolicited data on idle connection to {origin}");
                    }
                    target.close();
                }
            }))
        };
        let idle_timer = {
            let target = Rc::downgrade(&stream);
            lp.schedule(idle_timeout, move || {
                if let Some(target) = target.upgrade() {
                    metrics::POOL_EXPIRATIONS.increment();
                    target.close();
                }
            })
        };

        metrics::POOL_CHECKINS.increment();
        // Keep the read side open while idle: a peer close must surface
        // promptly, and any bytes that do arrive hit the watchdog above.
        stream.pause(false);
        pool.borrow_mut()
            .idle
            .entry(origin)
            .or_default()
            .push_back(IdleEntry {
                stream,
                idle_timer: Some(idle_timer),
                data_id,
                close_id,
            });
    }

    /// Remove `target` from the idle queue for `origin`. Returns whether
    /// it was present.
    fn evict(pool: &SharedPool, origin: &Origin, target: &Rc<dyn Stream>) -> bool {
        let entry = {
            let mut pool = pool.borrow_mut();
            let Some(queue) = pool.idle.get_mut(origin) else {
                return false;
            };
            let Some(pos) = queue
                .iter()
                .position(|e| Rc::ptr_eq(&e.stream, target))
            else {
                return false;
            };
            queue.remove(pos)
        };
        let Some(entry) = entry else { return false };
        if let Some(timer) = entry.idle_timer {
            timer.delete();
        }
        entry.stream.remove_data_listener(entry.data_id);
        entry.stream.remove_close_listener(entry.close_id);
        Pool::note_dead(pool, origin);
        true
    }

    /// Close every idle connection (loop shutdown).
    pub fn close_idle(pool: &SharedPool) {
        let entries: Vec<(Origin, IdleEntry)> = {
            let mut pool = pool.borrow_mut();
            let mut out = Vec::new();
            for (origin, queue) in pool.idle.drain() {
                for entry in queue {
                    out.push((origin.clone(), entry));
                }
            }
            out
        };
        for (origin, entry) in entries {
            if let Some(timer) = entry.idle_timer {
                timer.delete();
            }
            entry.stream.remove_data_listener(entry.data_id);
            entry.stream.remove_close_listener(entry.close_id);
            entry.stream.close();
            Pool::note_dead(pool, &origin);
        }
    }
}
