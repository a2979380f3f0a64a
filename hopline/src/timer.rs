//! Scheduled-event heap.
//!
//! A binary min-heap of `(deadline, insertion-sequence)` entries. Cancelling
//! a timer only flips a shared flag; the entry stays in the heap and is
//! skipped when it surfaces, so cancellation never pays for a heap rebuild.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Instant;

/// Handle for a scheduled callback. Dropping the handle does not cancel the
/// timer; call [`delete`](TimeoutHandle::delete).
#[derive(Clone)]
pub struct TimeoutHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimeoutHandle {
    /// Cancel the timer. The callback is guaranteed never to fire afterwards.
    /// Calling `delete` more than once is harmless.
    pub fn delete(&self) {
        if !self.cancelled.get() {
            self.cancelled.set(true);
            crate::metrics::TIMERS_CANCELLED.increment();
        }
    }

    /// Whether this timer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    callback: Option<Box<dyn FnOnce()>>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline (then the
// earliest insertion) surfaces first. Same-deadline timers fire in insertion
// order.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
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
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A timer popped from the heap, ready to run.
pub(crate) struct ExpiredTimer {
    cancelled: Rc<Cell<bool>>,
    callback: Box<dyn FnOnce()>,
}

impl ExpiredTimer {
    pub fn run(self) {
        if self.cancelled.get() {
            return;
        }
        crate::metrics::TIMERS_FIRED.increment();
        (self.callback)();
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, callback: Box<dyn FnOnce()>) -> TimeoutHandle {
        let cancelled = Rc::new(Cell::new(false));
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(TimerEntry {
            at,
            seq,
            cancelled: cancelled.clone(),
            callback: Some(callback),
        });
        crate::metrics::TIMERS_SCHEDULED.increment();
        TimeoutHandle { cancelled }
    }

    /// Deadline of the next live timer, discarding cancelled entries along
    /// the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if entry.cancelled.get() {
                self.heap.pop();
                continue;
            }
            return Some(entry.at);
        }
        None
    }

    /// Pop the next timer whose deadline is at or before `now`, if any.
    /// The caller runs it via [`ExpiredTimer::run`], which re-checks
    /// cancellation so a timer deleted by an earlier callback in the same
    /// batch never fires.
    pub fn pop_expired(&mut self, now: Instant) -> Option<ExpiredTimer> {
        while let Some(entry) = self.heap.peek() {
            if entry.cancelled.get() {
                self.heap.pop();
                continue;
            }
            if entry.at > now {
                return None;
            }
            let mut entry = self.heap.pop()?;
            let callback = entry.callback.take()?;
            return Some(ExpiredTimer {
                cancelled: entry.cancelled,
                callback,
            });
        }
        None
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    fn record(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Box<dyn FnOnce()> {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));

        heap.schedule(now + Duration::from_millis(20), record(&log, 2));
        heap.schedule(now + Duration::from_millis(10), record(&log, 1));
        heap.schedule(now + Duration::from_millis(30), record(&log, 3));

        let later = now + Duration::from_millis(50);
        while let Some(timer) = heap.pop_expired(later) {
            timer.run();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let at = Instant::now() + Duration::from_millis(5);
        let log = Rc::new(RefCell::new(Vec::new()));

        for n in 0..4 {
            heap.schedule(at, record(&log, n));
        }

        while let Some(timer) = heap.pop_expired(at) {
            timer.run();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn deleted_timer_never_fires() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = heap.schedule(now, record(&log, 1));
        heap.schedule(now, record(&log, 2));
        handle.delete();

        while let Some(timer) = heap.pop_expired(now) {
            timer.run();
        }
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn unexpired_timers_stay_queued() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));

        heap.schedule(now + Duration::from_secs(60), record(&log, 1));
        assert!(heap.pop_expired(now).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn cancelled_entries_are_skipped_for_deadlines() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();

        let near = heap.schedule(now + Duration::from_millis(1), Box::new(|| {}));
        heap.schedule(now + Duration::from_millis(100), Box::new(|| {}));
        near.delete();

        let deadline = heap.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(100));
    }
}
