//! The event loop.
//!
//! One [`Loop`] drives all I/O and time from a single thread. A tick
//! performs, in order: refresh the cached clock, fire expired timers, poll
//! the readiness backend with a timeout bounded by the next timer deadline
//! and the configured precision, then dispatch readiness to each fd's
//! registered sink.
//!
//! Registrations are keyed by fd and dropped on `unregister`, `stop`, or
//! connection close, so no reference cycle between the loop and a sink
//! survives a close. Dispatch walks a snapshot of the ready set and
//! re-validates each registration before every callback, so a sink may
//! unregister any fd (including its own) from within a callback.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::warn;

use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, ListenerId};
use crate::poller::{Interest, PollEvent, Poller};
use crate::timer::{TimeoutHandle, TimerHeap};

/// Receiver of readiness notifications for one registered fd.
///
/// Callbacks run on the loop thread and must not block; an operation that
/// would block should record interest and return. A panicking callback
/// unwinds through [`Loop::run`] and takes the whole loop down — there is
/// no per-callback isolation.
pub trait EventSink {
    fn on_readable(&self) {}
    fn on_writable(&self) {}
    /// The fd is in an error state.
    fn on_error(&self) {}
    /// The peer hung up.
    fn on_hangup(&self) {}
}

struct Registration {
    interest: Interest,
    sink: Rc<dyn EventSink>,
}

struct LoopInner {
    config: Config,
    poller: RefCell<Poller>,
    registrations: RefCell<HashMap<RawFd, Registration>>,
    timers: RefCell<TimerHeap>,
    now: Cell<Instant>,
    running: Cell<bool>,
    event_buf: RefCell<Vec<PollEvent>>,
    start_ev: Event<()>,
    stop_ev: Event<()>,
}

/// Handle to an event loop. Cloning is cheap and all clones refer to the
/// same loop. The handle is not `Send`; a loop lives and dies on one
/// thread.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl Loop {
    /// Create a loop with default configuration and the platform-default
    /// readiness backend.
    pub fn new() -> Result<Loop, Error> {
        Loop::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Loop, Error> {
        config.validate()?;
        let poller = Poller::new()?;
        Ok(Loop::from_parts(config, poller))
    }

    /// Create a loop on the portable poll(2) backend, regardless of
    /// platform.
    pub fn with_portable_backend(config: Config) -> Result<Loop, Error> {
        config.validate()?;
        Ok(Loop::from_parts(config, Poller::portable()))
    }

    fn from_parts(config: Config, poller: Poller) -> Loop {
        Loop {
            inner: Rc::new(LoopInner {
                config,
                poller: RefCell::new(poller),
                registrations: RefCell::new(HashMap::new()),
                timers: RefCell::new(TimerHeap::new()),
                now: Cell::new(Instant::now()),
                running: Cell::new(false),
                event_buf: RefCell::new(Vec::new()),
                start_ev: Event::new(),
                stop_ev: Event::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Name of the readiness backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.inner.poller.borrow().backend_name()
    }

    /// Whether [`run`](Loop::run) is currently driving ticks.
    pub fn running(&self) -> bool {
        self.inner.running.get()
    }

    /// The cached timestamp, refreshed once per tick. Precision-bounded;
    /// avoids a clock read per call.
    pub fn time(&self) -> Instant {
        self.inner.now.get()
    }

    /// Add or replace a registration for `fd`. Repeated identical calls are
    /// idempotent.
    pub fn register(&self, fd: RawFd, interest: Interest, sink: Rc<dyn EventSink>) {
        let mut regs = self.inner.registrations.borrow_mut();
        let result = if regs.contains_key(&fd) {
            self.inner.poller.borrow_mut().reregister(fd, interest)
        } else {
            self.inner.poller.borrow_mut().register(fd, interest)
        };
        if let Err(err) = result {
            warn!("failed to register fd {fd}: {err}");
            return;
        }
        regs.insert(fd, Registration { interest, sink });
    }

    /// Remove the registration for `fd`. No further events fire for it.
    /// Safe to call from within that fd's own sink; unknown fds are
    /// ignored.
    pub fn unregister(&self, fd: RawFd) {
        let removed = self.inner.registrations.borrow_mut().remove(&fd);
        if removed.is_some()
            && let Err(err) = self.inner.poller.borrow_mut().deregister(fd)
        {
            log::trace!("deregister fd {fd}: {err}");
        }
    }

    /// Change the watched events for `fd` without replacing its sink.
    pub fn update_interest(&self, fd: RawFd, interest: Interest) {
        let mut regs = self.inner.registrations.borrow_mut();
        let Some(reg) = regs.get_mut(&fd) else {
            return;
        };
        if reg.interest == interest {
            return;
        }
        reg.interest = interest;
        if let Err(err) = self.inner.poller.borrow_mut().reregister(fd, interest) {
            warn!("failed to update interest for fd {fd}: {err}");
        }
    }

    /// Run `callback` after `delay`. A zero delay fires on the next tick.
    /// The returned handle cancels the callback via
    /// [`delete`](TimeoutHandle::delete).
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimeoutHandle {
        let at = self.time() + delay;
        self.inner
            .timers
            .borrow_mut()
            .schedule(at, Box::new(callback))
    }

    /// Listen for the loop `start` event, emitted when [`run`](Loop::run)
    /// begins.
    pub fn on_start(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.start_ev.on(listener)
    }

    /// Listen for the loop `stop` event, emitted by [`stop`](Loop::stop).
    pub fn on_stop(&self, listener: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.stop_ev.on(listener)
    }

    pub fn remove_stop_listener(&self, id: ListenerId) {
        self.inner.stop_ev.remove(id);
    }

    /// Emit `start` and drive ticks until [`stop`](Loop::stop) is called.
    /// A readiness-backend failure is fatal and surfaces here.
    pub fn run(&self) -> Result<(), Error> {
        self.inner.running.set(true);
        self.inner.now.set(Instant::now());
        self.inner.start_ev.emit(());
        while self.inner.running.get() {
            self.tick()?;
        }
        Ok(())
    }

    /// Stop the loop: clear the registration map and the timer heap, then
    /// emit `stop`. Callable from within any callback.
    pub fn stop(&self) {
        self.inner.running.set(false);
        self.inner.timers.borrow_mut().clear();
        let fds: Vec<RawFd> = {
            let mut regs = self.inner.registrations.borrow_mut();
            let fds = regs.keys().copied().collect();
            regs.clear();
            fds
        };
        {
            let mut poller = self.inner.poller.borrow_mut();
            for fd in fds {
                let _ = poller.deregister(fd);
            }
        }
        self.inner.stop_ev.emit(());
    }

    fn tick(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.now.set(Instant::now());
        let now = inner.now.get();

        // All timers due this tick fire before any I/O dispatch. The batch
        // is collected first so a zero-delay timer scheduled from inside a
        // callback waits for the next tick; each entry re-checks its
        // cancelled flag, so deleting a later timer from an earlier one in
        // the same batch still wins.
        let mut due = Vec::new();
        {
            let mut timers = inner.timers.borrow_mut();
            while let Some(timer) = timers.pop_expired(now) {
                due.push(timer);
            }
        }
        for timer in due {
            if !inner.running.get() {
                return Ok(());
            }
            self.invoke(|| timer.run());
        }
        if !inner.running.get() {
            return Ok(());
        }

        let timeout = {
            let next = inner.timers.borrow_mut().next_deadline();
            match next {
                Some(deadline) => deadline
                    .saturating_duration_since(now)
                    .min(inner.config.precision),
                None => inner.config.precision,
            }
        };

        let mut events = {
            let mut buf = inner.event_buf.borrow_mut();
            std::mem::take(&mut *buf)
        };
        events.clear();
        inner
            .poller
            .borrow_mut()
            .wait(&mut events, inner.config.max_events, timeout)?;

        // The ready set is a snapshot; each dispatch re-validates the
        // registration so a callback unregistering another ready fd (or its
        // own) is safe.
        for event in &events {
            if !inner.running.get() {
                break;
            }
            let readiness = event.readiness;
            if readiness.readable {
                self.dispatch(event.fd, |sink| sink.on_readable());
            }
            if readiness.writable {
                self.dispatch(event.fd, |sink| sink.on_writable());
            }
            if readiness.hangup {
                self.dispatch(event.fd, |sink| sink.on_hangup());
            }
            if readiness.error {
                self.dispatch(event.fd, |sink| sink.on_error());
            }
        }

        *inner.event_buf.borrow_mut() = events;
        Ok(())
    }

    fn dispatch(&self, fd: RawFd, call: impl FnOnce(&dyn EventSink)) {
        let sink = {
            let regs = self.inner.registrations.borrow();
            regs.get(&fd).map(|reg| reg.sink.clone())
        };
        if let Some(sink) = sink {
            self.invoke(|| call(&*sink));
        }
    }

    fn invoke(&self, callback: impl FnOnce()) {
        if !self.inner.config.debug {
            callback();
            return;
        }
        let started = Instant::now();
        callback();
        let elapsed = started.elapsed();
        if elapsed > self.inner.config.slow_callback {
            warn!(
                "callback blocked the loop for {}ms (threshold {}ms)",
                elapsed.as_millis(),
                self.inner.config.slow_callback.as_millis()
            );
        }
    }
}

thread_local! {
    static DEFAULT_LOOP: RefCell<Option<Loop>> = const { RefCell::new(None) };
}

/// The lazily-initialized loop for the current thread. A convenience, not a
/// contract: every constructor in this crate also accepts an explicit
/// [`Loop`], and independent loops may coexist.
pub fn default_loop() -> Result<Loop, Error> {
    DEFAULT_LOOP.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(lp) = slot.as_ref() {
            return Ok(lp.clone());
        }
        let lp = Loop::new()?;
        *slot = Some(lp.clone());
        Ok(lp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    fn test_loop() -> Loop {
        let config = ConfigBuilder::new()
            .precision(Duration::from_millis(5))
            .build()
            .unwrap();
        Loop::with_config(config).unwrap()
    }

    #[test]
    fn timers_fire_and_stop_ends_run() {
        let lp = test_loop();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let lp2 = lp.clone();
        lp.schedule(Duration::from_millis(10), move || {
            f.set(true);
            lp2.stop();
        });

        lp.run().unwrap();
        assert!(fired.get());
        assert!(!lp.running());
    }

    #[test]
    fn zero_delay_fires_next_tick() {
        let lp = test_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let lp2 = lp.clone();
        lp.schedule(Duration::ZERO, move || {
            o.borrow_mut().push("timer");
            lp2.stop();
        });
        order.borrow_mut().push("before-run");

        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec!["before-run", "timer"]);
    }

    #[test]
    fn deleted_timeout_never_fires() {
        let lp = test_loop();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let handle = lp.schedule(Duration::from_millis(5), move || f.set(true));
        handle.delete();

        let lp2 = lp.clone();
        lp.schedule(Duration::from_millis(30), move || lp2.stop());

        lp.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn same_deadline_timers_fire_in_insertion_order() {
        let lp = test_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3 {
            let o = order.clone();
            lp.schedule(Duration::from_millis(10), move || o.borrow_mut().push(n));
        }
        let lp2 = lp.clone();
        lp.schedule(Duration::from_millis(30), move || lp2.stop());

        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn start_and_stop_events_emit() {
        let lp = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        lp.on_start(move |()| l.borrow_mut().push("start"));
        let l = log.clone();
        lp.on_stop(move |()| l.borrow_mut().push("stop"));

        let lp2 = lp.clone();
        lp.schedule(Duration::ZERO, move || lp2.stop());

        lp.run().unwrap();
        assert_eq!(*log.borrow(), vec!["start", "stop"]);
    }

    #[test]
    fn stop_clears_pending_timers() {
        let lp = test_loop();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        lp.schedule(Duration::from_millis(50), move || f.set(true));

        let lp2 = lp.clone();
        lp.schedule(Duration::ZERO, move || lp2.stop());

        lp.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn schedule_from_callback_reschedules() {
        let lp = test_loop();
        let count = Rc::new(Cell::new(0u32));

        fn hop(lp: Loop, count: Rc<Cell<u32>>) {
            lp.clone().schedule(Duration::from_millis(1), move || {
                count.set(count.get() + 1);
                if count.get() < 3 {
                    hop(lp, count);
                } else {
                    lp.stop();
                }
            });
        }
        hop(lp.clone(), count.clone());

        lp.run().unwrap();
        assert_eq!(count.get(), 3);
    }
}
