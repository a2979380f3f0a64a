//! Readiness backends.
//!
//! The loop learns that a socket can be read or written through one of
//! three OS primitives: epoll (Linux), kqueue (macOS and the BSDs), or
//! poll (any other POSIX system). The platform default is chosen at
//! compile time; the poll backend is compiled everywhere and can be
//! selected explicitly, which keeps the fallback path exercised.
//!
//! All backends are level-triggered and present identical observable
//! behavior: register an fd with an interest set, get back `(fd,
//! readiness)` pairs from `wait`.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// The event set watched for an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// The event set reported for an fd.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The fd is in an error state (e.g. `POLLERR`).
    pub error: bool,
    /// The peer hung up (e.g. `POLLHUP`, kqueue `EV_EOF`).
    pub hangup: bool,
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

/// A readiness backend instance.
pub enum Poller {
    #[cfg(target_os = "linux")]
    Epoll(epoll::EpollPoller),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::KqueuePoller),
    Poll(poll::PollPoller),
}

impl Poller {
    /// Create the platform-default backend.
    pub fn new() -> io::Result<Poller> {
        #[cfg(target_os = "linux")]
        {
            Ok(Poller::Epoll(epoll::EpollPoller::new()?))
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            Ok(Poller::Kqueue(kqueue::KqueuePoller::new()?))
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            Ok(Poller::Poll(poll::PollPoller::new()))
        }
    }

    /// Create the portable poll(2) backend regardless of platform.
    pub fn portable() -> Poller {
        Poller::Poll(poll::PollPoller::new())
    }

    /// Name of the active backend, for diagnostics.
    pub fn backend_name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(_) => "kqueue",
            Poller::Poll(_) => "poll",
        }
    }

    /// Start watching `fd` with the given interest set. Registering an fd a
    /// second time replaces its interests.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.register(fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.register(fd, interest),
            Poller::Poll(p) => p.register(fd, interest),
        }
    }

    /// Change the interest set for a registered fd.
    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.reregister(fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.reregister(fd, interest),
            Poller::Poll(p) => p.reregister(fd, interest),
        }
    }

    /// Stop watching `fd`.
    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.deregister(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.deregister(fd),
            Poller::Poll(p) => p.deregister(fd),
        }
    }

    /// Block for up to `timeout` and append readiness notifications to
    /// `events`. At most `max_events` notifications are drained per call.
    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.wait(events, max_events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.wait(events, max_events, timeout),
            Poller::Poll(p) => p.wait(events, max_events, timeout),
        }
    }
}

/// Round a timeout up to whole milliseconds so sub-millisecond waits do not
/// degenerate into busy polling.
pub(crate) fn timeout_ms(timeout: Duration) -> i32 {
    let micros = timeout.as_micros();
    let ms = micros.div_ceil(1000);
    ms.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn check_backend(mut poller: Poller) {
        let (rd, wr) = pipe();
        poller.register(rd, Interest::READABLE).unwrap();

        let mut events = Vec::new();
        poller
            .wait(&mut events, 64, Duration::from_millis(10))
            .unwrap();
        assert!(events.iter().all(|e| e.fd != rd || !e.readiness.readable));

        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);

        events.clear();
        poller
            .wait(&mut events, 64, Duration::from_millis(1000))
            .unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.fd == rd && e.readiness.readable),
            "expected readable event on {}",
            poller.backend_name()
        );

        poller.deregister(rd).unwrap();
        events.clear();
        poller
            .wait(&mut events, 64, Duration::from_millis(10))
            .unwrap();
        assert!(events.iter().all(|e| e.fd != rd));

        close(rd);
        close(wr);
    }

    #[test]
    fn default_backend_reports_readable() {
        check_backend(Poller::new().unwrap());
    }

    #[test]
    fn portable_backend_reports_readable() {
        check_backend(Poller::portable());
    }

    #[test]
    fn interest_update_stops_events() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = pipe();

        poller.register(rd, Interest::READABLE).unwrap();
        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);

        poller.reregister(rd, Interest::NONE).unwrap();
        let mut events = Vec::new();
        poller
            .wait(&mut events, 64, Duration::from_millis(10))
            .unwrap();
        assert!(events.iter().all(|e| e.fd != rd || !e.readiness.readable));

        poller.deregister(rd).unwrap();
        close(rd);
        close(wr);
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(Duration::from_micros(100)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(5)), 5);
        assert_eq!(timeout_ms(Duration::ZERO), 0);
    }
}
