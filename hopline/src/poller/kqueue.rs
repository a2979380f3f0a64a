use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Interest, PollEvent, Readiness};

pub struct KqueuePoller {
    kq: RawFd,
    // kqueue tracks one filter per (fd, direction); remember what is armed
    // so interest changes submit the right EV_ADD / EV_DELETE pairs.
    interests: HashMap<RawFd, Interest>,
}

impl KqueuePoller {
    pub fn new() -> io::Result<KqueuePoller> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueuePoller {
            kq,
            interests: HashMap::new(),
        })
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let previous = self.interests.get(&fd).copied().unwrap_or(Interest::NONE);
        self.apply(fd, previous, interest)?;
        self.interests.insert(fd, interest);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.register(fd, interest)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(previous) = self.interests.remove(&fd) {
            self.apply(fd, previous, Interest::NONE)?;
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut buf: Vec<libc::kevent> = Vec::with_capacity(max_events.max(1));
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                buf.as_mut_ptr(),
                buf.capacity() as libc::c_int,
                &ts,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        unsafe { buf.set_len(n as usize) };
        for ev in &buf {
            let mut readiness = Readiness::default();
            if ev.filter == libc::EVFILT_READ as _ {
                readiness.readable = true;
            }
            if ev.filter == libc::EVFILT_WRITE as _ {
                readiness.writable = true;
            }
            if ev.flags & libc::EV_EOF as libc::u_short != 0 {
                readiness.hangup = true;
            }
            if ev.flags & libc::EV_ERROR as libc::u_short != 0 {
                readiness.error = true;
            }
            events.push(PollEvent {
                fd: ev.ident as RawFd,
                readiness,
            });
        }
        Ok(())
    }

    fn apply(&mut self, fd: RawFd, previous: Interest, wanted: Interest) -> io::Result<()> {
        self.change(fd, libc::EVFILT_READ, previous.readable, wanted.readable)?;
        self.change(fd, libc::EVFILT_WRITE, previous.writable, wanted.writable)
    }

    fn change(&mut self, fd: RawFd, filter: i16, had: bool, want: bool) -> io::Result<()> {
        if had == want {
            return Ok(());
        }
        let flags = if want {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: filter as _,
            flags: flags as _,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Deleting a filter that the kernel already dropped is fine.
            if !want && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
