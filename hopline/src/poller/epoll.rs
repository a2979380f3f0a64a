use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Interest, PollEvent, Readiness, timeout_ms};

pub struct EpollPoller {
    epfd: RawFd,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller { epfd })
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut buf: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                buf.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in &buf[..n as usize] {
            let mask = ev.events;
            events.push(PollEvent {
                fd: ev.u64 as RawFd,
                readiness: Readiness {
                    readable: mask & libc::EPOLLIN as u32 != 0,
                    writable: mask & libc::EPOLLOUT as u32 != 0,
                    error: mask & libc::EPOLLERR as u32 != 0,
                    hangup: mask & libc::EPOLLHUP as u32 != 0,
                },
            });
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut mask = 0u32;
        if interest.readable {
            mask |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            mask |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
