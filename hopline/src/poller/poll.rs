use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Interest, PollEvent, Readiness, timeout_ms};

/// poll(2) backend. The fd set is rebuilt for every wait call, which is
/// O(fds) but portable to any POSIX system.
pub struct PollPoller {
    interests: HashMap<RawFd, Interest>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            interests: HashMap::new(),
        }
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        max_events: usize,
        timeout: Duration,
    ) -> io::Result<()> {
        // Registered fds with an empty interest set still participate so
        // that error and hangup conditions surface, matching epoll.
        let mut fds: Vec<libc::pollfd> = self
            .interests
            .iter()
            .map(|(&fd, interest)| {
                let mut mask: libc::c_short = 0;
                if interest.readable {
                    mask |= libc::POLLIN;
                }
                if interest.writable {
                    mask |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events: mask,
                    revents: 0,
                }
            })
            .collect();
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
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

        for pfd in fds.iter().filter(|p| p.revents != 0).take(max_events) {
            let revents = pfd.revents;
            events.push(PollEvent {
                fd: pfd.fd,
                readiness: Readiness {
                    readable: revents & libc::POLLIN != 0,
                    writable: revents & libc::POLLOUT != 0,
                    error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                    hangup: revents & libc::POLLHUP != 0,
                },
            });
        }
        Ok(())
    }
}
