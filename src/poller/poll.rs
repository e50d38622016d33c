use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;

use super::{millis, Event, Poller, Ready};

/// `poll(2)` backend. No cap on the number of descriptors.
pub struct PollPoller {
    interest: IndexMap<RawFd, Ready>,
    pollfds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            interest: IndexMap::new(),
            pollfds: Vec::new(),
        }
    }
}

impl Default for PollPoller {
    fn default() -> PollPoller {
        PollPoller::new()
    }
}

impl Poller for PollPoller {
    fn register(&mut self, fd: RawFd, interest: Ready) {
        self.interest.insert(fd, interest);
    }

    fn unregister(&mut self, fd: RawFd) {
        self.interest.swap_remove(&fd);
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        self.pollfds.clear();

        for (&fd, &interest) in &self.interest {
            let mut mask: libc::c_short = 0;
            if interest.is_readable() {
                mask |= libc::POLLIN;
            }
            if interest.is_writable() {
                mask |= libc::POLLOUT;
            }
            // POLLERR and POLLHUP are always reported, no need to ask

            self.pollfds.push(libc::pollfd {
                fd,
                events: mask,
                revents: 0,
            });
        }

        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                millis(timeout),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for pollfd in &self.pollfds {
            if pollfd.revents == 0 {
                continue;
            }

            let mut readiness = Ready::empty();
            if pollfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                readiness |= Ready::readable();
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                readiness |= Ready::writable();
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                readiness |= Ready::error();
            }

            events.push(Event {
                fd: pollfd.fd,
                readiness,
            });
        }

        Ok(events.len())
    }
}
