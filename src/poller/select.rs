use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use log::warn;

use super::{Event, Poller, Ready};

/// `select(2)` backend. Capped at `FD_SETSIZE` descriptors.
pub struct SelectPoller {
    interest: IndexMap<RawFd, Ready>,
}

impl SelectPoller {
    pub fn new() -> SelectPoller {
        SelectPoller {
            interest: IndexMap::new(),
        }
    }
}

impl Default for SelectPoller {
    fn default() -> SelectPoller {
        SelectPoller::new()
    }
}

impl Poller for SelectPoller {
    fn register(&mut self, fd: RawFd, interest: Ready) {
        if fd as usize >= libc::FD_SETSIZE {
            warn!("fd {} exceeds FD_SETSIZE, not watching it", fd);
            return;
        }
        self.interest.insert(fd, interest);
    }

    fn unregister(&mut self, fd: RawFd) {
        self.interest.swap_remove(&fd);
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();

        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        let mut errfds: libc::fd_set = unsafe { mem::zeroed() };

        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errfds);
        }

        let mut nfds = 0;

        for (&fd, &interest) in &self.interest {
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut readfds);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut writefds);
                }
                libc::FD_SET(fd, &mut errfds);
            }
            nfds = std::cmp::max(nfds, fd + 1);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs() as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });

        let timeval_ptr = timeval
            .as_mut()
            .map(|tv| tv as *mut libc::timeval)
            .unwrap_or(std::ptr::null_mut());

        let ret = unsafe {
            libc::select(
                nfds,
                &mut readfds,
                &mut writefds,
                &mut errfds,
                timeval_ptr,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for &fd in self.interest.keys() {
            let mut readiness = Ready::empty();
            unsafe {
                if libc::FD_ISSET(fd, &readfds) {
                    readiness |= Ready::readable();
                }
                if libc::FD_ISSET(fd, &writefds) {
                    readiness |= Ready::writable();
                }
                if libc::FD_ISSET(fd, &errfds) {
                    readiness |= Ready::error();
                }
            }

            if !readiness.is_empty() {
                events.push(Event { fd, readiness });
            }
        }

        Ok(events.len())
    }
}
