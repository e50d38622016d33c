//! Readiness multiplexing over a set of file descriptors.
//!
//! Two interchangeable backends sit behind the [`Poller`] trait: one over
//! `poll(2)` and one over `select(2)`. Both are level-triggered: a socket
//! that stays readable shows up again on every call until it is drained.

use std::fmt;
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

mod poll;
mod select;

pub use poll::PollPoller;
pub use select::SelectPoller;

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const ERROR: u8 = 0b100;

/// A set of readiness flags.
///
/// `Ready` doubles as the interest mask a pollable asks for and as the
/// readiness delivered back by the poller. Values combine with `|`.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready(READABLE), "Readable"),
            (Ready(WRITABLE), "Writable"),
            (Ready(ERROR), "Error"),
        ];

        for &(flag, msg) in &flags {
            if self.0 & flag.0 != 0 {
                if one {
                    fmt.write_str(" | ")?
                }
                one = true;
                fmt.write_str(msg)?;
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// One readiness notification.
#[derive(Debug, Copy, Clone)]
pub struct Event {
    pub fd: RawFd,
    pub readiness: Ready,
}

/// Contract shared by the `poll(2)` and `select(2)` backends.
///
/// Registration is an upsert: registering an fd that is already present
/// replaces its interest mask. A poll interrupted by a signal reports an
/// empty result rather than an error.
pub trait Poller: Send {
    fn register(&mut self, fd: RawFd, interest: Ready);

    fn unregister(&mut self, fd: RawFd);

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Which poller backend to run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollType {
    Poll,
    Select,
}

impl PollType {
    pub fn create(self) -> Box<dyn Poller> {
        match self {
            PollType::Poll => Box::new(PollPoller::new()),
            PollType::Select => Box::new(SelectPoller::new()),
        }
    }
}

impl FromStr for PollType {
    type Err = String;

    fn from_str(s: &str) -> Result<PollType, String> {
        match s {
            "poll" => Ok(PollType::Poll),
            "select" => Ok(PollType::Select),
            other => Err(format!("unknown poll type {:?}, expected poll or select", other)),
        }
    }
}

pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    timeout
        .map(|to| std::cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_ops() {
        let ready = Ready::readable() | Ready::error();
        assert!(ready.is_readable());
        assert!(ready.is_error());
        assert!(!ready.is_writable());
        assert!(Ready::empty().is_empty());
    }

    #[test]
    fn poll_type_from_str() {
        assert_eq!("poll".parse::<PollType>().unwrap(), PollType::Poll);
        assert_eq!("select".parse::<PollType>().unwrap(), PollType::Select);
        assert!("epoll".parse::<PollType>().is_err());
    }
}
