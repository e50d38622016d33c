use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, error};

use crate::app::App;
use crate::poller::Ready;
use crate::sys;

use super::{Context, Pollable, ServiceSocket};

#[derive(Debug, PartialEq)]
enum State {
    Listen,
    Closing,
}

/// Accepts TCP connections and turns each into a [`ServiceSocket`].
///
/// Stops advertising read interest while the reactor is at its connection
/// cap, which leaves further clients waiting in the accept backlog.
pub struct ListenerSocket {
    listener: TcpListener,
    state: State,
}

impl ListenerSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<ListenerSocket> {
        let listener = sys::nonblocking_listener(&addr)?;

        Ok(ListenerSocket {
            listener,
            state: State::Listen,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Pollable for ListenerSocket {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn interest(&self, app: &App, pollables: usize) -> Ready {
        let mut interest = Ready::error();

        if self.state == State::Listen && pollables < app.settings.max_connections {
            interest |= Ready::readable();
        }

        interest
    }

    fn on_read(&mut self, ctx: &mut Context) {
        if self.state != State::Listen {
            return;
        }

        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!("cannot make accepted socket non-blocking: {}", e);
                    return;
                }

                debug!("accepted connection from {}", peer);
                ctx.spawn(Box::new(ServiceSocket::new(stream, peer)));
            }
            Err(ref e) if sys::would_block(e) => {}
            Err(e) => {
                // transient accept failures are logged, listening goes on
                error!("accept failed: {}", e);
            }
        }
    }

    fn on_error(&mut self, _ctx: &mut Context) {
        self.state = State::Closing;
    }

    fn is_terminating(&self) -> bool {
        self.state == State::Closing
    }
}
