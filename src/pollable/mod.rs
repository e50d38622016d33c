//! Event sources driven by the reactor.
//!
//! Everything the reactor watches implements [`Pollable`]: the TCP listener,
//! per-connection service sockets, the UDP discovery pair and outbound block
//! device clients. Hooks default to no-ops; a pollable overrides the ones its
//! lifecycle needs.

use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::app::App;
use crate::poller::Ready;

mod declarer;
mod device_client;
mod identifier;
mod listener;
mod service_socket;

pub use declarer::{encode_beacon, DeclarerSocket};
pub use device_client::{BlockDeviceClient, ClientError, ClientPurpose, OutboundRequest};
pub use identifier::{parse_beacon, IdentifierSocket};
pub use listener::ListenerSocket;
pub use service_socket::ServiceSocket;

/// Multicast datagram field separator (ASCII unit separator).
pub const SEP: u8 = 0x1f;

/// State shared with a pollable while one of its hooks runs.
///
/// New pollables cannot be inserted into the reactor map mid-dispatch, so
/// they are parked here and the reactor adopts them after the hook returns.
pub struct Context<'a> {
    pub app: &'a mut App,
    /// Number of pollables currently owned by the reactor.
    pub pollables: usize,
    pub now: Instant,
    spawned: Vec<Box<dyn Pollable>>,
}

impl<'a> Context<'a> {
    pub fn new(app: &'a mut App, pollables: usize, now: Instant) -> Context<'a> {
        Context {
            app,
            pollables,
            now,
            spawned: Vec::new(),
        }
    }

    /// Hands a new pollable to the reactor.
    pub fn spawn(&mut self, pollable: Box<dyn Pollable>) {
        self.spawned.push(pollable);
    }

    pub fn spawn_all(&mut self, pollables: Vec<Box<dyn Pollable>>) {
        self.spawned.extend(pollables);
    }

    pub fn take_spawned(&mut self) -> Vec<Box<dyn Pollable>> {
        std::mem::take(&mut self.spawned)
    }
}

/// An event source owned by the reactor.
pub trait Pollable: Send {
    fn fd(&self) -> RawFd;

    /// The readiness this pollable currently cares about. Re-evaluated every
    /// poll round, so interest can follow internal state.
    fn interest(&self, app: &App, pollables: usize) -> Ready;

    fn on_read(&mut self, _ctx: &mut Context) {}

    fn on_write(&mut self, _ctx: &mut Context) {}

    fn on_error(&mut self, _ctx: &mut Context) {}

    /// Called when a poll round times out with nothing ready.
    fn on_idle(&mut self, _ctx: &mut Context) {}

    /// Called exactly once when the reactor drops this pollable. The fd
    /// itself is released by the pollable's own `Drop`.
    fn on_close(&mut self, _app: &mut App) {}

    /// A terminating pollable is removed once its send buffer drains.
    fn is_terminating(&self) -> bool;

    fn has_pending_send(&self) -> bool {
        false
    }
}
