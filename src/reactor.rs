//! The single-threaded event loop driving every socket in the process.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::app::App;
use crate::pollable::{Context, Pollable};
use crate::poller::{Event, PollType, Poller};

/// Owns the poller, the pollable set and the application state, and runs the
/// cooperative scheduling loop.
///
/// One iteration: refresh every pollable's interest, poll, dispatch
/// error/read/write hooks for whatever came back, adopt freshly spawned
/// pollables, then reap the ones that finished flushing and want to die.
/// Nothing in here blocks except the poll itself.
pub struct AsyncServer {
    poller: Box<dyn Poller>,
    pollables: IndexMap<RawFd, Box<dyn Pollable>>,
    events: Vec<Event>,
    app: App,
    run: bool,
    last_idle: Instant,
}

impl AsyncServer {
    pub fn new(app: App, poll_type: PollType) -> AsyncServer {
        AsyncServer {
            poller: poll_type.create(),
            pollables: IndexMap::new(),
            events: Vec::new(),
            app,
            run: false,
            last_idle: Instant::now(),
        }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut App {
        &mut self.app
    }

    pub fn pollable_count(&self) -> usize {
        self.pollables.len()
    }

    /// Adds a pollable to the watched set.
    pub fn insert(&mut self, pollable: Box<dyn Pollable>) {
        let fd = pollable.fd();
        trace!("watching fd {}", fd);
        if self.pollables.insert(fd, pollable).is_some() {
            warn!("fd {} was already watched, replacing", fd);
        }
    }

    pub fn shutdown(&mut self) {
        self.run = false;
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.run = true;

        while self.run {
            self.run_once()?;
        }

        Ok(())
    }

    /// One poll round.
    pub fn run_once(&mut self) -> io::Result<()> {
        let count = self.pollables.len();

        for (&fd, pollable) in &self.pollables {
            self.poller.register(fd, pollable.interest(&self.app, count));
        }

        let timeout = self.app.settings.poll_timeout;
        let ready = self.poller.poll(&mut self.events, Some(timeout))?;
        let now = Instant::now();

        // run the idle pass on a poll timeout, and also at least once per
        // poll_timeout of wall time: busy-parked sockets keep poll from ever
        // timing out, and request timeouts still have to fire then
        if ready == 0 || now.duration_since(self.last_idle) >= timeout {
            self.last_idle = now;
            self.idle_pass(now);
        }

        if ready > 0 {
            let events = std::mem::take(&mut self.events);
            for event in &events {
                self.dispatch(event, now);
            }
            self.events = events;
        }

        self.reap();

        let deferred = std::mem::take(&mut self.app.spawn_queue);
        self.adopt(deferred);

        Ok(())
    }

    fn dispatch(&mut self, event: &Event, now: Instant) {
        // taken out of the map so hooks can borrow the app freely
        let mut pollable = match self.pollables.swap_remove(&event.fd) {
            Some(pollable) => pollable,
            None => return,
        };

        let count = self.pollables.len() + 1;
        let mut ctx = Context::new(&mut self.app, count, now);

        if event.readiness.is_error() {
            pollable.on_error(&mut ctx);
        }
        if event.readiness.is_readable() {
            pollable.on_read(&mut ctx);
        }
        if event.readiness.is_writable() {
            pollable.on_write(&mut ctx);
        }

        let spawned = ctx.take_spawned();
        self.pollables.insert(event.fd, pollable);
        self.adopt(spawned);
    }

    fn idle_pass(&mut self, now: Instant) {
        let fds: Vec<RawFd> = self.pollables.keys().copied().collect();

        for fd in fds {
            let mut pollable = match self.pollables.swap_remove(&fd) {
                Some(pollable) => pollable,
                None => continue,
            };

            let count = self.pollables.len() + 1;
            let mut ctx = Context::new(&mut self.app, count, now);
            pollable.on_idle(&mut ctx);

            let spawned = ctx.take_spawned();
            self.pollables.insert(fd, pollable);
            self.adopt(spawned);
        }

        let spawned = self.app.on_idle(now);
        self.adopt(spawned);
    }

    fn adopt(&mut self, spawned: Vec<Box<dyn Pollable>>) {
        for pollable in spawned {
            self.insert(pollable);
        }
    }

    /// Removes every pollable that is terminating and has nothing left to
    /// flush. `on_close` runs exactly once; dropping the pollable releases
    /// its fd.
    fn reap(&mut self) {
        let done: Vec<RawFd> = self
            .pollables
            .iter()
            .filter(|(_, p)| p.is_terminating() && !p.has_pending_send())
            .map(|(&fd, _)| fd)
            .collect();

        for fd in done {
            if let Some(mut pollable) = self.pollables.swap_remove(&fd) {
                debug!("closing fd {}", fd);
                self.poller.unregister(fd);
                pollable.on_close(&mut self.app);
            }
        }
    }
}
