//! Distributed RAID-5 block storage over a single-threaded poll reactor.
//!
//! Two server roles share this crate. A **block device** owns one slice of a
//! striped volume as a flat local file and serves it over a small HTTP
//! protocol (`/get_block`, `/set_block`, `/get_disk_info`, `/login`). A
//! **frontend** exposes the logical volume: it discovers block devices over
//! UDP multicast, binds them to volume slots, and fans each logical read or
//! write out into per-disk sub-requests with XOR parity, reconstructing
//! data when a disk is down and rebuilding replacements in the background.
//!
//! Everything runs on one thread. The [`reactor::AsyncServer`] multiplexes
//! every socket through a level-triggered [`poller::Poller`] (`poll(2)` or
//! `select(2)`) and drives each [`pollable::Pollable`] through its hooks; no
//! handler blocks, and suspension is always explicit (a service hook
//! returning `false`, or bytes left in a send buffer).

#[macro_use]
mod macros;

pub mod app;
pub mod config;
pub mod disk;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod pollable;
pub mod poller;
pub mod raid;
pub mod reactor;
pub mod service;
pub mod sys;
pub mod uuid;
pub mod volume;

pub use app::{App, Settings};
pub use error::{Error, Result};
pub use poller::{PollType, Ready};
pub use reactor::AsyncServer;
pub use uuid::Uuid;
