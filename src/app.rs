//! Per-process application state shared by every pollable.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::{DeviceConfig, FrontendConfig};
use crate::disk::{BlockFile, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::pollable::Pollable;
use crate::service::{device_registry, frontend_registry, ServiceRegistry};
use crate::volume::FrontendState;

/// Knobs every server takes from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: IpAddr,
    pub bind_port: u16,
    pub base: PathBuf,
    pub poll_timeout: Duration,
    pub max_buffer: usize,
    pub max_connections: usize,
    pub block_request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8080,
            base: PathBuf::from("."),
            poll_timeout: Duration::from_millis(500),
            max_buffer: DEFAULT_BLOCK_SIZE as usize,
            max_connections: 1000,
            block_request_timeout: Duration::from_secs(5),
        }
    }
}

/// State owned by a block device server: its slice of the volume.
pub struct DeviceState {
    pub config: DeviceConfig,
    pub blockfile: BlockFile,
}

enum Role {
    Device(DeviceState),
    Frontend(FrontendState),
}

/// The application context handed to every hook through
/// [`Context`](crate::pollable::Context).
pub struct App {
    pub settings: Settings,
    pub registry: ServiceRegistry,
    /// Pollables created from hooks that have no [`Context`] to hand them to
    /// (`on_close` paths); the reactor adopts these at the end of the round.
    ///
    /// [`Context`]: crate::pollable::Context
    pub spawn_queue: Vec<Box<dyn Pollable>>,
    role: Role,
}

impl App {
    pub fn device(settings: Settings, config: DeviceConfig, blockfile: BlockFile) -> App {
        App {
            registry: device_registry(),
            settings,
            spawn_queue: Vec::new(),
            role: Role::Device(DeviceState { config, blockfile }),
        }
    }

    pub fn frontend(settings: Settings, config: FrontendConfig) -> App {
        let registry = frontend_registry(&settings.base);
        App {
            settings,
            registry,
            spawn_queue: Vec::new(),
            role: Role::Frontend(FrontendState::new(config)),
        }
    }

    pub fn device_ref(&self) -> Result<&DeviceState> {
        match &self.role {
            Role::Device(state) => Ok(state),
            Role::Frontend(_) => Err(Error::Internal("not a block device server".into())),
        }
    }

    pub fn device_mut(&mut self) -> Result<&mut DeviceState> {
        match &mut self.role {
            Role::Device(state) => Ok(state),
            Role::Frontend(_) => Err(Error::Internal("not a block device server".into())),
        }
    }

    pub fn frontend_ref(&self) -> Result<&FrontendState> {
        match &self.role {
            Role::Frontend(state) => Ok(state),
            Role::Device(_) => Err(Error::Internal("not a frontend server".into())),
        }
    }

    pub fn frontend_mut(&mut self) -> Result<&mut FrontendState> {
        match &mut self.role {
            Role::Frontend(state) => Ok(state),
            Role::Device(_) => Err(Error::Internal("not a frontend server".into())),
        }
    }

    /// Settings and frontend state borrowed side by side, for callers that
    /// need both.
    pub fn frontend_parts(&mut self) -> Result<(&Settings, &mut FrontendState)> {
        match &mut self.role {
            Role::Frontend(state) => Ok((&self.settings, state)),
            Role::Device(_) => Err(Error::Internal("not a frontend server".into())),
        }
    }

    /// The shared secret `/login` checks against.
    pub fn long_password(&self) -> &str {
        match &self.role {
            Role::Device(state) => &state.config.long_password,
            Role::Frontend(state) => &state.long_password,
        }
    }

    /// Reactor-level idle tick: discovery bookkeeping, slot watchdogs and
    /// rebuild progress all run from here.
    pub fn on_idle(&mut self, now: Instant) -> Vec<Box<dyn Pollable>> {
        match &mut self.role {
            Role::Frontend(state) => state.on_idle(now, &self.settings),
            Role::Device(_) => Vec::new(),
        }
    }
}
