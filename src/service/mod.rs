//! Request handlers and the URI registry that dispatches to them.
//!
//! A [`Service`] is driven in phases by the connection that owns it. Each
//! `before_*` hook returns `Ok(true)` to let the state machine advance, or
//! `Ok(false)` to be called again on a later poll round, which is how a
//! handler waits for something else on the reactor (a file, a block device
//! client) without blocking.

use std::path::Path;

use indexmap::IndexMap;

use crate::app::App;
use crate::error::Result;
use crate::http::RequestContext;
use crate::pollable::Context;

mod device;
mod form;
mod frontend;
mod pages;

pub use device::{GetBlockService, GetDiskInfoService, LoginService, SetBlockService};
pub use form::FileFormService;
pub use frontend::{InitVolumeService, ListVolumesService, ReadBlockService, WriteBlockService};
pub use pages::{ClockService, GetFileService};

pub trait Service: Send {
    /// Headers the request must carry, checked after header parse.
    fn wanted_headers(&self) -> &'static [&'static str] {
        &[]
    }

    /// Query arguments the request must carry, exactly.
    fn wanted_args(&self) -> &'static [&'static str] {
        &[]
    }

    /// Runs between header parse and body read. Returning `Ok(false)` skips
    /// the content phase entirely.
    fn before_content(&mut self, _req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        Ok(true)
    }

    /// Receives each chunk of the request body as it arrives.
    fn handle_content(
        &mut self,
        _req: &mut RequestContext,
        _chunk: &[u8],
        _ctx: &mut Context,
    ) -> Result<()> {
        Ok(())
    }

    fn before_response_status(
        &mut self,
        _req: &mut RequestContext,
        _ctx: &mut Context,
    ) -> Result<bool> {
        Ok(true)
    }

    fn before_response_headers(
        &mut self,
        _req: &mut RequestContext,
        _ctx: &mut Context,
    ) -> Result<bool> {
        Ok(true)
    }

    /// May append response body bytes to `out`, bounded by `max_buffer`.
    /// Returns `Ok(true)` once the body is complete.
    fn before_response_content(
        &mut self,
        _req: &mut RequestContext,
        _out: &mut Vec<u8>,
        _max_buffer: usize,
        _ctx: &mut Context,
    ) -> Result<bool> {
        Ok(true)
    }

    /// The owning connection is going away, finished or not.
    fn on_close(&mut self, _app: &mut App) {}
}

type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send>;

/// Exact-match URI path to service factory table, built once at startup.
pub struct ServiceRegistry {
    services: IndexMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry {
            services: IndexMap::new(),
        }
    }

    pub fn register<F>(&mut self, uri: &str, factory: F)
    where
        F: Fn() -> Box<dyn Service> + Send + 'static,
    {
        self.services.insert(uri.to_string(), Box::new(factory));
    }

    pub fn create(&self, uri: &str) -> Option<Box<dyn Service>> {
        self.services.get(uri).map(|factory| factory())
    }
}

impl Default for ServiceRegistry {
    fn default() -> ServiceRegistry {
        ServiceRegistry::new()
    }
}

/// Services a block device server answers.
pub fn device_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register("/get_block", || Box::new(GetBlockService::new()));
    registry.register("/set_block", || Box::new(SetBlockService::new()));
    registry.register("/get_disk_info", || Box::new(GetDiskInfoService::new()));
    registry.register("/login", || Box::new(LoginService::new()));
    registry.register("/clock", || Box::new(ClockService::new()));
    registry
}

/// Services a frontend server answers.
pub fn frontend_registry(base: &Path) -> ServiceRegistry {
    let index = base.join("index.html");

    let mut registry = ServiceRegistry::new();
    registry.register("/read_block", || Box::new(ReadBlockService::new()));
    registry.register("/write_block", || Box::new(WriteBlockService::new()));
    registry.register("/init_volume", || Box::new(InitVolumeService::new()));
    registry.register("/volumes", || Box::new(ListVolumesService::new()));
    registry.register("/clock", || Box::new(ClockService::new()));
    registry.register("/file_upload", || Box::new(FileFormService::new()));
    registry.register("/", move || Box::new(GetFileService::new(index.clone())));
    registry
}

/// Compares the presented password against the shared secret without
/// shortcutting on the first mismatch.
pub fn password_matches(presented: &[u8], expected: &[u8]) -> bool {
    let mut diff = presented.len() ^ expected.len();

    for i in 0..expected.len().max(presented.len()) {
        let a = presented.get(i).copied().unwrap_or(0);
        let b = expected.get(i).copied().unwrap_or(0);
        diff |= (a ^ b) as usize;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatch() {
        let registry = device_registry();
        assert!(registry.create("/get_block").is_some());
        assert!(registry.create("/get_block/extra").is_none());
        assert!(registry.create("/missing").is_none());
    }

    #[test]
    fn password_comparison() {
        assert!(password_matches(b"secret", b"secret"));
        assert!(!password_matches(b"secret", b"secret2"));
        assert!(!password_matches(b"", b"secret"));
        assert!(!password_matches(b"Secret", b"secret"));
    }
}
