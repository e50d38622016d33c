//! Services a block device server answers: raw block access, the header
//! block and login.

use log::debug;

use crate::error::{Error, Result};
use crate::http::RequestContext;
use crate::pollable::Context;

use super::{password_matches, Service};

fn block_arg(req: &RequestContext) -> Result<i64> {
    req.arg("block")
        .and_then(|value| value.parse().ok())
        .filter(|&block| block >= -1)
        .ok_or(Error::ProtocolMalformed)
}

/// `GET /get_block?block=<n>`: one block of the local disk file.
pub struct GetBlockService;

impl GetBlockService {
    pub fn new() -> GetBlockService {
        GetBlockService
    }
}

impl Service for GetBlockService {
    fn wanted_args(&self) -> &'static [&'static str] {
        &["block"]
    }

    fn before_response_status(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let block = block_arg(req)?;
        let device = ctx.app.device_ref()?;

        req.response_content = device.blockfile.read_block(block)?;
        Ok(true)
    }

    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        req.set_response_header("Content-Type", "application/octet-stream");
        Ok(true)
    }
}

/// `POST /set_block?block=<n>`: overwrite one block with the request body.
pub struct SetBlockService {
    block: i64,
    data: Vec<u8>,
}

impl SetBlockService {
    pub fn new() -> SetBlockService {
        SetBlockService {
            block: 0,
            data: Vec::new(),
        }
    }
}

impl Service for SetBlockService {
    fn wanted_args(&self) -> &'static [&'static str] {
        &["block"]
    }

    fn wanted_headers(&self) -> &'static [&'static str] {
        &["Content-Length"]
    }

    fn before_content(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        self.block = block_arg(req)?;

        let device = ctx.app.device_ref()?;
        if req.content_length != device.blockfile.block_size() as usize {
            debug!(
                "set_block body of {} bytes, block size is {}",
                req.content_length,
                device.blockfile.block_size()
            );
            return Err(Error::ProtocolMalformed);
        }

        Ok(true)
    }

    fn handle_content(
        &mut self,
        _req: &mut RequestContext,
        chunk: &[u8],
        _ctx: &mut Context,
    ) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn before_response_status(&mut self, _req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let block = self.block;
        let data = std::mem::take(&mut self.data);

        let device = ctx.app.device_mut()?;
        if block == -1 {
            device.blockfile.write_block(-1, &data)?;
            device.blockfile.refresh();
            if let Ok(header) = device.blockfile.read_header() {
                debug!(
                    "header rewritten: volume {} slot {} generation {}",
                    header.volume_uuid, header.disk_index, header.generation
                );
            }
        } else {
            device.blockfile.write_block(block, &data)?;
        }

        Ok(true)
    }
}

/// `GET /get_disk_info`: the header block (block -1).
pub struct GetDiskInfoService;

impl GetDiskInfoService {
    pub fn new() -> GetDiskInfoService {
        GetDiskInfoService
    }
}

impl Service for GetDiskInfoService {
    fn before_response_status(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let device = ctx.app.device_ref()?;
        req.response_content = device.blockfile.read_block(-1)?;
        Ok(true)
    }

    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        req.set_response_header("Content-Type", "application/octet-stream");
        Ok(true)
    }
}

/// `POST /login` with a `password=...` body.
pub struct LoginService {
    body: Vec<u8>,
}

impl LoginService {
    pub fn new() -> LoginService {
        LoginService { body: Vec::new() }
    }
}

impl Service for LoginService {
    fn wanted_headers(&self) -> &'static [&'static str] {
        &["Content-Length"]
    }

    fn handle_content(
        &mut self,
        _req: &mut RequestContext,
        chunk: &[u8],
        _ctx: &mut Context,
    ) -> Result<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn before_response_status(&mut self, _req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let presented = self
            .body
            .strip_prefix(b"password=")
            .unwrap_or(&[]);

        if !password_matches(presented, ctx.app.long_password().as_bytes()) {
            return Err(Error::AuthFailed);
        }

        Ok(true)
    }
}
