//! Frontend services: logical block I/O against a volume, volume
//! initialization and the status page.
//!
//! The block services submit a logical op to the orchestrator and then park
//! (`Ok(false)`) in `before_response_status` until the op settles; the
//! reactor polls them back every round.

use std::time::Instant;

use crate::app::App;
use crate::error::{Error, Result};
use crate::http::RequestContext;
use crate::orchestrator::OpId;
use crate::pollable::Context;
use crate::uuid::Uuid;

use super::Service;

fn volume_arg(req: &RequestContext) -> Result<Uuid> {
    req.arg("volume")
        .and_then(|value| value.parse().ok())
        .ok_or(Error::ProtocolMalformed)
}

fn block_arg(req: &RequestContext) -> Result<u64> {
    req.arg("block")
        .and_then(|value| value.parse().ok())
        .ok_or(Error::ProtocolMalformed)
}

/// Lets go of an op whose client connection died first.
fn abandon(app: &mut App, volume: Uuid, op: OpId) {
    let now = Instant::now();

    let spawns = match app.frontend_parts() {
        Ok((settings, frontend)) => frontend.abandon_op(volume, op, now, settings),
        Err(_) => return,
    };

    app.spawn_queue.extend(spawns);
}

/// `GET /read_block?volume=<uuid>&block=<n>`.
pub struct ReadBlockService {
    pending: Option<(Uuid, OpId)>,
}

impl ReadBlockService {
    pub fn new() -> ReadBlockService {
        ReadBlockService { pending: None }
    }
}

impl Service for ReadBlockService {
    fn wanted_args(&self) -> &'static [&'static str] {
        &["volume", "block"]
    }

    fn before_response_status(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let now = ctx.now;

        if self.pending.is_none() {
            let volume = volume_arg(req)?;
            let block = block_arg(req)?;

            let started = {
                let (settings, frontend) = ctx.app.frontend_parts()?;
                frontend.start_read(volume, block, now, settings)
            };

            match started {
                Ok((op, spawns)) => {
                    ctx.spawn_all(spawns);
                    self.pending = Some((volume, op));
                }
                Err(e) => {
                    req.response_status = e.http_status();
                    return Ok(true);
                }
            }
        }

        let (volume, op) = self.pending.expect("set above");
        if ctx.app.frontend_ref()?.poll_op(op).is_none() {
            return Ok(false);
        }

        let (result, spawns) = {
            let (settings, frontend) = ctx.app.frontend_parts()?;
            frontend.finish_op(volume, op, now, settings)
        };
        ctx.spawn_all(spawns);
        self.pending = None;

        match result {
            Ok(data) => req.response_content = data,
            Err(e) => req.response_status = e.http_status(),
        }
        Ok(true)
    }

    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        if req.response_status == 200 {
            req.set_response_header("Content-Type", "application/octet-stream");
        }
        Ok(true)
    }

    fn on_close(&mut self, app: &mut App) {
        if let Some((volume, op)) = self.pending.take() {
            abandon(app, volume, op);
        }
    }
}

/// `POST /write_block?volume=<uuid>&block=<n>` with a one-block body.
pub struct WriteBlockService {
    volume: Uuid,
    block: u64,
    data: Vec<u8>,
    pending: Option<(Uuid, OpId)>,
}

impl WriteBlockService {
    pub fn new() -> WriteBlockService {
        WriteBlockService {
            volume: Uuid::nil(),
            block: 0,
            data: Vec::new(),
            pending: None,
        }
    }
}

impl Service for WriteBlockService {
    fn wanted_args(&self) -> &'static [&'static str] {
        &["volume", "block"]
    }

    fn wanted_headers(&self) -> &'static [&'static str] {
        &["Content-Length"]
    }

    fn before_content(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        self.volume = volume_arg(req)?;
        self.block = block_arg(req)?;

        let frontend = ctx.app.frontend_ref()?;
        let block_size = frontend
            .volumes
            .get(&self.volume)
            .map(|vol| vol.block_size)
            .ok_or(Error::DiskMissing)?;

        if req.content_length != block_size as usize {
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

    fn before_response_status(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let now = ctx.now;

        if self.pending.is_none() {
            let data = std::mem::take(&mut self.data);

            let started = {
                let (settings, frontend) = ctx.app.frontend_parts()?;
                frontend.start_write(self.volume, self.block, data, now, settings)
            };

            match started {
                Ok((op, spawns)) => {
                    ctx.spawn_all(spawns);
                    self.pending = Some((self.volume, op));
                }
                Err(e) => {
                    req.response_status = e.http_status();
                    return Ok(true);
                }
            }
        }

        let (volume, op) = self.pending.expect("set above");
        if ctx.app.frontend_ref()?.poll_op(op).is_none() {
            return Ok(false);
        }

        let (result, spawns) = {
            let (settings, frontend) = ctx.app.frontend_parts()?;
            frontend.finish_op(volume, op, now, settings)
        };
        ctx.spawn_all(spawns);
        self.pending = None;

        if let Err(e) = result {
            req.response_status = e.http_status();
        }
        Ok(true)
    }

    fn on_close(&mut self, app: &mut App) {
        if let Some((volume, op)) = self.pending.take() {
            abandon(app, volume, op);
        }
    }
}

/// `POST /init_volume?volume=<uuid>`: bind every announced disk and write
/// the headers.
pub struct InitVolumeService {
    pending: Option<(Uuid, OpId)>,
}

impl InitVolumeService {
    pub fn new() -> InitVolumeService {
        InitVolumeService { pending: None }
    }
}

impl Service for InitVolumeService {
    fn wanted_args(&self) -> &'static [&'static str] {
        &["volume"]
    }

    fn before_response_status(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let now = ctx.now;

        if self.pending.is_none() {
            let volume = volume_arg(req)?;

            let started = {
                let (settings, frontend) = ctx.app.frontend_parts()?;
                frontend.start_init(volume, now, settings)
            };

            match started {
                Ok((op, spawns)) => {
                    ctx.spawn_all(spawns);
                    self.pending = Some((volume, op));
                }
                Err(e) => {
                    req.response_status = e.http_status();
                    return Ok(true);
                }
            }
        }

        let (volume, op) = self.pending.expect("set above");
        if ctx.app.frontend_ref()?.poll_op(op).is_none() {
            return Ok(false);
        }

        let (result, spawns) = {
            let (settings, frontend) = ctx.app.frontend_parts()?;
            frontend.finish_init(volume, op, now, settings)
        };
        ctx.spawn_all(spawns);
        self.pending = None;

        match result {
            Ok(()) => req.response_content = b"volume initialized\n".to_vec(),
            Err(e) => req.response_status = e.http_status(),
        }
        Ok(true)
    }

    fn on_close(&mut self, app: &mut App) {
        if let Some((volume, op)) = self.pending.take() {
            abandon(app, volume, op);
        }
    }
}

/// `GET /volumes`: a plain status page.
pub struct ListVolumesService;

impl ListVolumesService {
    pub fn new() -> ListVolumesService {
        ListVolumesService
    }
}

impl Service for ListVolumesService {
    fn before_response_headers(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let frontend = ctx.app.frontend_ref()?;
        let mut html = String::new();

        html.push_str("<html><head><title>volumes</title></head><body>\n");

        for vol in frontend.volumes.values() {
            html.push_str(&format!(
                "<h2>volume {} &mdash; {}</h2>\n<ul>\n",
                vol.uuid,
                vol.state.as_str()
            ));

            for (index, slot) in vol.slots.iter().enumerate() {
                match slot {
                    Some(slot) => html.push_str(&format!(
                        "<li>slot {}: disk {} at {} ({}, generation {})</li>\n",
                        index,
                        slot.disk_uuid,
                        slot.address,
                        slot.state.as_str(),
                        slot.generation
                    )),
                    None => html.push_str(&format!("<li>slot {}: empty</li>\n", index)),
                }
            }

            if let Some(rebuild) = &vol.rebuild {
                html.push_str(&format!(
                    "<li>rebuilding slot {}: stripe {} of {}</li>\n",
                    rebuild.disk_index, rebuild.next_stripe, vol.block_count
                ));
            }

            html.push_str("</ul>\n");
        }

        html.push_str(&format!(
            "<p>{} disks announced</p>\n</body></html>\n",
            frontend.available_disks.len()
        ));

        req.set_response_header("Content-Length", html.len());
        req.set_response_header("Content-Type", "text/html");
        req.response_content = html.into_bytes();
        Ok(true)
    }
}
