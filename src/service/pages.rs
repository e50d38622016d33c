//! Plain page services: static files and the clock.

use std::path::PathBuf;

use chrono::Local;
use log::debug;

use crate::error::Result;
use crate::http::RequestContext;
use crate::pollable::Context;
use crate::sys::FileDesc;

use super::Service;

fn mime_for(path: &PathBuf) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("png") => "image/png",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Streams one file off disk, `max_buffer` bytes at a time.
pub struct GetFileService {
    file_name: PathBuf,
    file: Option<FileDesc>,
    size: u64,
    offset: u64,
}

impl GetFileService {
    pub fn new(file_name: PathBuf) -> GetFileService {
        GetFileService {
            file_name,
            file: None,
            size: 0,
            offset: 0,
        }
    }
}

impl Service for GetFileService {
    fn before_response_status(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        match FileDesc::open_ro(&self.file_name) {
            Ok(file) => {
                self.size = file.len()?;
                self.file = Some(file);
            }
            Err(e) => {
                debug!("cannot open {:?}: {}", self.file_name, e);
                req.response_status = 404;
            }
        }
        Ok(true)
    }

    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        if self.file.is_some() {
            req.set_response_header("Content-Length", self.size);
            req.set_response_header("Content-Type", mime_for(&self.file_name));
        }
        Ok(true)
    }

    fn before_response_content(
        &mut self,
        _req: &mut RequestContext,
        out: &mut Vec<u8>,
        max_buffer: usize,
        _ctx: &mut Context,
    ) -> Result<bool> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(true),
        };

        while out.len() < max_buffer && self.offset < self.size {
            let want = std::cmp::min(max_buffer - out.len(), (self.size - self.offset) as usize);
            let mut chunk = vec![0u8; want];
            let got = file.read_at(&mut chunk, self.offset)?;
            if got == 0 {
                break;
            }
            chunk.truncate(got);
            self.offset += got as u64;
            out.extend_from_slice(&chunk);
        }

        if self.offset >= self.size {
            self.file = None;
            return Ok(true);
        }

        Ok(false)
    }

    fn on_close(&mut self, _app: &mut crate::app::App) {
        self.file = None;
    }
}

/// Tells the time. Mostly useful for poking at a server by hand.
pub struct ClockService;

impl ClockService {
    pub fn new() -> ClockService {
        ClockService
    }
}

impl Default for ClockService {
    fn default() -> ClockService {
        ClockService
    }
}

impl Service for ClockService {
    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        req.set_response_header("Content-Length", now.len());
        req.set_response_header("Content-Type", "text/plain");
        req.response_content = now.into_bytes();
        Ok(true)
    }
}
