use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, trace, warn};

use crate::app::App;
use crate::error::{Error, Result};
use crate::http::{self, RequestContext};
use crate::poller::Ready;
use crate::service::Service;
use crate::sys;

use super::{Context, Pollable};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    GetRequest,
    GetHeaders,
    GetContent,
    SendStatus,
    SendHeaders,
    SendContent,
    Closing,
}

/// One accepted HTTP connection, driven through request and response phases.
///
/// The connection advances whenever its socket is ready; a service hook that
/// returns false leaves the state untouched and the next poll round retries.
/// While a response phase waits on something else (a block device client,
/// usually) the socket keeps write interest, so the hook is polled every
/// round until it moves.
pub struct ServiceSocket {
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    request: RequestContext,
    service: Option<Box<dyn Service>>,
}

impl ServiceSocket {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> ServiceSocket {
        ServiceSocket {
            stream,
            peer,
            state: State::GetRequest,
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            request: RequestContext::new(),
            service: None,
        }
    }

    fn receiving(&self) -> bool {
        matches!(
            self.state,
            State::GetRequest | State::GetHeaders | State::GetContent
        )
    }

    fn sending(&self) -> bool {
        matches!(
            self.state,
            State::SendStatus | State::SendHeaders | State::SendContent
        )
    }

    /// Fails the exchange before any response bytes went out: answer with
    /// the error's status, then close.
    fn fail_request(&mut self, app: &mut App, status: u16) {
        if let Some(mut service) = self.service.take() {
            service.on_close(app);
        }

        self.request.response_status = status;
        self.request.response_headers.clear();
        self.request.response_content.clear();
        self.request.set_response_header("Connection", "close");
        self.state = State::SendStatus;
    }

    /// Fails the exchange after the status line went out; nothing sensible
    /// is left to say, so flush and close.
    fn fail_response(&mut self, app: &mut App) {
        if let Some(mut service) = self.service.take() {
            service.on_close(app);
        }
        self.state = State::Closing;
    }

    fn advance(&mut self, ctx: &mut Context) {
        loop {
            match self.state {
                State::GetRequest => {
                    let line_end = match http::find(&self.recv_buf, http::CRLF) {
                        Some(pos) => pos,
                        None => return,
                    };

                    let line: Vec<u8> = self.recv_buf.drain(..line_end + 2).collect();
                    if line_end == 0 {
                        // stray blank line between pipelined requests
                        continue;
                    }

                    let parsed = match http::parse_request_line(&line[..line_end]) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            debug!("{}: bad request line: {}", self.peer, e);
                            self.fail_request(ctx.app, e.http_status());
                            continue;
                        }
                    };

                    let service = match ctx.app.registry.create(&parsed.path) {
                        Some(service) => service,
                        None => {
                            let e = Error::ServiceNotFound(parsed.path);
                            debug!("{}: {}", self.peer, e);
                            self.fail_request(ctx.app, e.http_status());
                            continue;
                        }
                    };

                    trace!("{}: {} {}", self.peer, parsed.method, parsed.path);
                    self.request.method = parsed.method;
                    self.request.uri = parsed.path;
                    self.request.args = http::parse_query(&parsed.query);
                    self.service = Some(service);
                    self.state = State::GetHeaders;
                }

                State::GetHeaders => {
                    let line_end = match http::find(&self.recv_buf, http::CRLF) {
                        Some(pos) => pos,
                        None => return,
                    };

                    let line: Vec<u8> = self.recv_buf.drain(..line_end + 2).collect();
                    if line_end > 0 {
                        match http::parse_header_line(&line[..line_end]) {
                            Ok((name, value)) => {
                                self.request.headers.insert(name, value);
                            }
                            Err(e) => {
                                debug!("{}: bad header: {}", self.peer, e);
                                self.fail_request(ctx.app, e.http_status());
                            }
                        }
                        continue;
                    }

                    // empty line: the header block is complete
                    if let Err(e) = self.finish_headers(ctx) {
                        debug!("{}: {}", self.peer, e);
                        self.fail_request(ctx.app, e.http_status());
                    }
                }

                State::GetContent => {
                    let missing = self.request.content_length - self.request.received;
                    let take = std::cmp::min(missing, self.recv_buf.len());

                    if take > 0 {
                        let chunk: Vec<u8> = self.recv_buf.drain(..take).collect();
                        self.request.received += take;

                        let service = self.service.as_mut().expect("service set with content");
                        if let Err(e) = service.handle_content(&mut self.request, &chunk, ctx) {
                            warn!("{}: content handler failed: {}", self.peer, e);
                            self.fail_request(ctx.app, e.http_status());
                            continue;
                        }
                    }

                    if self.request.received == self.request.content_length {
                        self.state = State::SendStatus;
                    } else {
                        return;
                    }
                }

                State::SendStatus => {
                    match self.call_hook(ctx, |service, req, ctx| {
                        service.before_response_status(req, ctx)
                    }) {
                        Ok(true) => {
                            let status = self.request.response_status;
                            self.send_buf.extend_from_slice(
                                format!(
                                    "{} {} {}\r\n",
                                    http::VERSION,
                                    status,
                                    http::reason(status)
                                )
                                .as_bytes(),
                            );
                            self.state = State::SendHeaders;
                        }
                        Ok(false) => return,
                        Err(e) => {
                            warn!("{}: {}", self.peer, e);
                            self.fail_request(ctx.app, e.http_status());
                        }
                    }
                }

                State::SendHeaders => {
                    match self.call_hook(ctx, |service, req, ctx| {
                        service.before_response_headers(req, ctx)
                    }) {
                        Ok(true) => {
                            if !self.request.has_response_header("Content-Length") {
                                let len = self.request.response_content.len();
                                self.request.set_response_header("Content-Length", len);
                            }

                            for (name, value) in &self.request.response_headers {
                                self.send_buf
                                    .extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
                            }
                            self.send_buf.extend_from_slice(http::CRLF);

                            let body = std::mem::take(&mut self.request.response_content);
                            self.send_buf.extend_from_slice(&body);
                            self.state = State::SendContent;
                        }
                        Ok(false) => return,
                        Err(e) => {
                            warn!("{}: {}", self.peer, e);
                            self.fail_response(ctx.app);
                        }
                    }
                }

                State::SendContent => {
                    // back-pressure: let the buffer drain before growing it
                    if self.send_buf.len() >= ctx.app.settings.max_buffer {
                        return;
                    }

                    let max_buffer = ctx.app.settings.max_buffer;
                    let result = match self.service.as_mut() {
                        Some(service) => service.before_response_content(
                            &mut self.request,
                            &mut self.send_buf,
                            max_buffer,
                            ctx,
                        ),
                        None => Ok(true),
                    };

                    match result {
                        Ok(true) => self.finish_exchange(),
                        Ok(false) => return,
                        Err(e) => {
                            warn!("{}: {}", self.peer, e);
                            self.fail_response(ctx.app);
                        }
                    }
                }

                State::Closing => return,
            }
        }
    }

    /// Header-block validation plus the `before_content` hook.
    fn finish_headers(&mut self, ctx: &mut Context) -> Result<()> {
        let service = self.service.as_mut().expect("service set after request line");

        for wanted in service.wanted_headers() {
            if self.request.header(wanted).is_none() {
                return Err(Error::ProtocolMalformed);
            }
        }

        let wanted_args = service.wanted_args();
        if !wanted_args.is_empty() || !self.request.args.is_empty() {
            let all_present = wanted_args
                .iter()
                .all(|arg| self.request.args.contains_key(*arg));
            if !all_present || self.request.args.len() != wanted_args.len() {
                return Err(Error::ProtocolMalformed);
            }
        }

        self.request.content_length = match self.request.header("content-length") {
            Some(value) => value.parse().map_err(|_| Error::ProtocolMalformed)?,
            None => 0,
        };

        let wants_content = service.before_content(&mut self.request, ctx)?;

        self.state = if wants_content && self.request.content_length > 0 {
            State::GetContent
        } else {
            State::SendStatus
        };

        Ok(())
    }

    fn call_hook<F>(&mut self, ctx: &mut Context, hook: F) -> Result<bool>
    where
        F: FnOnce(&mut Box<dyn Service>, &mut RequestContext, &mut Context) -> Result<bool>,
    {
        match self.service.as_mut() {
            Some(service) => hook(service, &mut self.request, ctx),
            None => Ok(true),
        }
    }

    /// Response complete: either reuse the connection or wind it down.
    fn finish_exchange(&mut self) {
        if self.request.wants_close() {
            self.state = State::Closing;
        } else {
            trace!("{}: keep-alive, awaiting next request", self.peer);
            self.service = None;
            self.request = RequestContext::new();
            self.state = State::GetRequest;
        }
    }
}

impl Pollable for ServiceSocket {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn interest(&self, app: &App, _pollables: usize) -> Ready {
        let mut interest = Ready::error();

        if self.receiving() && self.recv_buf.len() < app.settings.max_buffer {
            interest |= Ready::readable();
        }
        if self.sending() || !self.send_buf.is_empty() {
            interest |= Ready::writable();
        }

        interest
    }

    fn on_read(&mut self, ctx: &mut Context) {
        if !self.receiving() {
            return;
        }

        let mut chunk = vec![0u8; ctx.app.settings.max_buffer.max(512)];

        match self.stream.read(&mut chunk) {
            Ok(0) => {
                debug!("{}: peer closed", self.peer);
                if let Some(mut service) = self.service.take() {
                    service.on_close(ctx.app);
                }
                self.send_buf.clear();
                self.state = State::Closing;
            }
            Ok(n) => {
                self.recv_buf.extend_from_slice(&chunk[..n]);
                self.advance(ctx);
            }
            Err(ref e) if sys::would_block(e) => {}
            Err(ref e) if sys::interrupted(e) => {}
            Err(e) => {
                warn!("{}: read failed: {}", self.peer, e);
                if let Some(mut service) = self.service.take() {
                    service.on_close(ctx.app);
                }
                self.send_buf.clear();
                self.state = State::Closing;
            }
        }
    }

    fn on_write(&mut self, ctx: &mut Context) {
        let flush = std::cmp::min(self.send_buf.len(), ctx.app.settings.max_buffer);

        if flush > 0 {
            match self.stream.write(&self.send_buf[..flush]) {
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(ref e) if sys::would_block(e) => {}
                Err(ref e) if sys::interrupted(e) => {}
                Err(e) => {
                    warn!("{}: write failed: {}", self.peer, e);
                    self.send_buf.clear();
                    self.fail_response(ctx.app);
                    return;
                }
            }
        }

        if self.sending() {
            self.advance(ctx);
        }
    }

    fn on_error(&mut self, ctx: &mut Context) {
        if self.state != State::Closing {
            debug!("{}: socket error, closing", self.peer);
            if let Some(mut service) = self.service.take() {
                service.on_close(ctx.app);
            }
            self.send_buf.clear();
            self.state = State::Closing;
        }
    }

    fn on_close(&mut self, app: &mut App) {
        if let Some(mut service) = self.service.take() {
            service.on_close(app);
        }
    }

    fn is_terminating(&self) -> bool {
        self.state == State::Closing
    }

    fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }
}
