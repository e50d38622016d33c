use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::app::App;
use crate::error::{Error, Result};
use crate::http::{self, Method};
use crate::orchestrator::OpId;
use crate::poller::Ready;
use crate::sys;
use crate::uuid::Uuid;

use super::{Context, Pollable};

/// How a sub-request failure is classified before it reaches the
/// orchestrator.
#[derive(Debug)]
pub enum ClientError {
    Connect,
    Timeout,
    BadStatus(u16),
    ShortResponse,
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Error {
        match e {
            ClientError::Connect => Error::PeerUnreachable,
            ClientError::Timeout => Error::TimeoutExceeded,
            ClientError::BadStatus(_) => Error::PeerUnreachable,
            ClientError::ShortResponse => Error::PeerUnreachable,
        }
    }
}

/// Who gets told when this client's exchange settles. Always an id, never a
/// reference; the waiter may be long gone by then.
#[derive(Debug, Copy, Clone)]
pub enum ClientPurpose {
    Orchestrated { volume: Uuid, op: OpId, sub: usize },
    DiskProbe { disk: Uuid },
}

/// One outbound HTTP exchange.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: String,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn get(uri: String) -> OutboundRequest {
        OutboundRequest {
            method: Method::Get,
            uri,
            body: Vec::new(),
        }
    }

    pub fn post(uri: String, body: Vec<u8>) -> OutboundRequest {
        OutboundRequest {
            method: Method::Post,
            uri,
            body,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Connecting,
    Sending,
    RecvStatus,
    RecvHeaders,
    RecvContent,
    Closing,
}

/// The outbound counterpart of a service socket: connects to a block
/// device, writes one framed request and collects the response.
pub struct BlockDeviceClient {
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    status: u16,
    content_length: usize,
    body: Vec<u8>,
    purpose: Option<ClientPurpose>,
    deadline: Instant,
}

impl BlockDeviceClient {
    /// Starts a non-blocking connect and queues the request bytes.
    pub fn connect(
        addr: SocketAddr,
        request: OutboundRequest,
        purpose: ClientPurpose,
        deadline: Instant,
    ) -> Result<BlockDeviceClient> {
        let stream = sys::connect_stream(&addr)?;

        let mut send_buf = Vec::new();
        send_buf.extend_from_slice(
            format!("{} {} {}\r\n", request.method, request.uri, http::VERSION).as_bytes(),
        );
        send_buf.extend_from_slice(
            format!("Content-Length: {}\r\n\r\n", request.body.len()).as_bytes(),
        );
        send_buf.extend_from_slice(&request.body);

        Ok(BlockDeviceClient {
            stream,
            peer: addr,
            state: State::Connecting,
            send_buf,
            recv_buf: Vec::new(),
            status: 0,
            content_length: 0,
            body: Vec::new(),
            purpose: Some(purpose),
            deadline,
        })
    }

    /// Delivers the outcome to whoever registered for it, exactly once.
    fn settle(&mut self, ctx: &mut Context, outcome: Result<Vec<u8>>) {
        self.state = State::Closing;

        let purpose = match self.purpose.take() {
            Some(purpose) => purpose,
            None => return,
        };

        let now = ctx.now;
        let spawned = match purpose {
            ClientPurpose::Orchestrated { volume, op, sub } => {
                match ctx.app.frontend_parts() {
                    Ok((settings, frontend)) => {
                        frontend.handle_sub_result(volume, op, sub, outcome, now, settings)
                    }
                    Err(e) => {
                        warn!("orphaned block device client: {}", e);
                        Vec::new()
                    }
                }
            }
            ClientPurpose::DiskProbe { disk } => {
                if let Ok(frontend) = ctx.app.frontend_mut() {
                    frontend.handle_probe(disk, outcome, now);
                }
                Vec::new()
            }
        };

        ctx.spawn_all(spawned);
    }

    fn fail(&mut self, ctx: &mut Context, e: ClientError) {
        debug!("request to {} failed: {:?}", self.peer, e);
        self.settle(ctx, Err(e.into()));
    }

    /// Parses whatever is sitting in `recv_buf`. Returns the finished body
    /// when the response is complete.
    fn parse(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                State::RecvStatus => {
                    let line_end = match http::find(&self.recv_buf, http::CRLF) {
                        Some(pos) => pos,
                        None => return Ok(None),
                    };

                    let line: Vec<u8> = self.recv_buf.drain(..line_end + 2).collect();
                    self.status = parse_status_line(&line[..line_end])?;
                    self.state = State::RecvHeaders;
                }

                State::RecvHeaders => {
                    let line_end = match http::find(&self.recv_buf, http::CRLF) {
                        Some(pos) => pos,
                        None => return Ok(None),
                    };

                    let line: Vec<u8> = self.recv_buf.drain(..line_end + 2).collect();
                    if line_end == 0 {
                        self.state = State::RecvContent;
                        continue;
                    }

                    let (name, value) = http::parse_header_line(&line[..line_end])?;
                    if name == "content-length" {
                        self.content_length =
                            value.parse().map_err(|_| Error::ProtocolMalformed)?;
                    }
                }

                State::RecvContent => {
                    let missing = self.content_length - self.body.len();
                    let take = std::cmp::min(missing, self.recv_buf.len());
                    self.body.extend(self.recv_buf.drain(..take));

                    if self.body.len() == self.content_length {
                        return Ok(Some(std::mem::take(&mut self.body)));
                    }
                    return Ok(None);
                }

                _ => return Ok(None),
            }
        }
    }

    fn drive_read(&mut self, ctx: &mut Context) {
        let max_buffer = ctx.app.settings.max_buffer;
        let mut chunk = vec![0u8; max_buffer.max(512)];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.fail(ctx, ClientError::ShortResponse);
                    return;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);

                    match self.parse() {
                        Ok(Some(body)) => {
                            trace!("{} answered {}", self.peer, self.status);
                            if self.status == 200 {
                                self.settle(ctx, Ok(body));
                            } else {
                                let status = self.status;
                                self.fail(ctx, ClientError::BadStatus(status));
                            }
                            return;
                        }
                        Ok(None) => {}
                        Err(_) => {
                            self.fail(ctx, ClientError::ShortResponse);
                            return;
                        }
                    }
                }
                Err(ref e) if sys::would_block(e) => return,
                Err(ref e) if sys::interrupted(e) => {}
                Err(_) => {
                    self.fail(ctx, ClientError::ShortResponse);
                    return;
                }
            }
        }
    }
}

fn parse_status_line(line: &[u8]) -> Result<u16> {
    let line = std::str::from_utf8(line).map_err(|_| Error::ProtocolMalformed)?;
    let mut parts = line.split(' ');

    let version = parts.next().ok_or(Error::ProtocolMalformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::ProtocolMalformed);
    }

    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(Error::ProtocolMalformed)
}

impl Pollable for BlockDeviceClient {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn interest(&self, _app: &App, _pollables: usize) -> Ready {
        let mut interest = Ready::error();

        match self.state {
            State::Connecting | State::Sending => interest |= Ready::writable(),
            State::RecvStatus | State::RecvHeaders | State::RecvContent => {
                interest |= Ready::readable()
            }
            State::Closing => {}
        }

        interest
    }

    fn on_write(&mut self, ctx: &mut Context) {
        if self.state == State::Connecting {
            match self.stream.take_error() {
                Ok(None) => self.state = State::Sending,
                Ok(Some(e)) => {
                    debug!("connect to {} failed: {}", self.peer, e);
                    self.fail(ctx, ClientError::Connect);
                    return;
                }
                Err(_) => {
                    self.fail(ctx, ClientError::Connect);
                    return;
                }
            }
        }

        if self.state != State::Sending {
            return;
        }

        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => {
                    self.fail(ctx, ClientError::Connect);
                    return;
                }
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(ref e) if sys::would_block(e) => return,
                Err(ref e) if sys::interrupted(e) => {}
                Err(e) => {
                    debug!("send to {} failed: {}", self.peer, e);
                    self.fail(ctx, ClientError::Connect);
                    return;
                }
            }
        }

        self.state = State::RecvStatus;
    }

    fn on_read(&mut self, ctx: &mut Context) {
        match self.state {
            State::RecvStatus | State::RecvHeaders | State::RecvContent => self.drive_read(ctx),
            _ => {}
        }
    }

    fn on_error(&mut self, ctx: &mut Context) {
        if self.state != State::Closing {
            let e = if self.state == State::Connecting {
                ClientError::Connect
            } else {
                ClientError::ShortResponse
            };
            self.fail(ctx, e);
        }
    }

    fn on_idle(&mut self, ctx: &mut Context) {
        if self.state != State::Closing && ctx.now >= self.deadline {
            warn!("request to {} timed out", self.peer);
            self.fail(ctx, ClientError::Timeout);
        }
    }

    fn on_close(&mut self, _app: &mut App) {
        // a client reaped before settling still owes its waiter an answer,
        // but on_close has no context to deliver it; the idle timeout covers
        // that path
        self.purpose = None;
    }

    fn is_terminating(&self) -> bool {
        self.state == State::Closing
    }
}
