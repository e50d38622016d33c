use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::str;

use log::{debug, warn};

use crate::app::App;
use crate::config::MulticastConfig;
use crate::poller::Ready;
use crate::sys;
use crate::uuid::Uuid;

use super::{Context, Pollable, SEP};

/// Decodes one announcement datagram into
/// `(disk_uuid, bind_port, volume_uuid)`.
pub fn parse_beacon(data: &[u8]) -> Option<(Uuid, u16, Uuid)> {
    let parts: Vec<&[u8]> = data.split(|&b| b == SEP).collect();

    // four separators leave five fields, the last two empty
    if parts.len() < 5 || !parts[3].is_empty() {
        return None;
    }

    let disk_uuid: Uuid = str::from_utf8(parts[0]).ok()?.parse().ok()?;
    let port: u16 = str::from_utf8(parts[1]).ok()?.parse().ok()?;
    let volume_uuid: Uuid = str::from_utf8(parts[2]).ok()?.parse().ok()?;

    Some((disk_uuid, port, volume_uuid))
}

/// The frontend's side of discovery: collects beacons into the available
/// disk table.
pub struct IdentifierSocket {
    socket: UdpSocket,
}

impl IdentifierSocket {
    pub fn new(multicast: &MulticastConfig) -> io::Result<IdentifierSocket> {
        let socket = sys::multicast_listener(multicast.address, multicast.port)?;
        Ok(IdentifierSocket { socket })
    }
}

impl Pollable for IdentifierSocket {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn interest(&self, _app: &App, _pollables: usize) -> Ready {
        Ready::readable() | Ready::error()
    }

    fn on_read(&mut self, ctx: &mut Context) {
        let mut buf = [0u8; 512];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let Some((disk_uuid, port, volume_uuid)) = parse_beacon(&buf[..len]) else {
                        debug!("discarding malformed beacon from {}", from);
                        continue;
                    };

                    let address = SocketAddr::new(from.ip(), port);
                    let now = ctx.now;
                    match ctx.app.frontend_mut() {
                        Ok(frontend) => {
                            frontend.record_beacon(disk_uuid, address, volume_uuid, now)
                        }
                        Err(e) => {
                            warn!("beacon on a non-frontend server: {}", e);
                            return;
                        }
                    }
                }
                Err(ref e) if sys::would_block(e) => break,
                Err(ref e) if sys::interrupted(e) => {}
                Err(e) => {
                    warn!("multicast receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn is_terminating(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::super::declarer::encode_beacon;
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let disk: Uuid = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        let volume: Uuid = "ffeeddcc-bbaa-9988-7766-554433221100".parse().unwrap();

        let beacon = encode_beacon(disk, 9999, volume);
        assert_eq!(parse_beacon(&beacon), Some((disk, 9999, volume)));
    }

    #[test]
    fn rejects_malformed_beacons() {
        assert_eq!(parse_beacon(b""), None);
        assert_eq!(parse_beacon(b"no separators at all"), None);
        assert_eq!(parse_beacon(b"a\x1fb\x1fc\x1f\x1f"), None);

        // missing the trailing double separator
        let disk: Uuid = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        let truncated = format!("{}\x1f80\x1f{}", disk, disk);
        assert_eq!(parse_beacon(truncated.as_bytes()), None);
    }
}
