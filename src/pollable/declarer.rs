use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{trace, warn};

use crate::app::App;
use crate::config::MulticastConfig;
use crate::poller::Ready;
use crate::sys;
use crate::uuid::Uuid;

use super::{Context, Pollable, SEP};

/// Builds one announcement datagram:
/// `disk_uuid SEP bind_port SEP volume_uuid SEP SEP`.
pub fn encode_beacon(disk_uuid: Uuid, bind_port: u16, volume_uuid: Uuid) -> Vec<u8> {
    let mut beacon = Vec::new();
    beacon.extend_from_slice(disk_uuid.to_string().as_bytes());
    beacon.push(SEP);
    beacon.extend_from_slice(bind_port.to_string().as_bytes());
    beacon.push(SEP);
    beacon.extend_from_slice(volume_uuid.to_string().as_bytes());
    beacon.push(SEP);
    beacon.push(SEP);
    beacon
}

/// The block device's side of discovery: one beacon per idle tick, for the
/// life of the process.
pub struct DeclarerSocket {
    socket: UdpSocket,
    group: SocketAddr,
    beacon: Vec<u8>,
}

impl DeclarerSocket {
    pub fn new(
        multicast: &MulticastConfig,
        disk_uuid: Uuid,
        volume_uuid: Uuid,
        bind_port: u16,
    ) -> io::Result<DeclarerSocket> {
        let socket = sys::multicast_sender()?;

        Ok(DeclarerSocket {
            socket,
            group: SocketAddr::from((multicast.address, multicast.port)),
            beacon: encode_beacon(disk_uuid, bind_port, volume_uuid),
        })
    }
}

impl Pollable for DeclarerSocket {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn interest(&self, _app: &App, _pollables: usize) -> Ready {
        Ready::error()
    }

    fn on_idle(&mut self, _ctx: &mut Context) {
        match self.socket.send_to(&self.beacon, self.group) {
            Ok(_) => trace!("declared to {}", self.group),
            Err(ref e) if sys::would_block(e) => {}
            Err(e) => warn!("multicast declare failed: {}", e),
        }
    }

    fn is_terminating(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_layout() {
        let disk: Uuid = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        let volume: Uuid = "ffeeddcc-bbaa-9988-7766-554433221100".parse().unwrap();

        let beacon = encode_beacon(disk, 8081, volume);

        let parts: Vec<&[u8]> = beacon.split(|&b| b == SEP).collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], disk.to_string().as_bytes());
        assert_eq!(parts[1], b"8081");
        assert_eq!(parts[2], volume.to_string().as_bytes());
        assert!(parts[3].is_empty());
        assert!(parts[4].is_empty());
    }
}
