//! Discovery-channel tests: a real datagram through a real identifier
//! socket, no reactor required.

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use raid5d::app::{App, Settings};
use raid5d::config::{FrontendConfig, MulticastConfig, VolumeConfig};
use raid5d::disk::DEFAULT_BLOCK_SIZE;
use raid5d::pollable::{encode_beacon, Context, IdentifierSocket, Pollable};
use raid5d::uuid::Uuid;

fn frontend_app(volume_uuid: Uuid, multicast: MulticastConfig) -> App {
    let config = FrontendConfig {
        volumes: vec![VolumeConfig {
            volume_uuid,
            long_password: "pw".into(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 8,
        }],
        multicast,
        long_password: "pw".into(),
    };

    App::frontend(Settings::default(), config)
}

#[test]
fn beacon_lands_in_available_disks() {
    let multicast = MulticastConfig {
        address: "239.255.42.97".parse().unwrap(),
        port: 18743,
    };

    let volume_uuid: Uuid = "00000000-0000-0000-0000-0000000000aa".parse().unwrap();
    let disk_uuid: Uuid = "00000000-0000-0000-0000-0000000000d7".parse().unwrap();

    let mut identifier = match IdentifierSocket::new(&multicast) {
        Ok(identifier) => identifier,
        Err(e) => {
            eprintln!("skipping, cannot join multicast group here: {}", e);
            return;
        }
    };
    let mut app = frontend_app(volume_uuid, multicast);

    // the identifier listens on its port for anything addressed to it; a
    // plain unicast datagram exercises the same receive path as multicast
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let beacon = encode_beacon(disk_uuid, 8123, volume_uuid);
    sender
        .send_to(&beacon, ("127.0.0.1", 18743))
        .unwrap();

    thread::sleep(Duration::from_millis(50));

    let mut ctx = Context::new(&mut app, 1, Instant::now());
    identifier.on_read(&mut ctx);

    let frontend = app.frontend_ref().unwrap();
    let disk = frontend
        .available_disks
        .get(&disk_uuid)
        .expect("beacon should have registered the disk");

    assert_eq!(disk.address.port(), 8123);
    assert_eq!(disk.volume_uuid, volume_uuid);
    assert_eq!(disk.address.ip().to_string(), "127.0.0.1");
}

#[test]
fn garbage_datagrams_are_ignored() {
    let multicast = MulticastConfig {
        address: "239.255.42.96".parse().unwrap(),
        port: 18744,
    };

    let volume_uuid: Uuid = "00000000-0000-0000-0000-0000000000aa".parse().unwrap();

    let mut identifier = match IdentifierSocket::new(&multicast) {
        Ok(identifier) => identifier,
        Err(e) => {
            eprintln!("skipping, cannot join multicast group here: {}", e);
            return;
        }
    };
    let mut app = frontend_app(volume_uuid, multicast);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .send_to(b"not a beacon at all", ("127.0.0.1", 18744))
        .unwrap();

    thread::sleep(Duration::from_millis(50));

    let mut ctx = Context::new(&mut app, 1, Instant::now());
    identifier.on_read(&mut ctx);

    assert!(app.frontend_ref().unwrap().available_disks.is_empty());
}
