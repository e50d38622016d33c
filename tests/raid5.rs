//! Full-stack test: a frontend orchestrating three block device servers.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use raid5d::app::{App, Settings};
use raid5d::config::{DeviceConfig, FrontendConfig, MulticastConfig, VolumeConfig};
use raid5d::disk::{BlockFile, DEFAULT_BLOCK_SIZE};
use raid5d::pollable::ListenerSocket;
use raid5d::poller::PollType;
use raid5d::reactor::AsyncServer;
use raid5d::uuid::Uuid;

const VOLUME: &str = "00000000-0000-0000-0000-0000000000aa";

fn multicast() -> MulticastConfig {
    MulticastConfig {
        address: "239.255.42.98".parse().unwrap(),
        port: 15998,
    }
}

fn temp_disk(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("raid5d-raid-{}-{}", tag, std::process::id()))
}

fn start_device(tag: &str, disk_uuid: Uuid) -> (SocketAddr, PathBuf) {
    let disk = temp_disk(tag);
    let _ = std::fs::remove_file(&disk);

    let config = DeviceConfig {
        disk_name: disk.clone(),
        disk_info_name: None,
        disk_uuid,
        volume_uuid: VOLUME.parse().unwrap(),
        multicast: multicast(),
        long_password: "opensesame".into(),
    };

    let blockfile = BlockFile::open(&disk, DEFAULT_BLOCK_SIZE).unwrap();

    let settings = Settings {
        bind_address: "127.0.0.1".parse().unwrap(),
        poll_timeout: Duration::from_millis(100),
        ..Settings::default()
    };

    let listener = ListenerSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let app = App::device(settings, config, blockfile);
    let mut server = AsyncServer::new(app, PollType::Poll);
    server.insert(Box::new(listener));

    thread::spawn(move || {
        let _ = server.run();
    });

    (addr, disk)
}

fn start_frontend(devices: &[(Uuid, SocketAddr)]) -> SocketAddr {
    let config = FrontendConfig {
        volumes: vec![VolumeConfig {
            volume_uuid: VOLUME.parse().unwrap(),
            long_password: "opensesame".into(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 8,
        }],
        multicast: multicast(),
        long_password: "opensesame".into(),
    };

    // a long poll timeout keeps the beacon watchdog quiet; discovery is fed
    // by hand below instead of over multicast
    let settings = Settings {
        bind_address: "127.0.0.1".parse().unwrap(),
        poll_timeout: Duration::from_secs(60),
        block_request_timeout: Duration::from_secs(10),
        ..Settings::default()
    };

    let listener = ListenerSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut app = App::frontend(settings, config);

    let now = Instant::now();
    let volume_uuid: Uuid = VOLUME.parse().unwrap();
    for &(disk_uuid, device_addr) in devices {
        app.frontend_mut()
            .unwrap()
            .record_beacon(disk_uuid, device_addr, volume_uuid, now);
    }

    let mut server = AsyncServer::new(app, PollType::Poll);
    server.insert(Box::new(listener));

    thread::spawn(move || {
        let _ = server.run();
    });

    addr
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .unwrap();
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn read_response(&mut self) -> (u16, Vec<u8>) {
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-response");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
        self.buf.drain(..header_end + 4);

        let status: u16 = head
            .lines()
            .next()
            .unwrap()
            .split(' ')
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();

        let content_length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().unwrap())
            })
            .unwrap_or(0);

        while self.buf.len() < content_length {
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-body");
            self.buf.extend_from_slice(&chunk[..n]);
        }

        let body: Vec<u8> = self.buf.drain(..content_length).collect();
        (status, body)
    }
}

fn read_physical_block(disk: &PathBuf, block: i64) -> Vec<u8> {
    let mut file = std::fs::File::open(disk).unwrap();
    let offset = DEFAULT_BLOCK_SIZE as u64 * (block + 1) as u64;
    let mut buf = vec![0u8; DEFAULT_BLOCK_SIZE as usize];

    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(offset)).unwrap();

    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]).unwrap() {
            0 => break,
            n => read += n,
        }
    }
    buf
}

#[test]
fn init_write_read_and_parity() {
    let d0: Uuid = "00000000-0000-0000-0000-0000000000b0".parse().unwrap();
    let d1: Uuid = "00000000-0000-0000-0000-0000000000b1".parse().unwrap();
    let d2: Uuid = "00000000-0000-0000-0000-0000000000b2".parse().unwrap();

    let (addr0, _disk0) = start_device("d0", d0);
    let (addr1, disk1) = start_device("d1", d1);
    let (addr2, disk2) = start_device("d2", d2);

    let front = start_frontend(&[(d0, addr0), (d1, addr1), (d2, addr2)]);
    let mut client = Client::connect(front);

    // initialize: headers land on all three disks
    client.send(
        format!("POST /init_volume?volume={} HTTP/1.1\r\nContent-Length: 0\r\n\r\n", VOLUME)
            .as_bytes(),
    );
    let (status, _) = client.read_response();
    assert_eq!(status, 200);

    // write logical block 1 (disk 1 of stripe 0)
    let ones = vec![0xffu8; DEFAULT_BLOCK_SIZE as usize];
    let mut request = format!(
        "POST /write_block?volume={}&block=1 HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        VOLUME,
        ones.len()
    )
    .into_bytes();
    request.extend_from_slice(&ones);
    client.send(&request);
    let (status, _) = client.read_response();
    assert_eq!(status, 200);

    // read it back through the volume
    client.send(
        format!("GET /read_block?volume={}&block=1 HTTP/1.1\r\n\r\n", VOLUME).as_bytes(),
    );
    let (status, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(body, ones);

    // write logical block 0 as well
    let content = vec![0x11u8; DEFAULT_BLOCK_SIZE as usize];
    let mut request = format!(
        "POST /write_block?volume={}&block=0 HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        VOLUME,
        content.len()
    )
    .into_bytes();
    request.extend_from_slice(&content);
    client.send(&request);
    let (status, _) = client.read_response();
    assert_eq!(status, 200);

    client.send(
        format!("GET /read_block?volume={}&block=0 HTTP/1.1\r\n\r\n", VOLUME).as_bytes(),
    );
    let (status, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(body, content);

    // physical layout: D1 carries the 0xff block, and the parity disk holds
    // the XOR of both data blocks
    assert_eq!(read_physical_block(&disk1, 0), ones);
    assert_eq!(
        read_physical_block(&disk2, 0),
        vec![0x11u8 ^ 0xffu8; DEFAULT_BLOCK_SIZE as usize]
    );

    // the volumes page reports a ready volume
    client.send(b"GET /volumes HTTP/1.1\r\n\r\n");
    let (status, body) = client.read_response();
    assert_eq!(status, 200);
    let page = String::from_utf8(body).unwrap();
    assert!(page.contains("ready"), "unexpected page: {}", page);
}

#[test]
fn reads_of_an_uninitialized_volume_are_unavailable() {
    let d0: Uuid = "00000000-0000-0000-0000-0000000000c0".parse().unwrap();
    let (addr0, _disk) = start_device("lone", d0);

    let front = start_frontend(&[(d0, addr0)]);
    let mut client = Client::connect(front);

    client.send(
        format!("GET /read_block?volume={}&block=0 HTTP/1.1\r\n\r\n", VOLUME).as_bytes(),
    );
    let (status, _) = client.read_response();
    assert_eq!(status, 503);

    // init with a single disk cannot proceed either
    client.send(
        format!("POST /init_volume?volume={} HTTP/1.1\r\nContent-Length: 0\r\n\r\n", VOLUME)
            .as_bytes(),
    );
    let (status, _) = client.read_response();
    assert_eq!(status, 503);
}
