//! End-to-end tests against a running block device reactor.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use raid5d::app::{App, Settings};
use raid5d::config::{DeviceConfig, MulticastConfig};
use raid5d::disk::{BlockFile, DiskHeader, DEFAULT_BLOCK_SIZE};
use raid5d::pollable::ListenerSocket;
use raid5d::poller::PollType;
use raid5d::reactor::AsyncServer;

fn temp_disk(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("raid5d-bd-{}-{}", tag, std::process::id()))
}

fn start_device(tag: &str) -> SocketAddr {
    let disk = temp_disk(tag);
    let _ = std::fs::remove_file(&disk);

    let config = DeviceConfig {
        disk_name: disk.clone(),
        disk_info_name: None,
        disk_uuid: "00000000-0000-0000-0000-0000000000d0".parse().unwrap(),
        volume_uuid: "00000000-0000-0000-0000-0000000000aa".parse().unwrap(),
        multicast: MulticastConfig {
            address: "239.255.42.99".parse().unwrap(),
            port: 15999,
        },
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

    addr
}

/// Blocking test client that can read back-to-back pipelined responses
/// without losing over-read bytes.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Reads one full HTTP response: status, raw header block, body.
    fn read_response(&mut self) -> (u16, String, Vec<u8>) {
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-response, got {:?}", self.buf);
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
        (status, head, body)
    }
}

#[test]
fn set_then_get_block() {
    let addr = start_device("roundtrip");
    let mut client = Client::connect(addr);

    let payload = vec![0x5au8; DEFAULT_BLOCK_SIZE as usize];
    let mut request = format!(
        "POST /set_block?block=3 HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(&payload);
    client.send(&request);

    let (status, _, body) = client.read_response();
    assert_eq!(status, 200);
    assert!(body.is_empty());

    // same keep-alive connection
    client.send(b"GET /get_block?block=3 HTTP/1.1\r\n\r\n");
    let (status, _, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(body, payload);
}

#[test]
fn set_block_body_in_many_small_chunks() {
    let addr = start_device("chunks");
    let mut client = Client::connect(addr);

    let payload: Vec<u8> = (0..DEFAULT_BLOCK_SIZE as usize)
        .map(|i| (i % 251) as u8)
        .collect();

    client.send(
        format!(
            "POST /set_block?block=0 HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .as_bytes(),
    );

    for chunk in payload.chunks(payload.len() / 17 + 1) {
        client.send(chunk);
        thread::sleep(Duration::from_millis(2));
    }

    let (status, _, _) = client.read_response();
    assert_eq!(status, 200);

    client.send(b"GET /get_block?block=0 HTTP/1.1\r\n\r\n");
    let (status, _, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(body, payload);
}

#[test]
fn fresh_blocks_read_as_zeroes() {
    let addr = start_device("zeroes");
    let mut client = Client::connect(addr);

    client.send(b"GET /get_block?block=7 HTTP/1.1\r\n\r\n");
    let (status, _, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(body, vec![0u8; DEFAULT_BLOCK_SIZE as usize]);
}

#[test]
fn pipelined_requests_answer_in_order() {
    let addr = start_device("pipeline");
    let mut client = Client::connect(addr);

    client.send(b"GET /clock HTTP/1.1\r\n\r\nGET /clock HTTP/1.1\r\n\r\n");

    let (status_a, _, body_a) = client.read_response();
    let (status_b, _, body_b) = client.read_response();

    assert_eq!(status_a, 200);
    assert_eq!(status_b, 200);
    assert!(!body_a.is_empty());
    assert!(!body_b.is_empty());
}

#[test]
fn unknown_uri_is_404_and_closes() {
    let addr = start_device("missing");
    let mut client = Client::connect(addr);

    client.send(b"GET /no_such_thing HTTP/1.1\r\n\r\n");
    let (status, head, _) = client.read_response();
    assert_eq!(status, 404);
    assert!(head.to_ascii_lowercase().contains("connection: close"));
}

#[test]
fn malformed_request_line_is_400() {
    let addr = start_device("malformed");
    let mut client = Client::connect(addr);

    client.send(b"COMPLETE NONSENSE\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, 400);
}

#[test]
fn wrong_args_are_rejected() {
    let addr = start_device("args");
    let mut client = Client::connect(addr);

    // extra argument fails the exact-args check
    client.send(b"GET /get_block?block=0&extra=1 HTTP/1.1\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, 400);
}

#[test]
fn login_checks_the_shared_secret() {
    let addr = start_device("login");
    let mut client = Client::connect(addr);

    let body = b"password=opensesame";
    client.send(
        format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    client.send(body);
    let (status, _, _) = client.read_response();
    assert_eq!(status, 200);

    let body = b"password=wrong";
    client.send(
        format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    client.send(body);
    let (status, _, _) = client.read_response();
    assert_eq!(status, 401);
}

#[test]
fn disk_info_serves_the_header_block() {
    let addr = start_device("header");
    let mut client = Client::connect(addr);

    let header = DiskHeader {
        volume_uuid: "00000000-0000-0000-0000-0000000000aa".parse().unwrap(),
        disk_uuid: "00000000-0000-0000-0000-0000000000d0".parse().unwrap(),
        disk_index: 0,
        disk_count: 3,
        block_size: DEFAULT_BLOCK_SIZE,
        generation: 1,
    };

    let mut block = vec![0u8; DEFAULT_BLOCK_SIZE as usize];
    let encoded = header.encode();
    block[..encoded.len()].copy_from_slice(&encoded);

    let mut request = format!(
        "POST /set_block?block=-1 HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        block.len()
    )
    .into_bytes();
    request.extend_from_slice(&block);
    client.send(&request);
    let (status, _, _) = client.read_response();
    assert_eq!(status, 200);

    client.send(b"GET /get_disk_info HTTP/1.1\r\n\r\n");
    let (status, _, body) = client.read_response();
    assert_eq!(status, 200);
    assert_eq!(DiskHeader::decode(&body).unwrap(), header);
}
