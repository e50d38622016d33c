//! The block device server: one disk slice, announced over multicast.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use raid5d::app::{App, Settings};
use raid5d::config::DeviceConfig;
use raid5d::disk::{BlockFile, DEFAULT_BLOCK_SIZE};
use raid5d::pollable::{DeclarerSocket, ListenerSocket};
use raid5d::poller::PollType;
use raid5d::reactor::AsyncServer;

#[derive(Parser, Debug)]
#[command(name = "block-device", about = "RAID-5 block device server")]
struct Args {
    #[arg(long, default_value_t = 8081)]
    bind_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Base directory for served files.
    #[arg(long, default_value = ".")]
    base: PathBuf,

    /// Poll timeout in milliseconds; also the beacon cadence.
    #[arg(long, default_value_t = 500)]
    poll_timeout: u64,

    /// poll or select.
    #[arg(long, default_value = "poll")]
    poll_type: PollType,

    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE as usize)]
    max_buffer: usize,

    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    #[arg(long)]
    config_file: PathBuf,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    daemon: bool,
}

fn init_logging(log_file: &Option<PathBuf>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open log file {:?}: {}", path, e),
        }
    }

    builder.init();
}

fn run() -> i32 {
    let args = Args::parse();
    init_logging(&args.log_file);

    let config = match DeviceConfig::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("config: {}", e);
            return 2;
        }
    };

    let blockfile = match BlockFile::open(&config.disk_name, DEFAULT_BLOCK_SIZE) {
        Ok(blockfile) => blockfile,
        Err(e) => {
            error!("cannot open disk {:?}: {}", config.disk_name, e);
            return 1;
        }
    };

    let settings = Settings {
        bind_address: args.bind_address,
        bind_port: args.bind_port,
        base: args.base,
        poll_timeout: Duration::from_millis(args.poll_timeout),
        max_buffer: args.max_buffer,
        max_connections: args.max_connections,
        ..Settings::default()
    };

    let bind = SocketAddr::new(settings.bind_address, settings.bind_port);
    let listener = match ListenerSocket::bind(bind) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on {}: {}", bind, e);
            return 1;
        }
    };

    let declarer = match DeclarerSocket::new(
        &config.multicast,
        config.disk_uuid,
        config.volume_uuid,
        args.bind_port,
    ) {
        Ok(declarer) => declarer,
        Err(e) => {
            error!("cannot open multicast socket: {}", e);
            return 1;
        }
    };

    if args.daemon {
        if let Err(e) = raid5d::sys::daemonize() {
            error!("cannot daemonize: {}", e);
            return 1;
        }
    }

    info!(
        "block device {} (volume {}) serving on {}",
        config.disk_uuid, config.volume_uuid, bind
    );

    let app = App::device(settings, config, blockfile);
    let mut server = AsyncServer::new(app, args.poll_type);
    server.insert(Box::new(listener));
    server.insert(Box::new(declarer));

    match server.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("reactor failed: {}", e);
            1
        }
    }
}

fn main() {
    process::exit(run());
}
