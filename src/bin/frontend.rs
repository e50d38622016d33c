//! The frontend server: exposes logical volumes across discovered block
//! devices.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use raid5d::app::{App, Settings};
use raid5d::config::FrontendConfig;
use raid5d::disk::DEFAULT_BLOCK_SIZE;
use raid5d::pollable::{IdentifierSocket, ListenerSocket};
use raid5d::poller::PollType;
use raid5d::reactor::AsyncServer;

#[derive(Parser, Debug)]
#[command(name = "frontend", about = "RAID-5 frontend server")]
struct Args {
    #[arg(long, default_value_t = 8080)]
    bind_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Base directory for served files and uploads.
    #[arg(long, default_value = ".")]
    base: PathBuf,

    /// Poll timeout in milliseconds; discovery and timeouts tick on it.
    #[arg(long, default_value_t = 500)]
    poll_timeout: u64,

    /// poll or select.
    #[arg(long, default_value = "poll")]
    poll_type: PollType,

    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE as usize)]
    max_buffer: usize,

    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Per block device request timeout, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    block_request_timeout: u64,

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

    let config = match FrontendConfig::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("config: {}", e);
            return 2;
        }
    };

    if config.volumes.is_empty() {
        error!("config declares no [volume<k>] sections");
        return 2;
    }

    let settings = Settings {
        bind_address: args.bind_address,
        bind_port: args.bind_port,
        base: args.base,
        poll_timeout: Duration::from_millis(args.poll_timeout),
        max_buffer: args.max_buffer,
        max_connections: args.max_connections,
        block_request_timeout: Duration::from_millis(args.block_request_timeout),
    };

    let bind = SocketAddr::new(settings.bind_address, settings.bind_port);
    let listener = match ListenerSocket::bind(bind) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on {}: {}", bind, e);
            return 1;
        }
    };

    let identifier = match IdentifierSocket::new(&config.multicast) {
        Ok(identifier) => identifier,
        Err(e) => {
            error!("cannot join multicast group: {}", e);
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
        "frontend serving {} volume(s) on {}, discovery on {}:{}",
        config.volumes.len(),
        bind,
        config.multicast.address,
        config.multicast.port
    );

    let app = App::frontend(settings, config);
    let mut server = AsyncServer::new(app, args.poll_type);
    server.insert(Box::new(listener));
    server.insert(Box::new(identifier));

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
