//! Command-line entry point of the socket server

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use rvoip_socket_server::logging::{parse_log_level, setup_logging, LoggingConfig};
use rvoip_socket_server::{ServerConfig, SocketServer};

/// Relay SIP datagrams between UDP and a B2BUA controller
#[derive(Debug, Parser)]
#[command(name = "rvoip-socket-server", version, about)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP listen address
    #[arg(short = 'l', long)]
    listen_addr: Option<String>,

    /// UDP listen port
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Control channel listen address
    #[arg(short = 'c', long)]
    cmd_listen_addr: Option<String>,

    /// Control channel listen port
    #[arg(short = 'P', long)]
    cmd_listen_port: Option<u16>,

    /// Slot id, repeat for every slot
    #[arg(short = 's', long = "slot")]
    slots: Vec<u32>,

    /// Seconds after which queued datagrams may be dropped (0 disables)
    #[arg(long)]
    queue_ttl: Option<f64>,

    /// Receive loops on the primary UDP listener
    #[arg(long)]
    wildcard_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(addr) = &self.cmd_listen_addr {
            config.cmd_listen_addr = addr.clone();
        }
        if let Some(port) = self.cmd_listen_port {
            config.cmd_listen_port = port;
        }
        if !self.slots.is_empty() {
            config.slots = self.slots.clone();
        }
        if let Some(ttl) = self.queue_ttl {
            config.queue_ttl = ttl;
        }
        if let Some(workers) = self.wildcard_workers {
            config.wildcard_workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut logging = LoggingConfig::new(parse_log_level(&cli.log_level)?);
    if cli.json_logs {
        logging = logging.with_json();
    }
    setup_logging(logging)?;

    let config = cli.server_config()?;
    info!("Starting rvoip-socket-server v{}", env!("CARGO_PKG_VERSION"));

    let server = SocketServer::start(&config).context("startup failed")?;
    server.wait()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
