use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use rdread::verbs::Verbs;
use rdread::{Config, ServerSession};

/// Expose a buffer for one-sided RDMA READ.
#[derive(Debug, Parser)]
#[command(name = "rdread-server")]
struct Args {
    /// TOML file with an `[rdread]` table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<IpAddr>,

    #[arg(short, long)]
    port: Option<u16>,

    /// RDMA device to open.
    #[arg(short, long)]
    device: Option<String>,

    /// Text to expose.
    #[arg(long)]
    payload: Option<String>,
}

impl Args {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_toml(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(payload) = &self.payload {
            config.payload = payload.clone();
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().config()?;
    let mut server = ServerSession::new(&Verbs, &config)
        .with_context(|| format!("setting up server on {}", config.socket_addr()))?;
    log::info!(
        "rdread: serving {} bytes on {} ({:?})",
        config.payload.len() + 1,
        server.local_addr(),
        server.descriptor()
    );

    match server.run() {
        Ok(never) => match never {},
        Err(e) => Err(e).context("waiting for connection events"),
    }
}
