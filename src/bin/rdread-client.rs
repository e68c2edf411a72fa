use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use rdread::verbs::Verbs;
use rdread::{ClientSession, Config};

/// Read a remote buffer with one RDMA READ.
#[derive(Debug, Parser)]
#[command(name = "rdread-client")]
struct Args {
    /// TOML file with an `[rdread]` table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address.
    #[arg(long)]
    addr: Option<IpAddr>,

    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            Config::load_toml(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = config.socket_addr();
    let mut session = ClientSession::connect(&Verbs, server)
        .with_context(|| format!("connecting to {}", server))?;
    let data = session.read().context("reading remote buffer")?;

    let text = data.strip_suffix(&[0]).unwrap_or(&data);
    println!("data '{}'", String::from_utf8_lossy(text));

    session.disconnect().context("disconnecting")?;
    Ok(())
}
