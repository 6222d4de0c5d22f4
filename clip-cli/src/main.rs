//! # clipsync
//!
//! Command-line clipsync device.
//!
//! ## Commands
//!
//! - `init`: Create this device's identity
//! - `pair`: Show a pairing code, or join another device's code
//! - `serve`: Stay online, print received text and share typed lines
//! - `send`: Share one text item and exit
//! - `status`: Show identity and paired devices
//! - `unpair`: Forget a paired device
//!
//! ## Example
//!
//! ```bash
//! # On both devices
//! clipsync init --name "Laptop"
//!
//! # Laptop shows a code, phone joins it
//! clipsync pair --show --addr 192.168.1.10:7071
//! clipsync pair --join <code>
//!
//! # Laptop stays online; phone sends through a direct link and the relay
//! clipsync serve --listen 0.0.0.0:7071 --relay relay.example.com:7070
//! clipsync send "hello" --peer <laptop-id>=192.168.1.10:7071 --relay relay.example.com:7070
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod node;
mod trust_store;

use commands::{init, pair, send, serve, status, unpair};
use node::{NodeOptions, PeerAddr};

/// End-to-end encrypted clipboard sync between paired devices.
#[derive(Parser, Debug)]
#[command(name = "clipsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the device identity and trusted devices
    #[arg(long, global = true, env = "CLIPSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize device identity
    Init {
        /// Device name
        #[arg(long, short)]
        name: String,
    },

    /// Show a pairing code or join one
    Pair {
        /// Show a pairing code and wait for a device to join
        #[arg(long, conflicts_with = "join")]
        show: bool,

        /// Join the device that showed this code
        #[arg(long, conflicts_with = "show")]
        join: Option<String>,

        /// Address to accept the pairing connection on (advertised in the code)
        #[arg(long, default_value = "127.0.0.1:7071")]
        addr: String,

        /// Relay address to advertise in the code
        #[arg(long)]
        relay: Option<String>,

        /// Seconds the code stays valid
        #[arg(long, default_value_t = 60)]
        ttl: u64,

        /// Accept the request without asking
        #[arg(long, short)]
        yes: bool,
    },

    /// Stay online: print received items, share lines typed on stdin
    Serve {
        /// Accept direct connections on this address
        #[arg(long)]
        listen: Option<String>,

        #[command(flatten)]
        links: Links,
    },

    /// Share one text item and exit
    Send {
        /// Text to share
        text: String,

        #[command(flatten)]
        links: Links,
    },

    /// Show device identity and paired devices
    Status,

    /// Forget a paired device
    Unpair {
        /// Device id to forget
        device: String,
    },
}

/// Outbound transports.
#[derive(Args, Debug)]
struct Links {
    /// Dial a paired device directly (DEVICE_ID=HOST:PORT, repeatable)
    #[arg(long = "peer")]
    peers: Vec<PeerAddr>,

    /// Relay server (HOST:PORT)
    #[arg(long, env = "CLIPSYNC_RELAY")]
    relay: Option<String>,

    /// Replace a relay session already registered under this device id
    #[arg(long, requires = "relay")]
    force_register: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    config::ensure_data_dir(&data_dir).await?;

    match cli.command {
        Commands::Init { name } => {
            init::run(&data_dir, &name).await?;
        }
        Commands::Pair {
            show,
            join,
            addr,
            relay,
            ttl,
            yes,
        } => {
            if show {
                let options = pair::ShowOptions {
                    addr,
                    relay,
                    ttl: Duration::from_secs(ttl),
                    auto_approve: yes,
                };
                pair::show(&data_dir, options).await?;
            } else if let Some(code) = join {
                pair::join(&data_dir, &code).await?;
            } else {
                anyhow::bail!("Must specify either --show or --join");
            }
        }
        Commands::Serve { listen, links } => {
            let options = NodeOptions {
                listen,
                peers: links.peers,
                relay: links.relay,
                force_register: links.force_register,
            };
            serve::run(&data_dir, options).await?;
        }
        Commands::Send { text, links } => {
            let options = NodeOptions {
                listen: None,
                peers: links.peers,
                relay: links.relay,
                force_register: links.force_register,
            };
            send::run(&data_dir, &text, options).await?;
        }
        Commands::Status => {
            status::run(&data_dir).await?;
        }
        Commands::Unpair { device } => {
            unpair::run(&data_dir, &device).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for clipsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "ydun", "clipsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
