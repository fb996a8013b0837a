//! EasyShare CLI - peer-to-peer local network sharing
//!
//! Devices on the same LAN discover each other over mDNS, pair with a
//! passphrase, and exchange text and files directly.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the receiving device
//! easyshare listen
//!
//! # On the sending device
//! easyshare send --peer "Living Room PC" --passphrase 7291 ./photo.jpg
//! ```

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Scan(args) => commands::scan::run(args).await,
        Command::Listen(args) => commands::listen::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::History(args) => commands::history::run(&args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,easyshare=info,easyshare_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
