//! Command definitions and shared helpers.

pub mod history;
pub mod listen;
pub mod scan;
pub mod send;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use easyshare_core::device::{DeviceInfo, Platform};
use easyshare_core::storage::{FileStorage, Storage};

/// EasyShare - peer-to-peer local network text and file transfer.
#[derive(Parser)]
#[command(name = "easyshare", version, about)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Scan for EasyShare peers on the local network
    Scan(ScanArgs),
    /// Advertise this device, accept pairing and incoming transfers
    Listen(ListenArgs),
    /// Connect to a peer and send text or files
    Send(SendArgs),
    /// Show or clear the transfer history
    History(HistoryArgs),
}

/// Arguments for `scan`.
#[derive(Args)]
pub struct ScanArgs {
    /// Scan duration in seconds
    #[arg(long, default_value_t = 5)]
    pub duration: u64,
}

/// Arguments for `listen`.
#[derive(Args)]
pub struct ListenArgs {
    /// Accept files only from paired devices
    #[arg(long)]
    pub paired_only: bool,
}

/// Arguments for `send`.
#[derive(Args)]
pub struct SendArgs {
    /// Peer address as IP:PORT (skips discovery)
    #[arg(long, conflicts_with = "peer")]
    pub to: Option<String>,

    /// Peer device name or id prefix, resolved via discovery
    #[arg(long)]
    pub peer: Option<String>,

    /// Pairing passphrase (required for a first-time peer)
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Text message to send
    #[arg(long)]
    pub text: Option<String>,

    /// Files to send
    pub files: Vec<PathBuf>,
}

/// Arguments for `history`.
#[derive(Args)]
pub struct HistoryArgs {
    /// Show at most this many entries
    #[arg(long)]
    pub limit: Option<usize>,

    /// Clear the history instead of printing it
    #[arg(long)]
    pub clear: bool,
}

/// Open the persistent store.
pub fn open_storage() -> Result<Arc<FileStorage>> {
    Ok(Arc::new(
        FileStorage::load().context("failed to open the EasyShare data directory")?,
    ))
}

/// Build the local device identity from persisted settings.
pub fn local_device(storage: &dyn Storage) -> Result<DeviceInfo> {
    let settings = storage.settings().context("failed to read settings")?;
    Ok(DeviceInfo {
        id: settings.device_id,
        name: settings.device_name,
        platform: Platform::Desktop,
        version: easyshare_core::VERSION.to_string(),
        host: None,
        port: None,
    })
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
