//! Scan command implementation.

use std::time::Duration;

use anyhow::{Context, Result};

use easyshare_core::discovery::Browser;

use super::{local_device, open_storage, ScanArgs};

/// Run the scan command.
pub async fn run(args: ScanArgs) -> Result<()> {
    let storage = open_storage()?;
    let local = local_device(storage.as_ref())?;

    println!();
    println!("Scanning for devices ({}s)...", args.duration);
    println!();

    let browser = Browser::new().context("failed to start mDNS browsing")?;
    let devices = browser
        .scan(Duration::from_secs(args.duration), &local.id)
        .await;

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    for device in devices {
        let address = match (&device.info.host, device.info.port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            _ => "-".to_string(),
        };
        println!(
            "  {:24} {:8} {:22} {}",
            device.info.name, device.info.platform, address, device.info.id
        );
    }

    Ok(())
}
