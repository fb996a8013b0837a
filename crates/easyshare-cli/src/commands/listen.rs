//! Listen command implementation.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use easyshare_core::connection::ConnectionManager;
use easyshare_core::discovery::{Advertiser, Browser};
use easyshare_core::events::EasyShareEvent;
use easyshare_core::storage::{Storage, TransferKind};
use easyshare_core::transfer::AcceptPolicy;

use super::{format_size, local_device, open_storage, ListenArgs};

/// Run the listen command: advertise, accept pairing requests from the
/// terminal, and print incoming transfers until interrupted.
pub async fn run(args: ListenArgs) -> Result<()> {
    let storage = open_storage()?;
    let local = local_device(storage.as_ref())?;
    let settings = storage.settings().context("failed to read settings")?;

    let policy = if args.paired_only {
        AcceptPolicy::PairedOnly
    } else {
        AcceptPolicy::AlwaysAccept
    };

    let (mut manager, handle, mut events) =
        ConnectionManager::new(local.clone(), storage.clone(), policy);
    let port = manager.start_server().await.context("failed to bind")?;
    tokio::spawn(manager.run());

    let mut advertiser = Advertiser::new().context("failed to start mDNS")?;
    advertiser
        .register(&local, port)
        .context("failed to advertise")?;

    let browser = Browser::new().context("failed to start mDNS browsing")?;
    let (discovery_tx, mut discovery_rx) = easyshare_core::events::channel();
    tokio::spawn(browser.run(local.id.clone(), discovery_tx));

    println!();
    println!("Listening as '{}' on port {port}", local.name);
    println!("Received files land in {}", settings.save_directory.display());
    println!("Press Ctrl-C to stop.");
    println!();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    EasyShareEvent::PairingRequest(device) => {
                        println!("'{}' wants to pair. Enter the passphrase:", device.name);
                        match stdin.next_line().await {
                            Ok(Some(line)) => {
                                handle.provide_passphrase(line.trim().to_string()).await;
                            }
                            _ => println!("No passphrase entered, ignoring request."),
                        }
                    }
                    EasyShareEvent::ConnectionState(state) => {
                        if let Some(step) = state.pairing_step {
                            tracing::debug!(?step, "pairing step");
                        }
                        if let Some(error) = state.error {
                            println!("Connection: {error}");
                        }
                    }
                    EasyShareEvent::TextReceived { content, from } => {
                        println!("[{}] {content}", from.name);
                    }
                    EasyShareEvent::TransferComplete(record) => {
                        if let TransferKind::File {
                            file_name,
                            file_size,
                            file_path,
                            ..
                        } = record.kind
                        {
                            let where_to = file_path
                                .map_or_else(String::new, |p| format!(" -> {}", p.display()));
                            println!(
                                "{} {} ({}){where_to}",
                                record.direction,
                                file_name,
                                format_size(file_size)
                            );
                        }
                    }
                    EasyShareEvent::TransferProgress(Some(progress)) => {
                        tracing::debug!(
                            "{}: {:.0}%",
                            progress.file_name,
                            progress.percentage()
                        );
                    }
                    EasyShareEvent::TransferProgress(None) => {}
                    EasyShareEvent::DeviceFound(_) | EasyShareEvent::DeviceLost(_) => {}
                }
            }
            event = discovery_rx.recv() => {
                match event {
                    Some(EasyShareEvent::DeviceFound(device)) => {
                        println!("Found '{}' ({})", device.info.name, device.info.platform);
                    }
                    Some(EasyShareEvent::DeviceLost(id)) => {
                        tracing::debug!(%id, "device lost");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping.");
                break;
            }
        }
    }

    advertiser.unregister().ok();
    handle.shutdown().await;
    Ok(())
}
