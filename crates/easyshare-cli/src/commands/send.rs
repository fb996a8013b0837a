//! Send command implementation.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use easyshare_core::connection::ConnectionManager;
use easyshare_core::device::DeviceInfo;
use easyshare_core::discovery::Browser;
use easyshare_core::events::{EasyShareEvent, PairingStep};
use easyshare_core::transfer::AcceptPolicy;

use super::{format_size, local_device, open_storage, SendArgs};

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    if args.text.is_none() && args.files.is_empty() {
        bail!("nothing to send; pass --text and/or file paths");
    }

    let storage = open_storage()?;
    let local = local_device(storage.as_ref())?;
    let target = resolve_target(&args, &local).await?;

    let (manager, handle, mut events) =
        ConnectionManager::new(local, storage.clone(), AcceptPolicy::AlwaysAccept);
    tokio::spawn(manager.run());

    println!(
        "Connecting to {} ({}:{})...",
        target.name,
        target.host.as_deref().unwrap_or("?"),
        target.port.unwrap_or(0)
    );
    handle
        .connect(target.clone())
        .await
        .context("failed to connect")?;

    if let Some(passphrase) = args.passphrase {
        println!("Pairing...");
        handle.start_pairing(passphrase).await;
        let paired = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Some(EasyShareEvent::ConnectionState(state)) => match state.pairing_step {
                        Some(PairingStep::Success) => return Ok(()),
                        Some(PairingStep::Failed) => {
                            return Err(state
                                .error
                                .unwrap_or_else(|| "pairing failed".to_string()))
                        }
                        _ => {}
                    },
                    Some(_) => {}
                    None => return Err("connection closed".to_string()),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("pairing timed out"))?;
        if let Err(reason) = paired {
            bail!("pairing failed: {reason}");
        }
        println!("Paired.");
    }

    if let Some(text) = args.text {
        handle
            .send_text(text)
            .await
            .context("failed to send text")?;
        println!("Text sent.");
    }

    for path in args.files {
        let size = std::fs::metadata(&path)
            .with_context(|| format!("cannot read {}", path.display()))?
            .len();
        println!("Sending {} ({})...", path.display(), format_size(size));

        // send_file resolves only when the transfer concludes; watch the
        // event stream alongside it so long transfers show movement.
        let send = handle.send_file(path.clone());
        tokio::pin!(send);
        let sent = loop {
            tokio::select! {
                sent = &mut send => break sent,
                event = events.recv() => match event {
                    Some(EasyShareEvent::TransferProgress(Some(progress))) => {
                        tracing::debug!(
                            "{}: {:.0}%",
                            progress.file_name,
                            progress.percentage()
                        );
                    }
                    Some(_) => {}
                    None => break (&mut send).await,
                },
            }
        };
        if sent {
            println!("Done.");
        } else {
            bail!("transfer of {} failed", path.display());
        }
    }

    handle.disconnect().await;
    handle.shutdown().await;
    Ok(())
}

/// Turn `--to IP:PORT` or `--peer NAME` into a connectable device.
async fn resolve_target(args: &SendArgs, local: &DeviceInfo) -> Result<DeviceInfo> {
    if let Some(to) = &args.to {
        let (host, port) = to
            .rsplit_once(':')
            .context("--to expects IP:PORT")?;
        let port: u16 = port.parse().context("invalid port in --to")?;
        return Ok(DeviceInfo {
            id: format!("direct-{host}:{port}"),
            name: to.clone(),
            platform: easyshare_core::device::Platform::Desktop,
            version: "0.0.0".to_string(),
            host: Some(host.to_string()),
            port: Some(port),
        });
    }

    let Some(wanted) = &args.peer else {
        bail!("pass --to IP:PORT or --peer NAME");
    };

    println!("Looking for '{wanted}'...");
    let browser = Browser::new().context("failed to start mDNS browsing")?;
    let devices = browser.scan(Duration::from_secs(5), &local.id).await;

    devices
        .into_iter()
        .map(|d| d.info)
        .find(|info| info.name == *wanted || info.id.starts_with(wanted.as_str()))
        .with_context(|| format!("no device named '{wanted}' found on the network"))
}
