//! Shared helpers for the integration suites: spawn two connection
//! managers over loopback TCP with in-memory storage and watch their
//! event streams.

// Each integration binary compiles its own copy; not every binary uses
// every helper.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use easyshare_core::connection::{ConnectionHandle, ConnectionManager};
use easyshare_core::device::{DeviceInfo, Platform};
use easyshare_core::events::{EasyShareEvent, EventReceiver, PairingStep};
use easyshare_core::storage::{MemoryStorage, SettingsUpdate, Storage};
use easyshare_core::transfer::AcceptPolicy;

/// One side of a loopback peer pair.
pub struct Peer {
    pub handle: ConnectionHandle,
    pub events: EventReceiver,
    pub storage: Arc<MemoryStorage>,
    /// Identity with loopback host/port filled in, ready to dial.
    pub device: DeviceInfo,
    pub port: u16,
}

/// Start a manager with a bound listener and a temp save directory.
pub async fn spawn_peer(name: &str, platform: Platform, save_dir: &Path) -> Peer {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .update_settings(SettingsUpdate {
            device_name: Some(name.to_string()),
            save_directory: Some(save_dir.to_path_buf()),
            ..SettingsUpdate::default()
        })
        .expect("settings");

    let mut device = DeviceInfo::generate(name.to_string(), platform);
    let (mut manager, handle, events) = ConnectionManager::new(
        device.clone(),
        storage.clone(),
        AcceptPolicy::AlwaysAccept,
    );
    let port = manager.start_server().await.expect("bind listener");
    tokio::spawn(manager.run());

    device.host = Some("127.0.0.1".to_string());
    device.port = Some(port);

    Peer {
        handle,
        events,
        storage,
        device,
        port,
    }
}

/// Wait until the predicate extracts a value from an event.
pub async fn wait_event<F, T>(events: &mut EventReceiver, mut pick: F) -> T
where
    F: FnMut(&EasyShareEvent) -> Option<T>,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait for a specific pairing step.
pub async fn wait_pairing_step(events: &mut EventReceiver, step: PairingStep) {
    wait_event(events, |event| match event {
        EasyShareEvent::ConnectionState(state) if state.pairing_step == Some(step) => Some(()),
        _ => None,
    })
    .await;
}

/// Run the full pairing handshake between two peers with one passphrase.
pub async fn pair(initiator: &mut Peer, responder: &mut Peer, passphrase: &str) {
    initiator
        .handle
        .connect(responder.device.clone())
        .await
        .expect("connect");
    initiator.handle.start_pairing(passphrase.to_string()).await;

    let asked_by = wait_event(&mut responder.events, |event| match event {
        EasyShareEvent::PairingRequest(device) => Some(device.clone()),
        _ => None,
    })
    .await;
    assert_eq!(asked_by.id, initiator.device.id);

    responder
        .handle
        .provide_passphrase(passphrase.to_string())
        .await;

    wait_pairing_step(&mut initiator.events, PairingStep::Success).await;
    wait_pairing_step(&mut responder.events, PairingStep::Success).await;
}
