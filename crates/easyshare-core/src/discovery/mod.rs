//! mDNS/DNS-SD discovery for EasyShare.
//!
//! Each peer registers `_easyshare._tcp.local.` with a unique instance name
//! and a TXT section describing the device; browsing resolves those records
//! into [`DiscoveredDevice`] entries and surfaces join/leave events.
//!
//! Resolution must never block on `<host>.local` DNS: when a record carries
//! no address, the hostname with its `.local` suffix stripped is used as
//! the host string, but resolved IPv4 literals are always preferred.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::device::{epoch_millis, DeviceInfo, DeviceRegistry, DiscoveredDevice, Platform};
use crate::error::{Error, Result};
use crate::events::{self, EasyShareEvent, EventSender};

/// mDNS service type for EasyShare.
pub const SERVICE_TYPE: &str = "_easyshare._tcp.local.";

/// TXT record keys for service properties.
pub mod txt_keys {
    /// Device id key
    pub const ID: &str = "id";
    /// Device name key
    pub const NAME: &str = "name";
    /// Platform key (`desktop` / `mobile`)
    pub const PLATFORM: &str = "platform";
    /// Application version key
    pub const VERSION: &str = "version";
}

/// Render a timestamp in base36 for compact instance names.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

/// Unique instance name for an advertisement:
/// `EasyShare-<first-8-of-id>-<epoch36>`.
#[must_use]
pub fn instance_name(device_id: &str) -> String {
    let prefix: String = device_id.chars().take(8).collect();
    #[allow(clippy::cast_sign_loss)]
    let epoch = base36(epoch_millis() as u64);
    format!("EasyShare-{prefix}-{epoch}")
}

/// Parse a resolved service into a discovered device.
///
/// Entries advertising the local id are filtered by the caller.
fn device_from_service_info(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    let properties = info.get_properties();
    let get_str =
        |key: &str| -> Option<String> { properties.get(key).map(|p| p.val_str().to_string()) };

    let id = get_str(txt_keys::ID)?;
    let name = get_str(txt_keys::NAME)?;
    let platform = get_str(txt_keys::PLATFORM).and_then(|s| Platform::parse(&s))?;
    let version = get_str(txt_keys::VERSION).unwrap_or_else(|| "0.0.0".to_string());

    let addresses = info.get_addresses();
    // Prefer IPv4, fall back to IPv6, and never block resolving the
    // `.local` hostname: strip the suffix and use the bare name instead.
    let host = match addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
    {
        Some(ip) => ip.to_string(),
        None => strip_local_suffix(info.get_hostname()),
    };

    Some(DiscoveredDevice {
        info: DeviceInfo {
            id,
            name,
            platform,
            version,
            host: Some(host),
            port: Some(info.get_port()),
        },
        last_seen: epoch_millis(),
    })
}

/// Turn `mybox.local.` into `mybox` as a last-resort host string.
fn strip_local_suffix(hostname: &str) -> String {
    let trimmed = hostname.trim_end_matches('.');
    trimmed
        .strip_suffix(".local")
        .unwrap_or(trimmed)
        .to_string()
}

/// mDNS advertiser.
///
/// Registers the local device on the network for as long as it lives.
pub struct Advertiser {
    daemon: Option<ServiceDaemon>,
    registered: Option<String>,
}

impl Advertiser {
    /// Create a new advertiser.
    ///
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("mDNS daemon error: {e}")))?;
        Ok(Self {
            daemon: Some(daemon),
            registered: None,
        })
    }

    /// Advertise the local device on the given TCP listener port.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn register(&mut self, device: &DeviceInfo, port: u16) -> Result<()> {
        let instance = instance_name(&device.id);

        let txt = [
            (txt_keys::ID, device.id.as_str()),
            (txt_keys::NAME, device.name.as_str()),
            (txt_keys::PLATFORM, device.platform.as_str()),
            (txt_keys::VERSION, device.version.as_str()),
        ];

        let raw_hostname = hostname::get().map_or_else(
            |_| "localhost".to_string(),
            |h| h.to_string_lossy().to_string(),
        );
        let host = if raw_hostname.to_lowercase().ends_with(".local.") {
            raw_hostname
        } else if raw_hostname.to_lowercase().ends_with(".local") {
            format!("{raw_hostname}.")
        } else {
            format!("{raw_hostname}.local.")
        };

        let service_info = ServiceInfo::new(SERVICE_TYPE, &instance, &host, (), port, &txt[..])
            .map_err(|e| Error::Discovery(format!("failed to create service info: {e}")))?
            .enable_addr_auto();

        self.daemon
            .as_ref()
            .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
            .register(service_info)
            .map_err(|e| Error::Discovery(format!("failed to register service: {e}")))?;

        tracing::info!(%instance, port, "registered mDNS service");
        self.registered = Some(instance);
        Ok(())
    }

    /// Withdraw the advertisement.
    ///
    /// # Errors
    ///
    /// Returns an error if unregistration fails.
    pub fn unregister(&mut self) -> Result<()> {
        if let Some(instance) = self.registered.take() {
            let full_name = format!("{instance}.{SERVICE_TYPE}");
            let receiver = self
                .daemon
                .as_ref()
                .ok_or_else(|| Error::Discovery("mDNS daemon already shut down".to_string()))?
                .unregister(&full_name)
                .map_err(|e| Error::Discovery(format!("failed to unregister: {e}")))?;

            match receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(status) => tracing::debug!(?status, "mDNS unregister completed"),
                Err(_) => tracing::debug!("mDNS unregister timed out"),
            }
        }
        Ok(())
    }

    /// Shut the advertiser down.
    pub fn shutdown(mut self) {
        self.shutdown_daemon();
    }

    fn shutdown_daemon(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            match daemon.shutdown() {
                Ok(receiver) => match receiver.recv_timeout(Duration::from_millis(500)) {
                    Ok(status) => tracing::debug!(?status, "mDNS advertiser shutdown completed"),
                    Err(_) => tracing::debug!("mDNS advertiser shutdown timed out"),
                },
                Err(e) => tracing::debug!("mDNS advertiser shutdown: {e}"),
            }
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.shutdown_daemon();
    }
}

/// mDNS browser.
///
/// Resolves EasyShare advertisements into discovered devices and feeds
/// found/lost events into the event channel.
pub struct Browser {
    daemon: Option<ServiceDaemon>,
    receiver: flume::Receiver<ServiceEvent>,
}

impl Browser {
    /// Create a new browser.
    ///
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("mDNS daemon error: {e}")))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("failed to browse: {e}")))?;
        Ok(Self {
            daemon: Some(daemon),
            receiver,
        })
    }

    /// Scan for peers for a fixed duration (one-shot, for CLIs).
    ///
    /// Devices advertising `local_id` are filtered out.
    pub async fn scan(&self, duration: Duration, local_id: &str) -> Vec<DiscoveredDevice> {
        let mut registry = DeviceRegistry::new();
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let result = tokio::time::timeout(remaining, self.receiver.recv_async()).await;
            match result {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(device) = device_from_service_info(&info) {
                        if device.info.id != local_id {
                            registry.upsert(device.info, epoch_millis());
                        }
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        registry.list()
    }

    /// Run the browser until the event channel closes, forwarding
    /// [`EasyShareEvent::DeviceFound`] / [`EasyShareEvent::DeviceLost`].
    ///
    /// Stale entries (unseen for 30 s) are pruned on a periodic tick, which
    /// also covers networks that drop goodbye packets.
    pub async fn run(mut self, local_id: String, events: EventSender) {
        let mut registry = DeviceRegistry::new();
        // Instance full name -> device id, for removal events.
        let mut names: HashMap<String, String> = HashMap::new();
        let mut prune = tokio::time::interval(Duration::from_secs(5));
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.receiver.recv_async() => {
                    let Ok(event) = event else { break };
                    match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let Some(device) = device_from_service_info(&info) else {
                                continue;
                            };
                            if device.info.id == local_id {
                                continue;
                            }
                            names.insert(
                                info.get_fullname().to_string(),
                                device.info.id.clone(),
                            );
                            let fresh = registry.upsert(device.info.clone(), epoch_millis());
                            if fresh {
                                tracing::info!(
                                    id = %device.info.id,
                                    name = %device.info.name,
                                    "device found"
                                );
                                events::emit(&events, EasyShareEvent::DeviceFound(device));
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, full_name) => {
                            if let Some(id) = names.remove(&full_name) {
                                if registry.remove(&id) {
                                    tracing::info!(%id, "device lost");
                                    events::emit(&events, EasyShareEvent::DeviceLost(id));
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ = prune.tick() => {
                    for id in registry.prune_stale(epoch_millis()) {
                        tracing::debug!(%id, "device stale");
                        names.retain(|_, v| *v != id);
                        events::emit(&events, EasyShareEvent::DeviceLost(id));
                    }
                }
            }
            if events.is_closed() {
                break;
            }
        }

        self.shutdown_daemon();
    }

    fn shutdown_daemon(&mut self) {
        if let Some(ref daemon) = self.daemon {
            if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!("failed to stop mDNS browse: {e}");
            }
        }
        if let Some(daemon) = self.daemon.take() {
            match daemon.shutdown() {
                Ok(receiver) => match receiver.recv_timeout(Duration::from_millis(500)) {
                    Ok(status) => tracing::debug!(?status, "mDNS browser shutdown completed"),
                    Err(_) => tracing::debug!("mDNS browser shutdown timed out"),
                },
                Err(e) => tracing::debug!("mDNS browser shutdown: {e}"),
            }
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.shutdown_daemon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_format() {
        assert!(SERVICE_TYPE.starts_with("_easyshare._tcp"));
        assert!(SERVICE_TYPE.ends_with(".local."));
    }

    #[test]
    fn test_instance_name_shape() {
        let name = instance_name("q7bGx0aZbUKOmnIs7vJcSQ");
        assert!(name.starts_with("EasyShare-q7bGx0aZ-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[test]
    fn test_strip_local_suffix() {
        assert_eq!(strip_local_suffix("mybox.local."), "mybox");
        assert_eq!(strip_local_suffix("mybox.local"), "mybox");
        assert_eq!(strip_local_suffix("mybox"), "mybox");
        assert_eq!(strip_local_suffix("my.box.local."), "my.box");
    }
}
