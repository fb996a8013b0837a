//! Device identity and peer bookkeeping for EasyShare.
//!
//! A device is identified by a URL-safe random 128-bit token generated once
//! and persisted. Remote devices appear here in two flavors: discovered
//! (seen on mDNS, expires after 30 seconds of silence) and paired (carries
//! a shared secret and survives restarts).

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::DISCOVERY_STALE_MS;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Device platform class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Desktop-class device
    Desktop,
    /// Mobile-class device
    Mobile,
}

impl Platform {
    /// Parse a platform string as it appears in mDNS TXT records.
    ///
    /// Older records used OS names; `macos` and `android` are accepted as
    /// synonyms of the canonical values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "desktop" | "macos" => Some(Self::Desktop),
            "mobile" | "android" => Some(Self::Mobile),
            _ => None,
        }
    }

    /// The canonical wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity tuple for a device.
///
/// `host` and `port` are populated only for remote devices resolved via
/// mDNS, or locally once the TCP listener is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Persistent random device id (16 bytes, URL-safe base64)
    pub id: String,
    /// Human-readable device name
    pub name: String,
    /// Platform class
    pub platform: Platform,
    /// Application version string
    pub version: String,
    /// Reachable host (IP literal preferred)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub host: Option<String>,
    /// TCP listener port
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

impl DeviceInfo {
    /// Create a local device identity with a fresh random id.
    #[must_use]
    pub fn generate(name: String, platform: Platform) -> Self {
        Self {
            id: crate::crypto::generate_device_id(),
            name,
            platform,
            version: crate::VERSION.to_string(),
            host: None,
            port: None,
        }
    }
}

/// A device currently visible on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Device identity
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// When the device was last seen (epoch-ms)
    pub last_seen: i64,
}

impl DiscoveredDevice {
    /// Whether the entry has gone stale (unseen for over 30 seconds).
    #[must_use]
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.last_seen > DISCOVERY_STALE_MS
    }
}

/// A device we have completed pairing with.
///
/// Uniqueness is by `info.id`; re-pairing overwrites the stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Device identity
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// 32-byte shared secret, base64
    pub shared_secret: String,
    /// When pairing completed (epoch-ms)
    pub paired_at: i64,
    /// Last successful connection (epoch-ms)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_connected: Option<i64>,
}

impl PairedDevice {
    /// Build a paired-device record from a completed pairing.
    #[must_use]
    pub fn new(info: DeviceInfo, secret: &[u8; 32]) -> Self {
        Self {
            info,
            shared_secret: STANDARD.encode(secret),
            paired_at: epoch_millis(),
            last_connected: None,
        }
    }

    /// Decode the stored shared secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value is not 32 bytes of base64.
    pub fn secret(&self) -> Result<[u8; 32]> {
        let raw = STANDARD
            .decode(&self.shared_secret)
            .map_err(|e| Error::Storage(format!("invalid stored secret: {e}")))?;
        if raw.len() != 32 {
            return Err(Error::Storage(format!(
                "stored secret has {} bytes, expected 32",
                raw.len()
            )));
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&raw);
        Ok(secret)
    }
}

/// Bookkeeping for devices seen on mDNS.
///
/// The registry upserts on every resolve event and prunes entries that have
/// not been re-announced within the staleness window.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DiscoveredDevice>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device sighting. Returns `true` if the device was not
    /// previously known (a `DeviceFound` event should fire).
    pub fn upsert(&mut self, info: DeviceInfo, now_ms: i64) -> bool {
        let id = info.id.clone();
        let fresh = !self.devices.contains_key(&id);
        self.devices.insert(
            id,
            DiscoveredDevice {
                info,
                last_seen: now_ms,
            },
        );
        fresh
    }

    /// Remove a device by id. Returns `true` if it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// Drop stale entries, returning the ids that were lost.
    pub fn prune_stale(&mut self, now_ms: i64) -> Vec<String> {
        let lost: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.is_stale(now_ms))
            .map(|d| d.info.id.clone())
            .collect();
        for id in &lost {
            self.devices.remove(id);
        }
        lost
    }

    /// Current live entries, most recently seen first.
    #[must_use]
    pub fn list(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }

    /// Look up a device by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }
}
