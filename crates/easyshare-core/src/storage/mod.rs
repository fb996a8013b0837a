//! Settings, paired devices and transfer history for EasyShare.
//!
//! The core consumes persistence only through the [`Storage`] trait, always
//! between frame dispatches, so implementations need no internal ordering
//! guarantees beyond their own locking.
//!
//! Two implementations ship here:
//!
//! - [`MemoryStorage`] - ephemeral, for tests and hosts that persist
//!   elsewhere
//! - [`FileStorage`] - settings.toml + devices.json + history.json in the
//!   platform data directory
//!
//! History keeps the most recent 100 transfers, newest first.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::device::{epoch_millis, PairedDevice};
use crate::error::{Error, Result};

/// Maximum retained history entries.
pub const HISTORY_CAP: usize = 100;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Sent to the remote device
    Send,
    /// Received from the remote device
    Receive,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Payload-specific part of a history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransferKind {
    /// A text message
    Text {
        /// Message content
        content: String,
    },
    /// A file transfer
    File {
        /// File name
        file_name: String,
        /// File size in bytes
        file_size: u64,
        /// MIME type
        mime_type: String,
        /// Absolute path of the saved file (receive side)
        #[serde(skip_serializing_if = "Option::is_none", default)]
        file_path: Option<PathBuf>,
        /// Wall-clock transfer duration
        #[serde(skip_serializing_if = "Option::is_none", default)]
        duration_ms: Option<u64>,
        /// Derived throughput
        #[serde(skip_serializing_if = "Option::is_none", default)]
        speed_bytes_per_sec: Option<u64>,
    },
}

/// A finalized transfer history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    /// Unique entry id
    pub id: String,
    /// Completion time (epoch-ms)
    pub timestamp: i64,
    /// Direction of the transfer
    pub direction: TransferDirection,
    /// Remote device id
    pub device_id: String,
    /// Remote device name
    pub device_name: String,
    /// Text or file details
    #[serde(flatten)]
    pub kind: TransferKind,
}

impl TransferRecord {
    /// Build a text entry.
    #[must_use]
    pub fn text(
        direction: TransferDirection,
        device_id: String,
        device_name: String,
        content: String,
    ) -> Self {
        Self {
            id: crate::crypto::generate_message_id(),
            timestamp: epoch_millis(),
            direction,
            device_id,
            device_name,
            kind: TransferKind::Text { content },
        }
    }

    /// Build a file entry.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn file(
        direction: TransferDirection,
        device_id: String,
        device_name: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        file_path: Option<PathBuf>,
        duration_ms: Option<u64>,
    ) -> Self {
        let speed_bytes_per_sec = duration_ms
            .filter(|&ms| ms > 0)
            .map(|ms| file_size * 1000 / ms);
        Self {
            id: crate::crypto::generate_message_id(),
            timestamp: epoch_millis(),
            direction,
            device_id,
            device_name,
            kind: TransferKind::File {
                file_name,
                file_size,
                mime_type,
                file_path,
                duration_ms,
                speed_bytes_per_sec,
            },
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppSettings {
    /// Display name on the network
    pub device_name: String,
    /// Persistent device id
    pub device_id: String,
    /// Whether files from paired devices are accepted without prompting
    pub auto_accept_from_paired: bool,
    /// Directory where received files are written
    pub save_directory: PathBuf,
    /// Whether the host should raise notifications
    pub notifications_enabled: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let device_name = hostname::get().map_or_else(
            |_| "EasyShare Device".to_string(),
            |h| h.to_string_lossy().to_string(),
        );
        let save_directory = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            device_name,
            device_id: crate::crypto::generate_device_id(),
            auto_accept_from_paired: true,
            save_directory,
            notifications_enabled: true,
        }
    }
}

/// A partial settings update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingsUpdate {
    /// New display name
    pub device_name: Option<String>,
    /// New auto-accept policy flag
    pub auto_accept_from_paired: Option<bool>,
    /// New save directory
    pub save_directory: Option<PathBuf>,
    /// New notifications flag
    pub notifications_enabled: Option<bool>,
}

impl AppSettings {
    fn apply(&mut self, update: SettingsUpdate) {
        if let Some(name) = update.device_name {
            self.device_name = name;
        }
        if let Some(auto) = update.auto_accept_from_paired {
            self.auto_accept_from_paired = auto;
        }
        if let Some(dir) = update.save_directory {
            self.save_directory = dir;
        }
        if let Some(notify) = update.notifications_enabled {
            self.notifications_enabled = notify;
        }
    }
}

/// Persistence facade consumed by the core.
pub trait Storage: Send + Sync {
    /// Current settings.
    fn settings(&self) -> Result<AppSettings>;

    /// Apply a partial update; returns the resulting settings.
    fn update_settings(&self, update: SettingsUpdate) -> Result<AppSettings>;

    /// All paired devices.
    fn paired_devices(&self) -> Result<Vec<PairedDevice>>;

    /// Insert or overwrite a paired device (uniqueness by id).
    fn add_paired_device(&self, device: PairedDevice) -> Result<()>;

    /// Remove a paired device by id.
    fn remove_paired_device(&self, id: &str) -> Result<()>;

    /// Record a successful connection to a paired device.
    fn update_paired_device_last_connected(&self, id: &str, when_ms: i64) -> Result<()>;

    /// Transfer history, newest first.
    fn transfers(&self) -> Result<Vec<TransferRecord>>;

    /// Prepend a history entry, enforcing the retention cap.
    fn add_transfer(&self, record: TransferRecord) -> Result<()>;

    /// Drop all history entries.
    fn clear_transfers(&self) -> Result<()>;
}

/// Look up a paired device by id.
pub fn find_paired(storage: &dyn Storage, id: &str) -> Result<Option<PairedDevice>> {
    Ok(storage.paired_devices()?.into_iter().find(|d| d.info.id == id))
}

#[derive(Debug, Default)]
struct StoreState {
    settings: AppSettings,
    devices: Vec<PairedDevice>,
    transfers: Vec<TransferRecord>,
}

impl StoreState {
    fn upsert_device(&mut self, device: PairedDevice) {
        self.devices.retain(|d| d.info.id != device.info.id);
        self.devices.push(device);
    }

    fn push_transfer(&mut self, record: TransferRecord) {
        self.transfers.insert(0, record);
        if self.transfers.len() > HISTORY_CAP {
            self.transfers.truncate(HISTORY_CAP);
        }
    }
}

/// In-memory storage for tests and ephemeral hosts.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<StoreState>,
}

impl MemoryStorage {
    /// Create a store with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(AppSettings::default())
    }

    /// Create a store with the given settings.
    #[must_use]
    pub fn with_settings(settings: AppSettings) -> Self {
        Self {
            state: Mutex::new(StoreState {
                settings,
                ..StoreState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn settings(&self) -> Result<AppSettings> {
        Ok(self.lock().settings.clone())
    }

    fn update_settings(&self, update: SettingsUpdate) -> Result<AppSettings> {
        let mut state = self.lock();
        state.settings.apply(update);
        Ok(state.settings.clone())
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        Ok(self.lock().devices.clone())
    }

    fn add_paired_device(&self, device: PairedDevice) -> Result<()> {
        self.lock().upsert_device(device);
        Ok(())
    }

    fn remove_paired_device(&self, id: &str) -> Result<()> {
        self.lock().devices.retain(|d| d.info.id != id);
        Ok(())
    }

    fn update_paired_device_last_connected(&self, id: &str, when_ms: i64) -> Result<()> {
        let mut state = self.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.info.id == id) {
            device.last_connected = Some(when_ms);
        }
        Ok(())
    }

    fn transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self.lock().transfers.clone())
    }

    fn add_transfer(&self, record: TransferRecord) -> Result<()> {
        self.lock().push_transfer(record);
        Ok(())
    }

    fn clear_transfers(&self) -> Result<()> {
        self.lock().transfers.clear();
        Ok(())
    }
}

/// Versioned wrapper for the JSON store files.
#[derive(Debug, Serialize, Deserialize)]
struct JsonStore<T> {
    version: u32,
    entries: Vec<T>,
}

impl<T> Default for JsonStore<T> {
    fn default() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }
}

/// File-backed storage: `settings.toml`, `devices.json`, `history.json`.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStorage {
    /// Load from the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing store cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let dir = Self::default_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::load_from(dir)
    }

    /// The default data directory.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "easyshare", "EasyShare")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Load from a specific directory, creating defaults for missing files.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing store cannot be read or parsed.
    pub fn load_from(dir: PathBuf) -> Result<Self> {
        let settings_path = dir.join("settings.toml");
        let settings = if settings_path.exists() {
            let raw = fs::read_to_string(&settings_path).map_err(|e| {
                Error::Storage(format!("failed to read {}: {e}", settings_path.display()))
            })?;
            toml::from_str(&raw).map_err(|e| {
                Error::Storage(format!("failed to parse {}: {e}", settings_path.display()))
            })?
        } else {
            AppSettings::default()
        };

        let devices: JsonStore<PairedDevice> = Self::read_json(&dir.join("devices.json"))?;
        let transfers: JsonStore<TransferRecord> = Self::read_json(&dir.join("history.json"))?;

        let storage = Self {
            dir,
            state: Mutex::new(StoreState {
                settings,
                devices: devices.entries,
                transfers: transfers.entries,
            }),
        };
        // First run: persist the generated device id immediately.
        if !settings_path.exists() {
            storage.save_settings(&storage.lock().settings.clone())?;
        }
        Ok(storage)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<JsonStore<T>> {
        if !path.exists() {
            return Ok(JsonStore::default());
        }
        let file = fs::File::open(path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {e}", path.display())))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Storage(format!("failed to parse {}: {e}", path.display())))
    }

    fn write_json<T: Serialize>(&self, name: &str, entries: &[T]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Storage(format!("failed to create store dir: {e}")))?;
        let path = self.dir.join(name);
        let file = fs::File::create(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", path.display())))?;
        let store = serde_json::json!({ "version": 1, "entries": entries });
        serde_json::to_writer_pretty(BufWriter::new(file), &store)
            .map_err(|e| Error::Storage(format!("failed to write {}: {e}", path.display())))
    }

    fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Storage(format!("failed to create store dir: {e}")))?;
        let path = self.dir.join("settings.toml");
        let raw = toml::to_string_pretty(settings)
            .map_err(|e| Error::Storage(format!("failed to encode settings: {e}")))?;
        fs::write(&path, raw)
            .map_err(|e| Error::Storage(format!("failed to write {}: {e}", path.display())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Storage for FileStorage {
    fn settings(&self) -> Result<AppSettings> {
        Ok(self.lock().settings.clone())
    }

    fn update_settings(&self, update: SettingsUpdate) -> Result<AppSettings> {
        let settings = {
            let mut state = self.lock();
            state.settings.apply(update);
            state.settings.clone()
        };
        self.save_settings(&settings)?;
        Ok(settings)
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        Ok(self.lock().devices.clone())
    }

    fn add_paired_device(&self, device: PairedDevice) -> Result<()> {
        let devices = {
            let mut state = self.lock();
            state.upsert_device(device);
            state.devices.clone()
        };
        self.write_json("devices.json", &devices)
    }

    fn remove_paired_device(&self, id: &str) -> Result<()> {
        let devices = {
            let mut state = self.lock();
            state.devices.retain(|d| d.info.id != id);
            state.devices.clone()
        };
        self.write_json("devices.json", &devices)
    }

    fn update_paired_device_last_connected(&self, id: &str, when_ms: i64) -> Result<()> {
        let devices = {
            let mut state = self.lock();
            if let Some(device) = state.devices.iter_mut().find(|d| d.info.id == id) {
                device.last_connected = Some(when_ms);
            }
            state.devices.clone()
        };
        self.write_json("devices.json", &devices)
    }

    fn transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self.lock().transfers.clone())
    }

    fn add_transfer(&self, record: TransferRecord) -> Result<()> {
        let transfers = {
            let mut state = self.lock();
            state.push_transfer(record);
            state.transfers.clone()
        };
        self.write_json("history.json", &transfers)
    }

    fn clear_transfers(&self) -> Result<()> {
        {
            self.lock().transfers.clear();
        }
        self.write_json::<TransferRecord>("history.json", &[])
    }
}
