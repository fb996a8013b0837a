//! # EasyShare Core Library
//!
//! `easyshare-core` is the transfer engine for EasyShare, a peer-to-peer
//! local-network sharing tool. Two devices on the same LAN discover each
//! other over mDNS, establish a shared secret through a
//! passphrase-authenticated handshake, and exchange text messages and files
//! directly, without intermediary servers.
//!
//! ## Modules
//!
//! - [`crypto`] - Key derivation, authenticated encryption, checksums
//! - [`device`] - Device identity and peer bookkeeping
//! - [`protocol`] - Length-prefixed wire framing and message codec
//! - [`discovery`] - mDNS advertise/browse for `_easyshare._tcp`
//! - [`pairing`] - Passphrase challenge/response state machine
//! - [`connection`] - Connection manager: socket ownership, keepalive, dispatch
//! - [`transfer`] - Text and file transfer engine (chunk and HTTP modes)
//! - [`storage`] - Settings, paired devices and history facade
//! - [`events`] - Typed event surface toward the host UI
//!
//! ## Example
//!
//! ```rust,ignore
//! use easyshare_core::connection::ConnectionManager;
//! use easyshare_core::transfer::AcceptPolicy;
//!
//! let (mut manager, handle, mut events) =
//!     ConnectionManager::new(device, storage, AcceptPolicy::AlwaysAccept);
//! let port = manager.start_server().await?;
//! tokio::spawn(manager.run());
//!
//! handle.connect(peer).await?;
//! handle.start_pairing("4812".to_string()).await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod connection;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod pairing;
pub mod protocol;
pub mod storage;
pub mod transfer;

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum payload carried by a single wire frame (10 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Fixed chunk size for chunk-mode file transfers (64 KiB).
pub const CHUNK_SIZE: usize = 65_536;

/// Files at or above this size take the HTTP transfer path (5 MiB).
pub const LARGE_FILE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Iteration count for the passphrase key derivation.
///
/// Both peers must use the same count or they fail to agree on the secret.
/// (An older build used 100,000; changing this breaks pairing with it.)
pub const KDF_ITERATIONS: u32 = 10_000;

/// Interval between application-level pings.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Inbound silence after which an idle connection is torn down.
pub const KEEPALIVE_TIMEOUT_MS: u64 = 120_000;

/// Grace window after a send completes during which the keepalive timeout
/// stays suppressed (the receiver may be busy writing to disk).
pub const TRANSFER_GRACE_MS: u64 = 120_000;

/// Inbound silence after which an existing peer socket may be displaced by
/// a new inbound connection.
pub const STALE_SOCKET_MS: u64 = 30_000;

/// Silence during a pairing exchange after which it fails terminally.
pub const PAIRING_TIMEOUT_MS: u64 = 30_000;

/// Per-attempt TCP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Number of TCP connect attempts before giving up.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Discovered peers unseen for longer than this are considered stale.
pub const DISCOVERY_STALE_MS: i64 = 30_000;

/// Write batch size for streaming chunk receives (512 KiB).
pub const STREAM_WRITE_BATCH: usize = 512 * 1024;
