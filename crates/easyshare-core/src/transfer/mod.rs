//! Text and file transfer engine.
//!
//! Files below 5 MiB travel as base64 chunks inside protocol frames; files
//! at or above the threshold are offloaded to a single-shot HTTP endpoint
//! (see [`http`]). All pending state lives in two tagged variants,
//! [`ActiveSend`] and [`ActiveReceive`]; the dispatch handler pattern-
//! matches on them instead of juggling loose pending fields.
//!
//! Received bytes are never surfaced as a completed transfer until the
//! verifier passes: the full-data checksum in chunk mode, the streaming
//! digest in the chunk fallback, or the byte count for `size:<N>` tags.

pub mod http;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::crypto::{self, StreamingChecksum};
use crate::device::{epoch_millis, DeviceInfo, Platform};
use crate::error::{Error, Result};
use crate::events::{self, EasyShareEvent, EventSender};
use crate::protocol::{FrameWriter, Message, Payload};
use crate::storage::{self, Storage, TransferDirection, TransferRecord};
use crate::{CHUNK_SIZE, LARGE_FILE_THRESHOLD, STREAM_WRITE_BATCH, TRANSFER_GRACE_MS};

use self::http::{HttpFileServer, UploadConfig};

/// Progress snapshot for an in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Id of the originating `file_request`
    pub request_id: String,
    /// File name
    pub file_name: String,
    /// Direction
    pub direction: TransferDirection,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Total bytes
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Completion and progress reports from HTTP helper tasks, fed back into
/// the dispatch task before any engine state changes.
#[derive(Debug)]
pub enum TransferTaskEvent {
    /// Byte-counter progress from any HTTP stream
    Progress {
        /// Id of the originating `file_request`
        request_id: String,
        /// Cumulative bytes
        bytes: u64,
    },
    /// The upload server finished one `POST` (verified or rejected)
    UploadReceived {
        /// Id of the originating `file_request`
        request_id: String,
        /// Whether verification passed and the file was moved into place
        success: bool,
        /// Content bytes received
        bytes: u64,
    },
    /// The download client finished a `GET`
    DownloadFinished {
        /// Id of the originating `file_request`
        request_id: String,
        /// Whether the size check passed and the file was moved into place
        success: bool,
        /// Bytes downloaded
        bytes: u64,
        /// Failure description
        error: Option<String>,
    },
    /// The multipart upload client finished its `POST`
    UploadSent {
        /// Id of the originating `file_request`
        request_id: String,
        /// Whether the server answered 2xx
        success: bool,
        /// Failure description
        error: Option<String>,
    },
}

/// Policy hook for incoming file offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// Accept every offer (current product behavior)
    #[default]
    AlwaysAccept,
    /// Accept only from paired devices, honoring `auto_accept_from_paired`
    PairedOnly,
}

/// Strip path components from an announced file name.
fn sanitize_file_name(name: &str) -> String {
    let cleaned = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim_start_matches('.')
        .trim();
    if cleaned.is_empty() {
        "received.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Temp path for a streaming receive.
fn temp_path(dir: &std::path::Path) -> PathBuf {
    dir.join(format!(".easyshare_tmp_{}", epoch_millis()))
}

/// Outstanding send, one variant per transfer mode.
enum ActiveSend {
    /// Small file, fully buffered, sent as chunks after `file_accept`
    Small {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        data: Vec<u8>,
        checksum: String,
        started: Instant,
    },
    /// Large file served over our own `GET /transfer/<token>`
    LargeHttpServe {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        server: HttpFileServer,
        started: Instant,
    },
    /// Large file uploaded to the receiver's `POST` endpoint
    LargeHttpUpload {
        request_id: String,
        path: PathBuf,
        file_name: String,
        file_size: u64,
        mime_type: String,
        started: Instant,
        task: Option<tokio::task::JoinHandle<()>>,
    },
}

impl ActiveSend {
    fn request_id(&self) -> &str {
        match self {
            Self::Small { request_id, .. }
            | Self::LargeHttpServe { request_id, .. }
            | Self::LargeHttpUpload { request_id, .. } => request_id,
        }
    }

    fn describe(&self) -> (String, u64, String) {
        match self {
            Self::Small {
                file_name,
                file_size,
                mime_type,
                ..
            }
            | Self::LargeHttpServe {
                file_name,
                file_size,
                mime_type,
                ..
            }
            | Self::LargeHttpUpload {
                file_name,
                file_size,
                mime_type,
                ..
            } => (file_name.clone(), *file_size, mime_type.clone()),
        }
    }

    fn started(&self) -> Instant {
        match self {
            Self::Small { started, .. }
            | Self::LargeHttpServe { started, .. }
            | Self::LargeHttpUpload { started, .. } => *started,
        }
    }
}

/// Outstanding receive, one variant per transfer mode.
enum ActiveReceive {
    /// Small file reassembled in memory from indexed chunks
    Small {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        final_path: PathBuf,
        chunks: BTreeMap<u64, Vec<u8>>,
        started: Instant,
    },
    /// Chunked receive streamed to disk (HTTP server unavailable)
    StreamingChunk {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        temp_path: PathBuf,
        final_path: PathBuf,
        file: tokio::fs::File,
        hasher: StreamingChecksum,
        buffer: Vec<u8>,
        bytes_written: u64,
        started: Instant,
    },
    /// Receiver-side `POST /upload/<token>` server
    HttpUpload {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        final_path: PathBuf,
        temp_path: PathBuf,
        server: HttpFileServer,
        started: Instant,
    },
    /// Streaming `GET` of the sender's `httpUrl`
    HttpDownload {
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        final_path: PathBuf,
        temp_path: PathBuf,
        task: tokio::task::JoinHandle<()>,
        started: Instant,
    },
}

impl ActiveReceive {
    fn request_id(&self) -> &str {
        match self {
            Self::Small { request_id, .. }
            | Self::StreamingChunk { request_id, .. }
            | Self::HttpUpload { request_id, .. }
            | Self::HttpDownload { request_id, .. } => request_id,
        }
    }
}

/// The transfer engine.
///
/// Owned by the connection manager's dispatch task; every method runs on
/// that task, so no internal locking is needed.
pub struct TransferEngine {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    tasks: mpsc::UnboundedSender<TransferTaskEvent>,
    policy: AcceptPolicy,
    remote: Option<DeviceInfo>,
    secret: Option<[u8; 32]>,
    active_send: Option<ActiveSend>,
    active_receive: Option<ActiveReceive>,
    resolver: Option<oneshot::Sender<bool>>,
    grace_until: Option<Instant>,
}

impl TransferEngine {
    /// Create an engine bound to the dispatch task's channels.
    #[must_use]
    pub fn new(
        local: DeviceInfo,
        storage: Arc<dyn Storage>,
        events: EventSender,
        tasks: mpsc::UnboundedSender<TransferTaskEvent>,
        policy: AcceptPolicy,
    ) -> Self {
        Self {
            local,
            storage,
            events,
            tasks,
            policy,
            remote: None,
            secret: None,
            active_send: None,
            active_receive: None,
            resolver: None,
            grace_until: None,
        }
    }

    /// Record the remote peer identity.
    pub fn set_remote(&mut self, remote: Option<DeviceInfo>) {
        self.remote = remote;
    }

    /// The remote peer, when known.
    #[must_use]
    pub fn remote(&self) -> Option<&DeviceInfo> {
        self.remote.as_ref()
    }

    /// Install (or clear) the data-plane session secret.
    pub fn set_secret(&mut self, secret: Option<[u8; 32]>) {
        self.secret = secret;
    }

    /// Whether a transfer is in flight, including the post-send grace
    /// window during which the keepalive timeout stays suppressed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active_send.is_some()
            || self.active_receive.is_some()
            || self.grace_until.is_some_and(|until| Instant::now() < until)
    }

    fn remote_identity(&self) -> (String, String) {
        self.remote.as_ref().map_or_else(
            || ("unknown".to_string(), "Unknown device".to_string()),
            |d| (d.id.clone(), d.name.clone()),
        )
    }

    fn remote_device_or_placeholder(&self) -> DeviceInfo {
        self.remote.clone().unwrap_or(DeviceInfo {
            id: "unknown".to_string(),
            name: "Unknown device".to_string(),
            platform: Platform::Desktop,
            version: "0.0.0".to_string(),
            host: None,
            port: None,
        })
    }

    fn encode_data(&self, bytes: &[u8]) -> Result<String> {
        match &self.secret {
            Some(secret) => Ok(STANDARD.encode(crypto::encrypt(bytes, secret)?)),
            None => Ok(STANDARD.encode(bytes)),
        }
    }

    fn decode_data(&self, data: &str) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(data)
            .map_err(|e| Error::ProtocolError(format!("invalid chunk base64: {e}")))?;
        match &self.secret {
            Some(secret) => crypto::decrypt(&raw, secret),
            None => Ok(raw),
        }
    }

    fn emit_progress(
        &self,
        request_id: &str,
        file_name: &str,
        direction: TransferDirection,
        bytes: u64,
        total: u64,
    ) {
        events::emit(
            &self.events,
            EasyShareEvent::TransferProgress(Some(TransferProgress {
                request_id: request_id.to_string(),
                file_name: file_name.to_string(),
                direction,
                bytes_transferred: bytes,
                total_bytes: total,
            })),
        );
    }

    fn clear_progress(&self) {
        events::emit(&self.events, EasyShareEvent::TransferProgress(None));
    }

    fn record(&self, record: TransferRecord) {
        if let Err(e) = self.storage.add_transfer(record.clone()) {
            tracing::warn!("failed to persist transfer: {e}");
        }
        events::emit(&self.events, EasyShareEvent::TransferComplete(record));
    }

    fn resolve_send(&mut self, success: bool) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(success);
        }
    }

    fn start_grace(&mut self) {
        self.grace_until =
            Some(Instant::now() + std::time::Duration::from_millis(TRANSFER_GRACE_MS));
    }

    // -----------------------------------------------------------------------
    // Text
    // -----------------------------------------------------------------------

    /// Send a text message. The local history entry is synthesized
    /// immediately; no acknowledgement is awaited.
    pub async fn send_text<W: AsyncWrite + Unpin>(
        &mut self,
        content: &str,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        let on_wire = match &self.secret {
            Some(secret) => STANDARD.encode(crypto::encrypt(content.as_bytes(), secret)?),
            None => content.to_string(),
        };
        wire.send(&Message::new(Payload::Text { content: on_wire })).await;

        let (device_id, device_name) = self.remote_identity();
        self.record(TransferRecord::text(
            TransferDirection::Send,
            device_id,
            device_name,
            content.to_string(),
        ));
        Ok(())
    }

    fn receive_text(&mut self, content: &str) {
        let text = match &self.secret {
            Some(secret) => STANDARD
                .decode(content)
                .ok()
                .and_then(|raw| crypto::decrypt(&raw, secret).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| content.to_string()),
            None => content.to_string(),
        };

        let (device_id, device_name) = self.remote_identity();
        events::emit(
            &self.events,
            EasyShareEvent::TextReceived {
                content: text.clone(),
                from: self.remote_device_or_placeholder(),
            },
        );
        self.record(TransferRecord::text(
            TransferDirection::Receive,
            device_id,
            device_name,
            text,
        ));
    }

    // -----------------------------------------------------------------------
    // File send
    // -----------------------------------------------------------------------

    /// Begin sending a file. The resolver fires exactly once: `true` on
    /// verified completion, `false` on rejection, failure or disconnect.
    pub async fn send_file<W: AsyncWrite + Unpin>(
        &mut self,
        path: PathBuf,
        resolver: oneshot::Sender<bool>,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        if self.active_send.is_some() {
            tracing::warn!("send already in flight, refusing");
            let _ = resolver.send(false);
            return Ok(());
        }
        self.resolver = Some(resolver);

        if let Err(e) = self.start_send(path, wire).await {
            tracing::warn!("failed to start file send: {e}");
            self.active_send = None;
            self.resolve_send(false);
            self.clear_progress();
        }
        Ok(())
    }

    async fn start_send<W: AsyncWrite + Unpin>(
        &mut self,
        path: PathBuf,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(&path).await?;
        let file_size = metadata.len();
        let file_name = path
            .file_name()
            .map_or_else(|| "file.bin".to_string(), |n| n.to_string_lossy().to_string());
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();
        let request_id = crypto::generate_message_id();

        if file_size >= LARGE_FILE_THRESHOLD {
            if self.local.platform == Platform::Mobile {
                self.start_send_large_upload(path, request_id, file_name, file_size, mime_type, wire)
                    .await
            } else {
                self.start_send_large_serve(path, request_id, file_name, file_size, mime_type, wire)
                    .await
            }
        } else {
            self.start_send_small(path, request_id, file_name, file_size, mime_type, wire)
                .await
        }
    }

    async fn start_send_small<W: AsyncWrite + Unpin>(
        &mut self,
        path: PathBuf,
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        let data = tokio::fs::read(&path).await?;
        let checksum = crypto::checksum(&data);

        let message = Message {
            id: request_id.clone(),
            timestamp: epoch_millis(),
            payload: Payload::FileRequest {
                file_name: file_name.clone(),
                file_size,
                mime_type: mime_type.clone(),
                checksum: checksum.clone(),
                http_url: None,
            },
        };
        self.active_send = Some(ActiveSend::Small {
            request_id,
            file_name,
            file_size,
            mime_type,
            data,
            checksum,
            started: Instant::now(),
        });
        wire.send(&message).await;
        Ok(())
    }

    async fn start_send_large_serve<W: AsyncWrite + Unpin>(
        &mut self,
        path: PathBuf,
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        // Stream the checksum; a file this size is never read fully into
        // memory.
        let mut file = tokio::fs::File::open(&path).await?;
        let mut hasher = StreamingChecksum::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let checksum = hasher.digest();

        let token = Uuid::new_v4().to_string();
        let server = http::serve_download(
            path,
            file_name.clone(),
            file_size,
            token.clone(),
            request_id.clone(),
            self.tasks.clone(),
        )
        .await?;
        let ip = http::local_ip_for(self.remote.as_ref().and_then(|d| d.host.as_deref()));
        let http_url = format!("http://{ip}:{}/transfer/{token}", server.port());

        let message = Message {
            id: request_id.clone(),
            timestamp: epoch_millis(),
            payload: Payload::FileRequest {
                file_name: file_name.clone(),
                file_size,
                mime_type: mime_type.clone(),
                checksum,
                http_url: Some(http_url),
            },
        };
        self.active_send = Some(ActiveSend::LargeHttpServe {
            request_id,
            file_name,
            file_size,
            mime_type,
            server,
            started: Instant::now(),
        });
        wire.send(&message).await;
        Ok(())
    }

    async fn start_send_large_upload<W: AsyncWrite + Unpin>(
        &mut self,
        path: PathBuf,
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        let message = Message {
            id: request_id.clone(),
            timestamp: epoch_millis(),
            payload: Payload::FileRequest {
                file_name: file_name.clone(),
                file_size,
                mime_type: mime_type.clone(),
                checksum: crypto::size_tag(file_size),
                http_url: None,
            },
        };
        self.active_send = Some(ActiveSend::LargeHttpUpload {
            request_id,
            path,
            file_name,
            file_size,
            mime_type,
            started: Instant::now(),
            task: None,
        });
        wire.send(&message).await;
        Ok(())
    }

    async fn on_file_accept<W: AsyncWrite + Unpin>(
        &mut self,
        request_id: &str,
        upload_url: Option<String>,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        match self.active_send.as_ref() {
            Some(send) if send.request_id() == request_id => {}
            _ => {
                tracing::debug!(%request_id, "file_accept for unknown request");
                return Ok(());
            }
        }

        match self.active_send.take() {
            Some(ActiveSend::Small {
                request_id,
                file_name,
                file_size,
                mime_type,
                data,
                checksum,
                started,
            }) => {
                self.send_chunks(&request_id, &file_name, file_size, &data, wire)
                    .await?;
                wire.send(&Message::new(Payload::FileComplete {
                    request_id: request_id.clone(),
                    checksum,
                }))
                .await;

                // Chunk mode is best-effort: the send entry is recorded
                // optimistically on file_complete emission.
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let (device_id, device_name) = self.remote_identity();
                self.record(TransferRecord::file(
                    TransferDirection::Send,
                    device_id,
                    device_name,
                    file_name,
                    file_size,
                    mime_type,
                    None,
                    Some(duration_ms),
                ));
                self.clear_progress();
                self.resolve_send(true);
                self.start_grace();
            }
            Some(ActiveSend::LargeHttpUpload {
                request_id,
                path,
                file_name,
                file_size,
                mime_type,
                started,
                ..
            }) => {
                let Some(url) = upload_url else {
                    tracing::warn!("receiver accepted without an upload URL");
                    self.resolve_send(false);
                    self.clear_progress();
                    return Ok(());
                };
                let task = http::spawn_multipart_upload(
                    url,
                    path.clone(),
                    file_name.clone(),
                    mime_type.clone(),
                    file_size,
                    request_id.clone(),
                    self.tasks.clone(),
                );
                self.active_send = Some(ActiveSend::LargeHttpUpload {
                    request_id,
                    path,
                    file_name,
                    file_size,
                    mime_type,
                    started,
                    task: Some(task),
                });
            }
            // The HTTP-serve sender just waits for the receiver's download
            // and the terminal file_ack.
            Some(other) => self.active_send = Some(other),
            None => {}
        }
        Ok(())
    }

    async fn send_chunks<W: AsyncWrite + Unpin>(
        &mut self,
        request_id: &str,
        file_name: &str,
        file_size: u64,
        data: &[u8],
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        let total_chunks = data.len().div_ceil(CHUNK_SIZE) as u64;
        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let message = Message::new(Payload::FileChunk {
                request_id: request_id.to_string(),
                chunk_index: index as u64,
                total_chunks,
                data: self.encode_data(chunk)?,
            });
            // FrameWriter::send awaits the flush, so socket backpressure
            // paces the chunk loop.
            wire.send(&message).await;

            let sent = (index * CHUNK_SIZE + chunk.len()) as u64;
            self.emit_progress(
                request_id,
                file_name,
                TransferDirection::Send,
                sent,
                file_size,
            );
        }
        Ok(())
    }

    fn on_file_reject(&mut self, request_id: &str, reason: &str) {
        if self
            .active_send
            .as_ref()
            .is_some_and(|s| s.request_id() == request_id)
        {
            tracing::info!(%request_id, %reason, "file offer rejected");
            self.active_send = None;
            self.resolve_send(false);
            self.clear_progress();
        }
    }

    fn on_file_ack(&mut self, request_id: &str, success: bool) {
        if !self
            .active_send
            .as_ref()
            .is_some_and(|s| s.request_id() == request_id)
        {
            return;
        }
        let Some(send) = self.active_send.take() else {
            return;
        };
        let (file_name, file_size, mime_type) = send.describe();
        let started = send.started();
        // Dropping a LargeHttpServe variant shuts its HTTP server down.
        drop(send);

        if success {
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let (device_id, device_name) = self.remote_identity();
            self.record(TransferRecord::file(
                TransferDirection::Send,
                device_id,
                device_name,
                file_name,
                file_size,
                mime_type,
                None,
                Some(duration_ms),
            ));
        } else {
            tracing::warn!(%request_id, "receiver reported transfer failure");
        }
        self.clear_progress();
        self.resolve_send(success);
        self.start_grace();
    }

    // -----------------------------------------------------------------------
    // File receive
    // -----------------------------------------------------------------------

    fn accepts_offer(&self) -> bool {
        match self.policy {
            AcceptPolicy::AlwaysAccept => true,
            AcceptPolicy::PairedOnly => {
                let auto = self
                    .storage
                    .settings()
                    .map(|s| s.auto_accept_from_paired)
                    .unwrap_or(false);
                let paired = self.remote.as_ref().is_some_and(|remote| {
                    storage::find_paired(self.storage.as_ref(), &remote.id)
                        .ok()
                        .flatten()
                        .is_some()
                });
                auto && paired
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn on_file_request<W: AsyncWrite + Unpin>(
        &mut self,
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        checksum: String,
        http_url: Option<String>,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        if self.active_receive.is_some() {
            wire.send(&Message::new(Payload::FileReject {
                request_id,
                reason: "Another transfer is in progress".to_string(),
            }))
            .await;
            return Ok(());
        }
        if !self.accepts_offer() {
            wire.send(&Message::new(Payload::FileReject {
                request_id,
                reason: "Transfer refused".to_string(),
            }))
            .await;
            return Ok(());
        }

        let save_dir = self
            .storage
            .settings()
            .map(|s| s.save_directory)
            .unwrap_or_else(|_| PathBuf::from("."));
        tokio::fs::create_dir_all(&save_dir).await?;
        let safe_name = sanitize_file_name(&file_name);
        let final_path = save_dir.join(&safe_name);

        if let Some(url) = http_url {
            // The sender serves the file; stream it down.
            let temp = temp_path(&save_dir);
            let task = http::spawn_download(
                url,
                temp.clone(),
                final_path.clone(),
                file_size,
                request_id.clone(),
                self.tasks.clone(),
            );
            self.active_receive = Some(ActiveReceive::HttpDownload {
                request_id: request_id.clone(),
                file_name: safe_name,
                file_size,
                mime_type,
                final_path,
                temp_path: temp,
                task,
                started: Instant::now(),
            });
            wire.send(&Message::new(Payload::FileAccept {
                request_id,
                upload_url: None,
            }))
            .await;
        } else if file_size >= LARGE_FILE_THRESHOLD {
            let temp = temp_path(&save_dir);
            let token = Uuid::new_v4().to_string();
            match http::serve_upload(
                UploadConfig {
                    token: token.clone(),
                    request_id: request_id.clone(),
                    expected_checksum: checksum,
                    temp_path: temp.clone(),
                    final_path: final_path.clone(),
                },
                self.tasks.clone(),
            )
            .await
            {
                Ok(server) => {
                    let ip =
                        http::local_ip_for(self.remote.as_ref().and_then(|d| d.host.as_deref()));
                    let upload_url = format!("http://{ip}:{}/upload/{token}", server.port());
                    self.active_receive = Some(ActiveReceive::HttpUpload {
                        request_id: request_id.clone(),
                        file_name: safe_name,
                        file_size,
                        mime_type,
                        final_path,
                        temp_path: temp,
                        server,
                        started: Instant::now(),
                    });
                    wire.send(&Message::new(Payload::FileAccept {
                        request_id,
                        upload_url: Some(upload_url),
                    }))
                    .await;
                }
                Err(e) => {
                    // Fall back to streaming the chunks straight to disk.
                    tracing::warn!("upload server unavailable, using chunk fallback: {e}");
                    let file = tokio::fs::File::create(&temp).await?;
                    self.active_receive = Some(ActiveReceive::StreamingChunk {
                        request_id: request_id.clone(),
                        file_name: safe_name,
                        file_size,
                        mime_type,
                        temp_path: temp,
                        final_path,
                        file,
                        hasher: StreamingChecksum::new(),
                        buffer: Vec::with_capacity(STREAM_WRITE_BATCH),
                        bytes_written: 0,
                        started: Instant::now(),
                    });
                    wire.send(&Message::new(Payload::FileAccept {
                        request_id,
                        upload_url: None,
                    }))
                    .await;
                }
            }
        } else {
            self.active_receive = Some(ActiveReceive::Small {
                request_id: request_id.clone(),
                file_name: safe_name,
                file_size,
                mime_type,
                final_path,
                chunks: BTreeMap::new(),
                started: Instant::now(),
            });
            wire.send(&Message::new(Payload::FileAccept {
                request_id,
                upload_url: None,
            }))
            .await;
        }
        Ok(())
    }

    async fn on_file_chunk(
        &mut self,
        request_id: &str,
        chunk_index: u64,
        data: &str,
    ) -> Result<()> {
        let decoded = match self.decode_data(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("dropping transfer, chunk decode failed: {e}");
                self.abandon_receive().await;
                return Ok(());
            }
        };

        // (file_name, file_size, bytes so far) for the progress report,
        // collected before the mutable borrow ends.
        let progress: Option<(String, u64, u64)> = match self.active_receive.as_mut() {
            Some(ActiveReceive::Small {
                request_id: id,
                file_name,
                file_size,
                chunks,
                ..
            }) if id == request_id => {
                chunks.insert(chunk_index, decoded);
                let received = ((chunks.len() * CHUNK_SIZE) as u64).min(*file_size);
                Some((file_name.clone(), *file_size, received))
            }
            Some(ActiveReceive::StreamingChunk {
                request_id: id,
                file_name,
                file_size,
                file,
                hasher,
                buffer,
                bytes_written,
                ..
            }) if id == request_id => {
                hasher.update(&decoded);
                buffer.extend_from_slice(&decoded);
                // Batched writes amortize I/O crossings.
                if buffer.len() >= STREAM_WRITE_BATCH {
                    file.write_all(buffer).await?;
                    *bytes_written += buffer.len() as u64;
                    buffer.clear();
                }
                Some((
                    file_name.clone(),
                    *file_size,
                    *bytes_written + buffer.len() as u64,
                ))
            }
            _ => {
                tracing::debug!(%request_id, chunk_index, "chunk for unknown transfer");
                None
            }
        };

        if let Some((file_name, file_size, bytes)) = progress {
            self.emit_progress(
                request_id,
                &file_name,
                TransferDirection::Receive,
                bytes,
                file_size,
            );
        }
        Ok(())
    }

    async fn on_file_complete(&mut self, request_id: &str, expected: &str) -> Result<()> {
        if !self
            .active_receive
            .as_ref()
            .is_some_and(|r| r.request_id() == request_id)
        {
            tracing::debug!(%request_id, "file_complete for unknown transfer");
            return Ok(());
        }

        match self.active_receive.take() {
            Some(ActiveReceive::Small {
                file_name,
                file_size,
                mime_type,
                final_path,
                chunks,
                started,
                ..
            }) => {
                // Reassemble in ascending chunk order.
                let mut data = Vec::with_capacity(usize::try_from(file_size).unwrap_or(0));
                for chunk in chunks.into_values() {
                    data.extend_from_slice(&chunk);
                }

                if crypto::checksum(&data) == expected {
                    tokio::fs::write(&final_path, &data).await?;
                    let duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    let (device_id, device_name) = self.remote_identity();
                    self.record(TransferRecord::file(
                        TransferDirection::Receive,
                        device_id,
                        device_name,
                        file_name,
                        file_size,
                        mime_type,
                        Some(final_path),
                        Some(duration_ms),
                    ));
                } else {
                    // Integrity failure: the bytes are dropped and no
                    // history entry is produced.
                    tracing::warn!(%file_name, "chunk transfer checksum mismatch");
                }
                self.clear_progress();
            }
            Some(ActiveReceive::StreamingChunk {
                file_name,
                file_size,
                mime_type,
                temp_path,
                final_path,
                mut file,
                hasher,
                buffer,
                mut bytes_written,
                started,
                ..
            }) => {
                if !buffer.is_empty() {
                    file.write_all(&buffer).await?;
                    bytes_written += buffer.len() as u64;
                }
                file.flush().await?;
                drop(file);

                if hasher.digest() == expected {
                    tokio::fs::rename(&temp_path, &final_path).await?;
                    let duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    let (device_id, device_name) = self.remote_identity();
                    tracing::debug!(bytes_written, "streaming receive verified");
                    self.record(TransferRecord::file(
                        TransferDirection::Receive,
                        device_id,
                        device_name,
                        file_name,
                        file_size,
                        mime_type,
                        Some(final_path),
                        Some(duration_ms),
                    ));
                } else {
                    tracing::warn!(%file_name, "streaming receive checksum mismatch");
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }
                self.clear_progress();
            }
            other => self.active_receive = other,
        }
        Ok(())
    }

    async fn abandon_receive(&mut self) {
        if let Some(receive) = self.active_receive.take() {
            match receive {
                ActiveReceive::StreamingChunk { temp_path, .. }
                | ActiveReceive::HttpUpload { temp_path, .. } => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }
                ActiveReceive::HttpDownload {
                    temp_path, task, ..
                } => {
                    task.abort();
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }
                ActiveReceive::Small { .. } => {}
            }
        }
        self.clear_progress();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch a data-plane message.
    pub async fn handle_message<W: AsyncWrite + Unpin>(
        &mut self,
        message: &Message,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        match &message.payload {
            Payload::Text { content } => {
                self.receive_text(content);
                Ok(())
            }
            Payload::FileRequest {
                file_name,
                file_size,
                mime_type,
                checksum,
                http_url,
            } => {
                self.on_file_request(
                    message.id.clone(),
                    file_name.clone(),
                    *file_size,
                    mime_type.clone(),
                    checksum.clone(),
                    http_url.clone(),
                    wire,
                )
                .await
            }
            Payload::FileAccept {
                request_id,
                upload_url,
            } => self.on_file_accept(request_id, upload_url.clone(), wire).await,
            Payload::FileReject { request_id, reason } => {
                self.on_file_reject(request_id, reason);
                Ok(())
            }
            Payload::FileChunk {
                request_id,
                chunk_index,
                data,
                ..
            } => self.on_file_chunk(request_id, *chunk_index, data).await,
            Payload::FileComplete {
                request_id,
                checksum,
            } => self.on_file_complete(request_id, checksum).await,
            Payload::FileAck {
                request_id,
                success,
            } => {
                self.on_file_ack(request_id, *success);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Apply a completion or progress report from an HTTP helper task.
    pub async fn handle_task_event<W: AsyncWrite + Unpin>(
        &mut self,
        event: TransferTaskEvent,
        wire: &mut FrameWriter<W>,
    ) -> Result<()> {
        match event {
            TransferTaskEvent::Progress { request_id, bytes } => {
                if let Some(send) = self.active_send.as_ref() {
                    if send.request_id() == request_id {
                        let (file_name, file_size, _) = send.describe();
                        self.emit_progress(
                            &request_id,
                            &file_name,
                            TransferDirection::Send,
                            bytes,
                            file_size,
                        );
                        return Ok(());
                    }
                }
                match self.active_receive.as_ref() {
                    Some(ActiveReceive::HttpUpload {
                        request_id: id,
                        file_name,
                        file_size,
                        ..
                    })
                    | Some(ActiveReceive::HttpDownload {
                        request_id: id,
                        file_name,
                        file_size,
                        ..
                    }) if *id == request_id => {
                        let (file_name, file_size) = (file_name.clone(), *file_size);
                        self.emit_progress(
                            &request_id,
                            &file_name,
                            TransferDirection::Receive,
                            bytes,
                            file_size,
                        );
                    }
                    _ => {}
                }
                Ok(())
            }
            TransferTaskEvent::UploadReceived {
                request_id,
                success,
                bytes,
            } => {
                if !self
                    .active_receive
                    .as_ref()
                    .is_some_and(|r| r.request_id() == request_id)
                {
                    return Ok(());
                }
                if let Some(ActiveReceive::HttpUpload {
                    file_name,
                    file_size,
                    mime_type,
                    final_path,
                    server,
                    started,
                    ..
                }) = self.active_receive.take()
                {
                    server.shutdown();
                    if success {
                        tracing::debug!(bytes, "upload receive verified");
                        let duration_ms =
                            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        let (device_id, device_name) = self.remote_identity();
                        self.record(TransferRecord::file(
                            TransferDirection::Receive,
                            device_id,
                            device_name,
                            file_name,
                            file_size,
                            mime_type,
                            Some(final_path),
                            Some(duration_ms),
                        ));
                    }
                    wire.send(&Message::new(Payload::FileAck {
                        request_id,
                        success,
                    }))
                    .await;
                    self.clear_progress();
                }
                Ok(())
            }
            TransferTaskEvent::DownloadFinished {
                request_id,
                success,
                bytes,
                error,
            } => {
                if !self
                    .active_receive
                    .as_ref()
                    .is_some_and(|r| r.request_id() == request_id)
                {
                    return Ok(());
                }
                if let Some(ActiveReceive::HttpDownload {
                    file_name,
                    file_size,
                    mime_type,
                    final_path,
                    started,
                    ..
                }) = self.active_receive.take()
                {
                    if success {
                        tracing::debug!(bytes, "download verified");
                        let duration_ms =
                            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        let (device_id, device_name) = self.remote_identity();
                        self.record(TransferRecord::file(
                            TransferDirection::Receive,
                            device_id,
                            device_name,
                            file_name,
                            file_size,
                            mime_type,
                            Some(final_path),
                            Some(duration_ms),
                        ));
                    } else if let Some(error) = error {
                        tracing::warn!(%error, "download failed");
                    }
                    wire.send(&Message::new(Payload::FileAck {
                        request_id,
                        success,
                    }))
                    .await;
                    self.clear_progress();
                }
                Ok(())
            }
            TransferTaskEvent::UploadSent {
                request_id,
                success,
                error,
            } => {
                if !success
                    && self
                        .active_send
                        .as_ref()
                        .is_some_and(|s| s.request_id() == request_id)
                {
                    if let Some(error) = error {
                        tracing::warn!(%error, "multipart upload failed");
                    }
                    self.active_send = None;
                    self.resolve_send(false);
                    self.clear_progress();
                }
                // On success the terminal signal is the receiver's file_ack.
                Ok(())
            }
        }
    }

    /// Tear down all transfer state after a disconnect.
    ///
    /// Resolves the outstanding send as `false`, unlinks temp files, shuts
    /// HTTP servers down and clears the progress display. No history entry
    /// is produced.
    pub async fn on_disconnect(&mut self) {
        self.resolve_send(false);
        if let Some(send) = self.active_send.take() {
            // LargeHttpServe's server shuts down on drop.
            if let ActiveSend::LargeHttpUpload {
                task: Some(task), ..
            } = &send
            {
                task.abort();
            }
            drop(send);
        }
        self.abandon_receive().await;
        self.grace_until = None;
    }
}
