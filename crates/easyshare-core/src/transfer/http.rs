//! Auxiliary HTTP endpoints for large-file transfers.
//!
//! Files at or above the 5 MiB threshold bypass the chunked TCP path: one
//! side stands up a single-shot HTTP server for the duration of the
//! transfer and the other side streams through it.
//!
//! - `GET /transfer/<token>` - the sender serves one file for download
//! - `POST /upload/<token>` - the receiver accepts one file upload, either
//!   `multipart/form-data` (first file part, any field name) or a raw body
//!
//! Tokens are unguessable random UUIDs; any other path, token or method
//! gets a 404. Servers are shut down after the first transfer, successful
//! or not.

use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;

use crate::crypto::{parse_size_tag, StreamingChecksum};
use crate::error::{Error, Result};

use super::TransferTaskEvent;

/// Progress events are emitted at most once per this many bytes.
const PROGRESS_STRIDE: u64 = 256 * 1024;

/// Byte counter that forwards throttled progress events.
struct ProgressMeter {
    request_id: String,
    tx: mpsc::UnboundedSender<TransferTaskEvent>,
    sent: u64,
    reported: u64,
}

impl ProgressMeter {
    fn new(request_id: String, tx: mpsc::UnboundedSender<TransferTaskEvent>) -> Self {
        Self {
            request_id,
            tx,
            sent: 0,
            reported: 0,
        }
    }

    fn add(&mut self, bytes: usize) {
        self.sent += bytes as u64;
        if self.sent - self.reported >= PROGRESS_STRIDE {
            self.reported = self.sent;
            let _ = self.tx.send(TransferTaskEvent::Progress {
                request_id: self.request_id.clone(),
                bytes: self.sent,
            });
        }
    }

    fn finish(&mut self) {
        if self.sent > self.reported {
            self.reported = self.sent;
            let _ = self.tx.send(TransferTaskEvent::Progress {
                request_id: self.request_id.clone(),
                bytes: self.sent,
            });
        }
    }
}

/// Handle to a running single-shot HTTP server.
///
/// Dropping the handle shuts the server down.
#[derive(Debug)]
pub struct HttpFileServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HttpFileServer {
    /// The ephemeral port the server is bound to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Shut the server down.
    pub fn shutdown(mut self) {
        self.trigger();
    }

    fn trigger(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for HttpFileServer {
    fn drop(&mut self) {
        self.trigger();
    }
}

/// Determine the local address a peer can reach us on.
///
/// Routes a connectionless socket toward the peer (or a public address when
/// the peer is unknown) and reads back the chosen source address; no
/// packets are sent.
#[must_use]
pub fn local_ip_for(peer_host: Option<&str>) -> String {
    let target = peer_host.map_or_else(|| "8.8.8.8:80".to_string(), |h| format!("{h}:80"));
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect(&target).is_ok() {
            if let Ok(local) = socket.local_addr() {
                return local.ip().to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

// ---------------------------------------------------------------------------
// Download server (sender side)
// ---------------------------------------------------------------------------

struct DownloadState {
    token: String,
    path: PathBuf,
    file_name: String,
    file_size: u64,
    request_id: String,
    progress: mpsc::UnboundedSender<TransferTaskEvent>,
}

/// Serve one file at `GET /transfer/<token>` on an ephemeral port.
///
/// Progress is reported from the byte counter on the outgoing stream.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve_download(
    path: PathBuf,
    file_name: String,
    file_size: u64,
    token: String,
    request_id: String,
    progress: mpsc::UnboundedSender<TransferTaskEvent>,
) -> Result<HttpFileServer> {
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::Http(format!("failed to bind download server: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Http(format!("no local addr: {e}")))?
        .port();

    let state = Arc::new(DownloadState {
        token,
        path,
        file_name,
        file_size,
        request_id,
        progress,
    });

    let app = Router::new()
        .route("/transfer/{token}", any(download_handler))
        .fallback(not_found)
        .with_state(state);

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::debug!("download server exited: {e}");
        }
    });

    tracing::debug!(port, "download server up");
    Ok(HttpFileServer {
        port,
        shutdown: Some(tx),
    })
}

async fn download_handler(
    method: Method,
    Path(token): Path<String>,
    State(state): State<Arc<DownloadState>>,
) -> Response {
    if method != Method::GET || token != state.token {
        return StatusCode::NOT_FOUND.into_response();
    }

    let file = match tokio::fs::File::open(&state.path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("failed to open {}: {e}", state.path.display());
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut meter = ProgressMeter::new(state.request_id.clone(), state.progress.clone());
    let total = state.file_size;
    let stream = ReaderStream::with_capacity(file, 64 * 1024).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            meter.add(bytes.len());
            if meter.sent >= total {
                meter.finish();
            }
        }
        chunk
    });

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, state.file_size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", state.file_name),
        );
    match builder.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("failed to build download response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Upload server (receiver side)
// ---------------------------------------------------------------------------

/// Configuration for a single-shot upload endpoint.
#[derive(Debug)]
pub struct UploadConfig {
    /// URL token
    pub token: String,
    /// `file_request` id, echoed in task events
    pub request_id: String,
    /// Expected checksum (`size:<N>` or base64 truncated digest)
    pub expected_checksum: String,
    /// Temp path written during the upload
    pub temp_path: PathBuf,
    /// Final path after verification
    pub final_path: PathBuf,
}

struct UploadState {
    config: UploadConfig,
    consumed: AtomicBool,
    progress: mpsc::UnboundedSender<TransferTaskEvent>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Accept one file at `POST /upload/<token>` on an ephemeral port.
///
/// The body is streamed to the temp path while a running hash and byte
/// count are maintained; verification, rename and the terminal
/// [`TransferTaskEvent::UploadReceived`] all happen inside the handler, and
/// the server shuts itself down afterwards.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve_upload(
    config: UploadConfig,
    progress: mpsc::UnboundedSender<TransferTaskEvent>,
) -> Result<HttpFileServer> {
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::Http(format!("failed to bind upload server: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Http(format!("no local addr: {e}")))?
        .port();

    let (tx, rx) = oneshot::channel::<()>();
    let (handler_tx, handler_rx) = oneshot::channel::<()>();

    let state = Arc::new(UploadState {
        config,
        consumed: AtomicBool::new(false),
        progress,
        shutdown: Mutex::new(Some(handler_tx)),
    });

    let app = Router::new()
        .route("/upload/{token}", any(upload_handler))
        .fallback(not_found)
        .with_state(state);

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                // Either the owner or the handler ends the server.
                tokio::select! {
                    _ = rx => {}
                    _ = handler_rx => {}
                }
            })
            .await;
        if let Err(e) = result {
            tracing::debug!("upload server exited: {e}");
        }
    });

    tracing::debug!(port, "upload server up");
    Ok(HttpFileServer {
        port,
        shutdown: Some(tx),
    })
}

async fn upload_handler(
    method: Method,
    Path(token): Path<String>,
    State(state): State<Arc<UploadState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method != Method::POST || token != state.config.token {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.consumed.swap(true, Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let boundary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(multipart_boundary);

    let outcome = receive_body(&state, body, boundary).await;

    let success = match outcome {
        Ok(bytes) => {
            let _ = state.progress.send(TransferTaskEvent::UploadReceived {
                request_id: state.config.request_id.clone(),
                success: true,
                bytes,
            });
            true
        }
        Err(e) => {
            tracing::warn!("upload rejected: {e}");
            let _ = tokio::fs::remove_file(&state.config.temp_path).await;
            let _ = state.progress.send(TransferTaskEvent::UploadReceived {
                request_id: state.config.request_id.clone(),
                success: false,
                bytes: 0,
            });
            false
        }
    };

    if let Ok(mut guard) = state.shutdown.lock() {
        if let Some(tx) = guard.take() {
            let _ = tx.send(());
        }
    }

    if success {
        (StatusCode::OK, "ok").into_response()
    } else {
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// Stream the request body to the temp path, verify, and move it into
/// place. Returns the received content byte count.
async fn receive_body(
    state: &UploadState,
    body: Body,
    boundary: Option<String>,
) -> Result<u64> {
    let config = &state.config;
    let mut slicer = boundary.map(|b| MultipartSlicer::new(&b));

    let mut file = tokio::fs::File::create(&config.temp_path).await?;
    let mut hasher = StreamingChecksum::new();
    let mut meter = ProgressMeter::new(config.request_id.clone(), state.progress.clone());
    let mut count: u64 = 0;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Http(format!("upload body error: {e}")))?;
        let content = match slicer.as_mut() {
            Some(slicer) => slicer.feed(&chunk),
            None => chunk.to_vec(),
        };
        if !content.is_empty() {
            hasher.update(&content);
            file.write_all(&content).await?;
            count += content.len() as u64;
            meter.add(content.len());
        }
    }
    file.flush().await?;
    drop(file);
    meter.finish();

    if let Some(slicer) = slicer {
        if !slicer.is_done() {
            return Err(Error::Http("multipart body ended before boundary".to_string()));
        }
    }

    match parse_size_tag(&config.expected_checksum) {
        Some(expected) if count == expected => {}
        Some(expected) => {
            return Err(Error::SizeMismatch {
                expected,
                actual: count,
            });
        }
        None => {
            let digest = hasher.digest();
            if digest != config.expected_checksum {
                return Err(Error::ChecksumMismatch {
                    file: config
                        .final_path
                        .file_name()
                        .map_or_else(String::new, |n| n.to_string_lossy().to_string()),
                });
            }
        }
    }

    tokio::fs::rename(&config.temp_path, &config.final_path).await?;
    Ok(count)
}

/// Extract the multipart boundary from a Content-Type header value.
fn multipart_boundary(content_type: &str) -> Option<String> {
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return None;
    }
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))?;
    Some(boundary.trim_matches('"').to_string())
}

/// Incremental extractor for the first file part of a multipart body.
///
/// Feeds return content bytes as soon as they are known to precede the
/// closing boundary; at most one delimiter-length tail is withheld between
/// feeds, so the body never accumulates in memory.
struct MultipartSlicer {
    /// `\r\n--<boundary>`, the delimiter that terminates the content
    delimiter: Vec<u8>,
    /// `--<boundary>`, expected at the start of the body
    opening: Vec<u8>,
    buf: Vec<u8>,
    state: SlicerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlicerState {
    /// Consuming the opening boundary and part headers
    Headers,
    /// Streaming content until the closing delimiter
    Content,
    /// Closing delimiter seen; remaining bytes are epilogue
    Done,
}

impl MultipartSlicer {
    fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("\r\n--{boundary}").into_bytes(),
            opening: format!("--{boundary}").into_bytes(),
            buf: Vec::new(),
            state: SlicerState::Headers,
        }
    }

    const fn is_done(&self) -> bool {
        matches!(self.state, SlicerState::Done)
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        if self.state == SlicerState::Done {
            return Vec::new();
        }
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        if self.state == SlicerState::Headers {
            // Content starts after the first `\r\n\r\n` following the
            // opening boundary.
            let Some(opening) = find(&self.buf, &self.opening) else {
                return out;
            };
            let Some(headers_end) = find(&self.buf[opening..], b"\r\n\r\n") else {
                return out;
            };
            self.buf.drain(..opening + headers_end + 4);
            self.state = SlicerState::Content;
        }

        if let Some(pos) = find(&self.buf, &self.delimiter) {
            out.extend_from_slice(&self.buf[..pos]);
            self.buf.clear();
            self.state = SlicerState::Done;
        } else if self.buf.len() > self.delimiter.len() {
            // Everything except a possible delimiter prefix is content.
            let safe = self.buf.len() - self.delimiter.len();
            out.extend_from_slice(&self.buf[..safe]);
            self.buf.drain(..safe);
        }
        out
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// HTTP client paths
// ---------------------------------------------------------------------------

/// Download `url` to `temp_path`, verify the byte count against
/// `expected_size`, and move the file to `final_path`.
///
/// Posts [`TransferTaskEvent::DownloadFinished`] when done either way; the
/// temp file never survives a failure.
pub fn spawn_download(
    url: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    expected_size: u64,
    request_id: String,
    events: mpsc::UnboundedSender<TransferTaskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = download_to(&url, &temp_path, expected_size, &request_id, &events).await;
        let event = match result {
            Ok(bytes) => match tokio::fs::rename(&temp_path, &final_path).await {
                Ok(()) => TransferTaskEvent::DownloadFinished {
                    request_id,
                    success: true,
                    bytes,
                    error: None,
                },
                Err(e) => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    TransferTaskEvent::DownloadFinished {
                        request_id,
                        success: false,
                        bytes,
                        error: Some(e.to_string()),
                    }
                }
            },
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                TransferTaskEvent::DownloadFinished {
                    request_id,
                    success: false,
                    bytes: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        let _ = events.send(event);
    })
}

async fn download_to(
    url: &str,
    temp_path: &FsPath,
    expected_size: u64,
    request_id: &str,
    events: &mpsc::UnboundedSender<TransferTaskEvent>,
) -> Result<u64> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Http(format!("download failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Http(format!(
            "download failed with status {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut meter = ProgressMeter::new(request_id.to_string(), events.clone());
    let mut count: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Http(format!("download body error: {e}")))?;
        file.write_all(&chunk).await?;
        count += chunk.len() as u64;
        meter.add(chunk.len());
    }
    file.flush().await?;
    meter.finish();

    if count != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: count,
        });
    }
    Ok(count)
}

/// Upload `path` to `url` as `multipart/form-data`, with progress reported
/// from the outgoing stream.
///
/// Posts [`TransferTaskEvent::UploadSent`] when the request completes.
pub fn spawn_multipart_upload(
    url: String,
    path: PathBuf,
    file_name: String,
    mime_type: String,
    file_size: u64,
    request_id: String,
    events: mpsc::UnboundedSender<TransferTaskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = multipart_upload(
            &url, &path, &file_name, &mime_type, file_size, &request_id, &events,
        )
        .await;
        let event = match result {
            Ok(()) => TransferTaskEvent::UploadSent {
                request_id,
                success: true,
                error: None,
            },
            Err(e) => TransferTaskEvent::UploadSent {
                request_id,
                success: false,
                error: Some(e.to_string()),
            },
        };
        let _ = events.send(event);
    })
}

async fn multipart_upload(
    url: &str,
    path: &FsPath,
    file_name: &str,
    mime_type: &str,
    file_size: u64,
    request_id: &str,
    events: &mpsc::UnboundedSender<TransferTaskEvent>,
) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut meter = ProgressMeter::new(request_id.to_string(), events.clone());
    let stream = ReaderStream::with_capacity(file, 64 * 1024).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            meter.add(bytes.len());
            if meter.sent >= file_size {
                meter.finish();
            }
        }
        chunk
    });

    let part = reqwest::multipart::Part::stream_with_length(
        reqwest::Body::wrap_stream(stream),
        file_size,
    )
    .file_name(file_name.to_string())
    .mime_str(mime_type)
    .map_err(|e| Error::Http(format!("invalid mime type: {e}")))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("upload failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Http(format!(
            "upload rejected with status {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::checksum;
    use tempfile::TempDir;

    fn content_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn multipart_body(boundary: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn test_multipart_boundary_parsing() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=xyz123"),
            Some("xyz123".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }

    #[test]
    fn test_slicer_single_feed() {
        let content = content_bytes(10_000);
        let body = multipart_body("BOUND", &content);

        let mut slicer = MultipartSlicer::new("BOUND");
        let out = slicer.feed(&body);
        assert!(slicer.is_done());
        assert_eq!(out, content);
    }

    #[test]
    fn test_slicer_arbitrary_splits() {
        let content = content_bytes(50_000);
        let body = multipart_body("xYz-42", &content);

        for split in [1usize, 2, 5, 13, 64, 1000, 4096] {
            let mut slicer = MultipartSlicer::new("xYz-42");
            let mut out = Vec::new();
            for piece in body.chunks(split) {
                out.extend(slicer.feed(piece));
            }
            assert!(slicer.is_done(), "split {split}");
            assert_eq!(out, content, "split {split}");
        }
    }

    #[test]
    fn test_slicer_content_containing_crlf() {
        // Content with embedded CRLF pairs and dashes must pass through.
        let content = b"line one\r\n--not-the-boundary\r\nline two".to_vec();
        let body = multipart_body("realBoundary", &content);

        let mut slicer = MultipartSlicer::new("realBoundary");
        let mut out = Vec::new();
        for piece in body.chunks(3) {
            out.extend(slicer.feed(piece));
        }
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn test_download_server_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source.bin");
        let content = content_bytes(300_000);
        tokio::fs::write(&source, &content).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = serve_download(
            source,
            "source.bin".to_string(),
            content.len() as u64,
            "tok-1".to_string(),
            "req-1".to_string(),
            tx,
        )
        .await
        .unwrap();

        let url = format!("http://127.0.0.1:{}/transfer/tok-1", server.port());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .unwrap()
                .to_str()
                .unwrap(),
            "attachment; filename=\"source.bin\""
        );
        assert_eq!(
            response.content_length(),
            Some(content.len() as u64)
        );
        let body = response.bytes().await.unwrap();
        assert_eq!(&body[..], &content[..]);

        // Byte counter reported completion.
        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            if let TransferTaskEvent::Progress { bytes, .. } = event {
                last = bytes;
            }
        }
        assert_eq!(last, content.len() as u64);

        // Wrong token and wrong method are 404.
        let bad = reqwest::get(format!(
            "http://127.0.0.1:{}/transfer/other",
            server.port()
        ))
        .await
        .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::NOT_FOUND);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_upload_server_multipart_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let temp_path = tmp.path().join(".easyshare_tmp_1");
        let final_path = tmp.path().join("upload.bin");
        let content = content_bytes(200_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = serve_upload(
            UploadConfig {
                token: "tok-2".to_string(),
                request_id: "req-2".to_string(),
                expected_checksum: checksum(&content),
                temp_path: temp_path.clone(),
                final_path: final_path.clone(),
            },
            tx,
        )
        .await
        .unwrap();

        let part = reqwest::multipart::Part::bytes(content.clone())
            .file_name("upload.bin")
            .mime_str("application/octet-stream")
            .unwrap();
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/upload/tok-2", server.port()))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let saved = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(saved, content);
        assert!(!temp_path.exists());

        let done = loop {
            match rx.recv().await.unwrap() {
                TransferTaskEvent::UploadReceived { success, bytes, .. } => {
                    break (success, bytes)
                }
                _ => continue,
            }
        };
        assert_eq!(done, (true, content.len() as u64));
    }

    #[tokio::test]
    async fn test_upload_server_raw_body_size_tag() {
        let tmp = TempDir::new().unwrap();
        let temp_path = tmp.path().join(".easyshare_tmp_2");
        let final_path = tmp.path().join("raw.bin");
        let content = content_bytes(65_537);

        let (tx, _rx) = mpsc::unbounded_channel();
        let server = serve_upload(
            UploadConfig {
                token: "tok-3".to_string(),
                request_id: "req-3".to_string(),
                expected_checksum: format!("size:{}", content.len()),
                temp_path,
                final_path: final_path.clone(),
            },
            tx,
        )
        .await
        .unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/upload/tok-3", server.port()))
            .header("content-type", "application/octet-stream")
            .body(content.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_upload_server_rejects_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let temp_path = tmp.path().join(".easyshare_tmp_3");
        let final_path = tmp.path().join("never.bin");
        let content = content_bytes(1_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = serve_upload(
            UploadConfig {
                token: "tok-4".to_string(),
                request_id: "req-4".to_string(),
                expected_checksum: "size:2000".to_string(),
                temp_path: temp_path.clone(),
                final_path: final_path.clone(),
            },
            tx,
        )
        .await
        .unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/upload/tok-4", server.port()))
            .body(content)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(!final_path.exists());
        assert!(!temp_path.exists(), "temp is unlinked on failure");

        let failed = loop {
            match rx.recv().await.unwrap() {
                TransferTaskEvent::UploadReceived { success, .. } => break !success,
                _ => continue,
            }
        };
        assert!(failed);
    }

    #[tokio::test]
    async fn test_spawn_download_verifies_and_renames() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("big.bin");
        let content = content_bytes(150_000);
        tokio::fs::write(&source, &content).await.unwrap();

        let (serve_tx, _serve_rx) = mpsc::unbounded_channel();
        let server = serve_download(
            source,
            "big.bin".to_string(),
            content.len() as u64,
            "tok-5".to_string(),
            "req-5".to_string(),
            serve_tx,
        )
        .await
        .unwrap();

        let temp_path = tmp.path().join(".easyshare_tmp_dl");
        let final_path = tmp.path().join("big-received.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = spawn_download(
            format!("http://127.0.0.1:{}/transfer/tok-5", server.port()),
            temp_path.clone(),
            final_path.clone(),
            content.len() as u64,
            "req-5".to_string(),
            tx,
        );

        let finished = loop {
            match rx.recv().await.unwrap() {
                TransferTaskEvent::DownloadFinished { success, bytes, .. } => {
                    break (success, bytes)
                }
                _ => continue,
            }
        };
        assert_eq!(finished, (true, content.len() as u64));
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), content);
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_local_ip_for_loopback_peer() {
        assert_eq!(local_ip_for(Some("127.0.0.1")), "127.0.0.1");
    }
}
