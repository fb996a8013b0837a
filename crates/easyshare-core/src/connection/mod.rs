//! Connection manager: socket ownership, dispatch, keepalive.
//!
//! Each manager owns at most one peer TCP socket. A single dispatch task
//! drives everything: frames from the socket, commands from the host,
//! completion reports from HTTP helper tasks, and the 5-second keepalive
//! tick. No other task touches the manager's mutable state; the reader
//! task only forwards raw bytes, and each adopted socket gets a generation
//! number so a displaced reader's leftovers are discarded.
//!
//! An inbound connection displaces the current socket only when that
//! socket is dead or has produced no frame for 30 seconds; otherwise the
//! newcomer is refused. The application keepalive sends `ping` every 5
//! seconds and tears the connection down after 120 seconds of inbound
//! silence, suppressed while a transfer is active and, on mobile, while
//! the app is backgrounded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::device::{epoch_millis, DeviceInfo, PairedDevice, Platform};
use crate::error::{Error, Result};
use crate::events::{
    self, ConnectionState, ConnectionStatus, EasyShareEvent, EventReceiver, EventSender,
    PairingStep,
};
use crate::pairing::{PairingAction, PairingFlow};
use crate::protocol::{FrameWriter, Message, MessageBuffer, Payload};
use crate::storage::{self, Storage};
use crate::transfer::{AcceptPolicy, TransferEngine, TransferTaskEvent};
use crate::{
    CONNECT_ATTEMPTS, CONNECT_TIMEOUT_SECS, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_TIMEOUT_MS,
    PAIRING_TIMEOUT_MS, STALE_SOCKET_MS,
};

/// Configure OS-level TCP keepalive on a peer socket.
///
/// Probing starts after 10 seconds of idle time with 5-second intervals,
/// so half-open connections die well before the application timeout.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Whether the idle timeout should tear the connection down.
///
/// The timeout is suppressed while a transfer is active and, on mobile,
/// while the app is backgrounded.
const fn should_disconnect(idle_ms: u64, transfer_active: bool, backgrounded_mobile: bool) -> bool {
    !transfer_active && !backgrounded_mobile && idle_ms > KEEPALIVE_TIMEOUT_MS
}

/// Host-issued commands.
enum Command {
    Connect {
        device: DeviceInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        user_initiated: bool,
    },
    StartPairing {
        passphrase: String,
    },
    ProvidePassphrase {
        passphrase: String,
    },
    SendText {
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    SetBackgrounded(bool),
    Shutdown,
}

/// Events fed back into the dispatch task by helper tasks.
enum InternalEvent {
    /// The listener accepted a connection
    Inbound(TcpStream, std::net::SocketAddr),
    /// Bytes read from the peer socket
    SocketBytes { generation: u64, bytes: Vec<u8> },
    /// The peer socket closed or errored
    SocketClosed {
        generation: u64,
        error: Option<String>,
    },
    /// The post-foreground reconnect delay elapsed
    Reconnect,
}

/// Cloneable handle for driving a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    /// Connect to a discovered or paired device.
    ///
    /// # Errors
    ///
    /// Returns an error if all connect attempts fail or the manager is
    /// gone.
    pub async fn connect(&self, device: DeviceInfo) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { device, reply })
            .await
            .map_err(|_| Error::Internal("connection manager stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("connection manager stopped".to_string()))?
    }

    /// Disconnect the active peer. A user-initiated disconnect also clears
    /// the auto-reconnect target.
    pub async fn disconnect(&self) {
        let _ = self
            .cmd_tx
            .send(Command::Disconnect {
                user_initiated: true,
            })
            .await;
    }

    /// Begin pairing as the initiator with the user's passphrase.
    pub async fn start_pairing(&self, passphrase: String) {
        let _ = self.cmd_tx.send(Command::StartPairing { passphrase }).await;
    }

    /// Supply the passphrase after a [`EasyShareEvent::PairingRequest`].
    pub async fn provide_passphrase(&self, passphrase: String) {
        let _ = self
            .cmd_tx
            .send(Command::ProvidePassphrase { passphrase })
            .await;
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if no peer is connected.
    pub async fn send_text(&self, content: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendText { content, reply })
            .await
            .map_err(|_| Error::Internal("connection manager stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("connection manager stopped".to_string()))?
    }

    /// Send a file; resolves `true` only on verified completion.
    pub async fn send_file(&self, path: PathBuf) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SendFile { path, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Report the host app moving to or from the background (mobile).
    pub async fn set_backgrounded(&self, backgrounded: bool) {
        let _ = self.cmd_tx.send(Command::SetBackgrounded(backgrounded)).await;
    }

    /// Stop the manager.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

/// State for the one live peer socket.
struct PeerConn {
    wire: FrameWriter<OwnedWriteHalf>,
    peer_addr: std::net::SocketAddr,
    device: Option<DeviceInfo>,
    buffer: MessageBuffer,
    last_inbound: Instant,
    generation: u64,
    reader: tokio::task::JoinHandle<()>,
}

/// The connection manager.
///
/// Construct with [`ConnectionManager::new`], optionally bind the inbound
/// listener with [`ConnectionManager::start_server`], then spawn
/// [`ConnectionManager::run`].
pub struct ConnectionManager {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    cmd_rx: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    task_rx: mpsc::UnboundedReceiver<TransferTaskEvent>,
    engine: TransferEngine,
    conn: Option<PeerConn>,
    pairing: Option<PairingFlow>,
    pairing_deadline: Option<Instant>,
    backgrounded: bool,
    last_device: Option<DeviceInfo>,
    generation: u64,
}

impl ConnectionManager {
    /// Create a manager plus its command handle and event stream.
    #[must_use]
    pub fn new(
        local: DeviceInfo,
        storage: Arc<dyn Storage>,
        policy: AcceptPolicy,
    ) -> (Self, ConnectionHandle, EventReceiver) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = events::channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let engine = TransferEngine::new(
            local.clone(),
            storage.clone(),
            event_tx.clone(),
            task_tx,
            policy,
        );

        let manager = Self {
            local,
            storage,
            events: event_tx,
            cmd_rx,
            internal_tx,
            internal_rx,
            task_rx,
            engine,
            conn: None,
            pairing: None,
            pairing_deadline: None,
            backgrounded: false,
            last_device: None,
            generation: 0,
        };
        (manager, ConnectionHandle { cmd_tx }, event_rx)
    }

    /// Bind the inbound TCP listener on an ephemeral port and start
    /// accepting. Returns the port for the discovery advertisement.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_server(&mut self) -> Result<u16> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        self.local.port = Some(port);

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if internal_tx
                            .send(InternalEvent::Inbound(stream, addr))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                    }
                }
            }
        });

        tracing::info!(port, "listening for peers");
        Ok(port)
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(mut self) {
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        keepalive.tick().await;

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.on_command(command).await {
                                break;
                            }
                        }
                        None => {
                            self.teardown(true, None).await;
                            break;
                        }
                    }
                }
                Some(event) = self.internal_rx.recv() => {
                    self.on_internal(event).await;
                }
                Some(event) = self.task_rx.recv() => {
                    self.on_task_event(event).await;
                }
                _ = keepalive.tick() => {
                    self.on_keepalive().await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { device, reply } => {
                let result = self.connect_to(device).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { user_initiated } => {
                self.teardown(user_initiated, None).await;
            }
            Command::StartPairing { passphrase } => {
                if self.conn.is_none() {
                    self.emit_state(
                        ConnectionStatus::Disconnected,
                        None,
                        Some("not connected".to_string()),
                        None,
                    );
                    return true;
                }
                let remote = self.conn.as_ref().and_then(|c| c.device.clone());
                let flow = self
                    .pairing
                    .get_or_insert_with(|| PairingFlow::new(self.local.clone(), remote));
                let actions = flow.start(passphrase);
                self.pairing_deadline =
                    Some(Instant::now() + Duration::from_millis(PAIRING_TIMEOUT_MS));
                self.apply_pairing_actions(actions).await;
            }
            Command::ProvidePassphrase { passphrase } => {
                let remote = self.conn.as_ref().and_then(|c| c.device.clone());
                let flow = self
                    .pairing
                    .get_or_insert_with(|| PairingFlow::new(self.local.clone(), remote));
                let actions = flow.provide_passphrase(passphrase);
                self.pairing_deadline =
                    Some(Instant::now() + Duration::from_millis(PAIRING_TIMEOUT_MS));
                self.apply_pairing_actions(actions).await;
            }
            Command::SendText { content, reply } => {
                let result = match self.conn.as_mut() {
                    Some(conn) => self.engine.send_text(&content, &mut conn.wire).await,
                    None => Err(Error::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::SendFile { path, reply } => {
                match self.conn.as_mut() {
                    Some(conn) => {
                        if let Err(e) = self.engine.send_file(path, reply, &mut conn.wire).await {
                            tracing::warn!("send_file failed to start: {e}");
                        }
                    }
                    None => {
                        let _ = reply.send(false);
                    }
                }
            }
            Command::SetBackgrounded(backgrounded) => {
                self.on_backgrounded(backgrounded);
            }
            Command::Shutdown => {
                self.teardown(true, None).await;
                return false;
            }
        }
        true
    }

    fn on_backgrounded(&mut self, backgrounded: bool) {
        self.backgrounded = backgrounded;
        if backgrounded {
            return;
        }
        // Foreground transition: pretend the peer just spoke so the
        // keepalive does not fire spuriously, and if the socket died in
        // the background, try a single reconnect shortly.
        if let Some(conn) = self.conn.as_mut() {
            conn.last_inbound = Instant::now();
        } else if self.last_device.is_some() {
            let internal_tx = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = internal_tx.send(InternalEvent::Reconnect);
            });
        }
    }

    async fn on_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Inbound(stream, addr) => {
                self.on_inbound(stream, addr).await;
            }
            InternalEvent::SocketBytes { generation, bytes } => {
                self.on_socket_bytes(generation, &bytes).await;
            }
            InternalEvent::SocketClosed { generation, error } => {
                if self.conn.as_ref().map(|c| c.generation) == Some(generation) {
                    self.teardown(false, error).await;
                }
            }
            InternalEvent::Reconnect => {
                if self.conn.is_none() {
                    if let Some(device) = self.last_device.clone() {
                        tracing::info!(peer = %device.id, "attempting auto-reconnect");
                        let _ = self.connect_to(device).await;
                    }
                }
            }
        }
    }

    async fn on_inbound(&mut self, stream: TcpStream, addr: std::net::SocketAddr) {
        let displace = match self.conn.as_ref() {
            None => true,
            Some(conn) => {
                conn.wire.is_broken()
                    || u64::try_from(conn.last_inbound.elapsed().as_millis()).unwrap_or(u64::MAX)
                        > STALE_SOCKET_MS
            }
        };
        if !displace {
            tracing::info!(%addr, "refusing extra inbound connection");
            drop(stream);
            return;
        }
        if self.conn.is_some() {
            tracing::info!(%addr, "displacing stale peer socket");
            self.teardown(false, Some("displaced by new connection".to_string()))
                .await;
        }
        self.adopt(stream, addr, None).await;
    }

    async fn connect_to(&mut self, device: DeviceInfo) -> Result<()> {
        let (Some(host), Some(port)) = (device.host.clone(), device.port) else {
            return Err(Error::ConnectFailed {
                addr: device.id.clone(),
                attempts: 0,
                reason: "device has no address".to_string(),
            });
        };
        if self.conn.is_some() {
            self.teardown(false, Some("replaced by new connection".to_string()))
                .await;
        }

        let addr = format!("{host}:{port}");
        self.emit_state(
            ConnectionStatus::Connecting,
            Some(device.clone()),
            None,
            Some(PairingStep::Connecting),
        );

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(
                Duration::from_secs(CONNECT_TIMEOUT_SECS),
                TcpStream::connect(&addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    let peer_addr = stream
                        .peer_addr()
                        .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
                    self.adopt(stream, peer_addr, Some(device)).await;
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {CONNECT_TIMEOUT_SECS}s"),
            }
            tracing::debug!(%addr, attempt, %last_error, "connect attempt failed");
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }

        let error = Error::ConnectFailed {
            addr,
            attempts: CONNECT_ATTEMPTS,
            reason: last_error,
        };
        self.emit_state(
            ConnectionStatus::Disconnected,
            None,
            Some(error.to_string()),
            None,
        );
        Err(error)
    }

    async fn adopt(
        &mut self,
        stream: TcpStream,
        peer_addr: std::net::SocketAddr,
        device: Option<DeviceInfo>,
    ) {
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::warn!("failed to enable TCP keepalive: {e}");
        }

        self.generation += 1;
        let generation = self.generation;
        let (read_half, write_half) = stream.into_split();
        let reader = spawn_reader(generation, read_half, self.internal_tx.clone());

        self.conn = Some(PeerConn {
            wire: FrameWriter::new(write_half),
            peer_addr,
            device: device.clone(),
            buffer: MessageBuffer::new(),
            last_inbound: Instant::now(),
            generation,
            reader,
        });

        self.engine.set_remote(device.clone());
        self.engine.set_secret(None);
        if let Some(device) = &device {
            // A previously paired peer gets its data plane back without
            // re-pairing.
            match storage::find_paired(self.storage.as_ref(), &device.id) {
                Ok(Some(paired)) => match paired.secret() {
                    Ok(secret) => self.engine.set_secret(Some(secret)),
                    Err(e) => tracing::warn!("stored secret unusable: {e}"),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!("paired device lookup failed: {e}"),
            }
            let _ = self
                .storage
                .update_paired_device_last_connected(&device.id, epoch_millis());
            self.last_device = Some(device.clone());
        }

        tracing::info!(%peer_addr, "peer connected");
        self.emit_state(ConnectionStatus::Connected, device, None, None);
    }

    async fn on_socket_bytes(&mut self, generation: u64, bytes: &[u8]) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.generation != generation {
            return;
        }
        // Any inbound frame counts as liveness, not just pong.
        conn.last_inbound = Instant::now();
        conn.buffer.append(bytes);

        let messages = match conn.buffer.drain() {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(peer = %conn.peer_addr, "protocol error: {e}");
                conn.wire
                    .send(&Message::new(Payload::Error {
                        code: e.kind().to_string(),
                        message: e.to_string(),
                        original_message_id: None,
                    }))
                    .await;
                self.teardown(false, Some(e.to_string())).await;
                return;
            }
        };

        for message in messages {
            if self.conn.as_ref().map(|c| c.generation) != Some(generation) {
                break;
            }
            self.dispatch(message).await;
        }
    }

    async fn dispatch(&mut self, message: Message) {
        match &message.payload {
            Payload::Ping => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.wire.send(&Message::pong(message.id.clone())).await;
                }
            }
            Payload::Pong => {}
            Payload::PairRequest { .. }
            | Payload::PairChallenge { .. }
            | Payload::PairResponse { .. }
            | Payload::PairConfirm { .. }
            | Payload::PairReject { .. } => {
                self.on_pairing_message(&message).await;
            }
            Payload::Error { code, message, .. } => {
                tracing::warn!(%code, %message, "peer reported an error");
            }
            Payload::Unknown => {
                tracing::debug!("ignoring unknown message type");
            }
            _ => {
                let result = match self.conn.as_mut() {
                    Some(conn) => self.engine.handle_message(&message, &mut conn.wire).await,
                    None => return,
                };
                if let Err(e) = result {
                    if e.is_fatal_to_connection() {
                        self.teardown(false, Some(e.to_string())).await;
                    } else {
                        tracing::warn!("transfer handler failed: {e}");
                    }
                }
            }
        }
    }

    async fn on_pairing_message(&mut self, message: &Message) {
        if self.pairing.is_none() {
            if matches!(message.payload, Payload::PairRequest { .. }) {
                let remote = self.conn.as_ref().and_then(|c| c.device.clone());
                self.pairing = Some(PairingFlow::new(self.local.clone(), remote));
            } else {
                tracing::debug!(
                    kind = message.payload.name(),
                    "pairing message without an active flow"
                );
                return;
            }
        }

        let actions = self
            .pairing
            .as_mut()
            .map(|flow| flow.on_message(message))
            .unwrap_or_default();
        self.pairing_deadline = Some(Instant::now() + Duration::from_millis(PAIRING_TIMEOUT_MS));
        self.apply_pairing_actions(actions).await;
    }

    async fn apply_pairing_actions(&mut self, actions: Vec<PairingAction>) {
        for action in actions {
            match action {
                PairingAction::Send(message) => {
                    if let Some(conn) = self.conn.as_mut() {
                        conn.wire.send(&message).await;
                    }
                }
                PairingAction::Step(step) => {
                    self.emit_pairing_step(step, None);
                }
                PairingAction::NeedPassphrase(device) => {
                    let device = self.with_socket_host(device);
                    if let Some(conn) = self.conn.as_mut() {
                        conn.device = Some(device.clone());
                    }
                    self.engine.set_remote(Some(device.clone()));
                    events::emit(&self.events, EasyShareEvent::PairingRequest(device));
                }
                PairingAction::Established { device, secret } => {
                    let device = self.with_socket_host(device);
                    let paired = PairedDevice::new(device.clone(), &secret);
                    if let Err(e) = self.storage.add_paired_device(paired) {
                        tracing::warn!("failed to persist paired device: {e}");
                    }
                    let _ = self
                        .storage
                        .update_paired_device_last_connected(&device.id, epoch_millis());
                    if let Some(conn) = self.conn.as_mut() {
                        conn.device = Some(device.clone());
                    }
                    self.last_device = Some(device.clone());
                    self.engine.set_remote(Some(device));
                    self.engine.set_secret(Some(secret));
                }
                PairingAction::Failed(reason) => {
                    self.emit_pairing_step(PairingStep::Failed, Some(reason));
                }
            }
        }

        if self.pairing.as_ref().is_some_and(PairingFlow::is_terminal) {
            self.pairing = None;
            self.pairing_deadline = None;
        }
    }

    async fn on_task_event(&mut self, event: TransferTaskEvent) {
        let result = match self.conn.as_mut() {
            Some(conn) => self.engine.handle_task_event(event, &mut conn.wire).await,
            None => return,
        };
        if let Err(e) = result {
            tracing::warn!("task event handling failed: {e}");
        }
    }

    async fn on_keepalive(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.wire.send(&Message::new(Payload::Ping)).await;
        }

        let broken = self.conn.as_ref().is_some_and(|c| c.wire.is_broken());
        if broken {
            self.teardown(false, Some("broken pipe".to_string())).await;
            return;
        }

        // A pairing exchange that has gone silent is terminal.
        if self.pairing.is_some()
            && self
                .pairing_deadline
                .is_some_and(|deadline| Instant::now() > deadline)
        {
            tracing::warn!("pairing timed out");
            self.pairing = None;
            self.pairing_deadline = None;
            self.emit_pairing_step(PairingStep::Failed, Some("pairing timed out".to_string()));
        }

        let idle_ms = self
            .conn
            .as_ref()
            .map_or(0, |c| {
                u64::try_from(c.last_inbound.elapsed().as_millis()).unwrap_or(u64::MAX)
            });
        let backgrounded_mobile = self.local.platform == Platform::Mobile && self.backgrounded;
        if should_disconnect(idle_ms, self.engine.is_active(), backgrounded_mobile) {
            tracing::warn!(idle_ms, "keepalive timeout, disconnecting");
            self.teardown(false, Some("keepalive timeout".to_string()))
                .await;
        }
    }

    /// Tear down the peer connection. Idempotent: a second call with no
    /// live socket and no pairing state is a no-op.
    async fn teardown(&mut self, user_initiated: bool, error: Option<String>) {
        let had_conn = self.conn.is_some();
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            tracing::info!(peer = %conn.peer_addr, "disconnected");
        }
        let had_pairing = self.pairing.take().is_some();
        self.pairing_deadline = None;

        if !had_conn && !had_pairing && !self.engine.is_active() {
            if user_initiated {
                self.last_device = None;
            }
            return;
        }

        self.engine.on_disconnect().await;
        self.engine.set_remote(None);
        self.engine.set_secret(None);

        if user_initiated {
            self.last_device = None;
        }
        self.emit_state(ConnectionStatus::Disconnected, None, error, None);
    }

    /// Pairing messages carry no address; borrow the live socket's peer
    /// address so later HTTP URLs pick the right interface.
    fn with_socket_host(&self, mut device: DeviceInfo) -> DeviceInfo {
        if device.host.is_none() {
            device.host = self.conn.as_ref().map(|c| c.peer_addr.ip().to_string());
        }
        device
    }

    fn emit_state(
        &self,
        status: ConnectionStatus,
        device: Option<DeviceInfo>,
        error: Option<String>,
        pairing_step: Option<PairingStep>,
    ) {
        events::emit(
            &self.events,
            EasyShareEvent::ConnectionState(ConnectionState {
                status,
                device: device.or_else(|| self.conn.as_ref().and_then(|c| c.device.clone())),
                error,
                status_message: None,
                pairing_step,
            }),
        );
    }

    fn emit_pairing_step(&self, step: PairingStep, error: Option<String>) {
        let status = match step {
            PairingStep::Success | PairingStep::Failed => ConnectionStatus::Connected,
            _ => ConnectionStatus::Pairing,
        };
        self.emit_state(status, None, error, Some(step));
    }
}

fn spawn_reader(
    generation: u64,
    mut read_half: OwnedReadHalf,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = internal_tx.send(InternalEvent::SocketClosed {
                        generation,
                        error: None,
                    });
                    break;
                }
                Ok(n) => {
                    if internal_tx
                        .send(InternalEvent::SocketBytes {
                            generation,
                            bytes: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = internal_tx.send(InternalEvent::SocketClosed {
                        generation,
                        error: Some(e.to_string()),
                    });
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_predicate_boundaries() {
        // 119 s idle survives, 121 s does not.
        assert!(!should_disconnect(119_000, false, false));
        assert!(should_disconnect(121_000, false, false));
        // Exactly at the limit survives (strictly greater tears down).
        assert!(!should_disconnect(KEEPALIVE_TIMEOUT_MS, false, false));
    }

    #[test]
    fn test_keepalive_suppressed_during_transfer() {
        assert!(!should_disconnect(10_000_000, true, false));
    }

    #[test]
    fn test_keepalive_suppressed_while_backgrounded() {
        assert!(!should_disconnect(10_000_000, false, true));
    }
}
