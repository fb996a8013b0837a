//! Typed event surface from the core toward the host UI.
//!
//! The source callbacks (`onConnectionStateChange`, `onTransferProgress`,
//! ...) become variants of [`EasyShareEvent`] emitted on an unbounded
//! channel. The host drains the channel at its own pace; the core never
//! blocks on it.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::device::{DeviceInfo, DiscoveredDevice};
use crate::storage::TransferRecord;
use crate::transfer::TransferProgress;

/// Connection status surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No peer socket
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// Peer socket live
    Connected,
    /// Pairing exchange in progress
    Pairing,
}

/// Fine-grained pairing progress for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStep {
    /// No pairing activity
    Idle,
    /// Establishing the TCP connection
    Connecting,
    /// Initiator: emitting `pair_request`
    SendingRequest,
    /// Responder: prompting the user for a passphrase
    WaitingForPassphrase,
    /// Deriving the shared secret
    DerivingKey,
    /// Responder: emitting the challenge
    SendingChallenge,
    /// Initiator: waiting for the challenge
    WaitingForChallenge,
    /// Initiator: computing and emitting the proof
    RespondingToChallenge,
    /// Responder: verifying the proof
    VerifyingResponse,
    /// Responder: emitting `pair_confirm`
    Confirming,
    /// Pairing completed
    Success,
    /// Pairing failed
    Failed,
}

/// Connection state snapshot surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Coarse status
    pub status: ConnectionStatus,
    /// Remote device, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    /// Last error, when the status is the result of a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form progress message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Pairing progress, when pairing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_step: Option<PairingStep>,
}

impl ConnectionState {
    /// The initial, disconnected state.
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            device: None,
            error: None,
            status_message: None,
            pairing_step: None,
        }
    }
}

/// An event emitted by the core.
#[derive(Debug, Clone)]
pub enum EasyShareEvent {
    /// Connection state changed
    ConnectionState(ConnectionState),
    /// Transfer progress update; `None` clears the progress display
    TransferProgress(Option<TransferProgress>),
    /// A transfer finished and was recorded
    TransferComplete(TransferRecord),
    /// A text message arrived
    TextReceived {
        /// Decrypted message content
        content: String,
        /// Sending device
        from: DeviceInfo,
    },
    /// The remote asked to pair; the host should prompt for a passphrase
    PairingRequest(DeviceInfo),
    /// A device appeared on the network
    DeviceFound(DiscoveredDevice),
    /// A device went away (by id)
    DeviceLost(String),
}

/// Sender half of the event channel.
pub type EventSender = mpsc::UnboundedSender<EasyShareEvent>;

/// Receiver half of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<EasyShareEvent>;

/// Create the event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Emit an event, ignoring a departed receiver.
pub fn emit(tx: &EventSender, event: EasyShareEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("event receiver dropped");
    }
}
