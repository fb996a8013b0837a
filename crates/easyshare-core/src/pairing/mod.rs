//! Passphrase pairing state machine.
//!
//! Pairing proves that both users typed the same passphrase without ever
//! transmitting it. The initiator sends `pair_request`; the responder
//! derives the shared secret from the passphrase and both device ids,
//! issues a random challenge, and verifies the initiator's truncated-hash
//! proof. On success both sides hold the same 32-byte secret and persist a
//! paired-device record.
//!
//! The flow is a pure state machine: every input (an incoming `pair_*`
//! message, a user-supplied passphrase) returns a list of
//! [`PairingAction`]s for the connection manager to execute. Crossed
//! `pair_request`s resolve by each side answering the other's request with
//! the passphrase it already queued locally.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::crypto;
use crate::device::{epoch_millis, DeviceInfo};
use crate::events::PairingStep;
use crate::protocol::{Message, Payload};

/// Reason string sent when the proof does not verify.
pub const MISMATCH_REASON: &str = "Passphrase mismatch";

/// Coarse pairing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    /// No pairing in progress
    Idle,
    /// Responder: request received, waiting for the local passphrase
    Waiting,
    /// Challenge/response exchange in flight
    Verifying,
    /// Pairing completed; the secret is established
    Success,
    /// Pairing failed
    Failed,
}

/// An effect the connection manager must carry out.
#[derive(Debug)]
pub enum PairingAction {
    /// Write a message to the peer
    Send(Message),
    /// Surface a pairing-step update to the UI
    Step(PairingStep),
    /// Prompt the user for a passphrase (responder side)
    NeedPassphrase(DeviceInfo),
    /// Pairing succeeded: persist the device and enable the data plane
    Established {
        /// The remote device
        device: DeviceInfo,
        /// The derived shared secret
        secret: [u8; 32],
    },
    /// Pairing failed with the given reason
    Failed(String),
}

/// Per-connection pairing state.
///
/// Born on the first outbound or inbound `pair_request`; dies on success
/// (producing a paired device) or on failure/disconnect.
#[derive(Debug)]
pub struct PairingFlow {
    status: PairingStatus,
    local: DeviceInfo,
    remote: Option<DeviceInfo>,
    passphrase: Option<String>,
    secret: Option<[u8; 32]>,
    issued_challenge: Option<Vec<u8>>,
}

impl PairingFlow {
    /// Create a flow. `remote` is known up front on outbound connections
    /// (from discovery) and learned from `pair_request` on inbound ones.
    #[must_use]
    pub fn new(local: DeviceInfo, remote: Option<DeviceInfo>) -> Self {
        Self {
            status: PairingStatus::Idle,
            local,
            remote,
            passphrase: None,
            secret: None,
            issued_challenge: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> PairingStatus {
        self.status
    }

    /// Whether the flow has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, PairingStatus::Success | PairingStatus::Failed)
    }

    /// The established secret, once the flow succeeded.
    #[must_use]
    pub const fn secret(&self) -> Option<&[u8; 32]> {
        self.secret.as_ref()
    }

    /// The remote device, once known.
    #[must_use]
    pub const fn remote(&self) -> Option<&DeviceInfo> {
        self.remote.as_ref()
    }

    /// Begin pairing as the initiator with the user's passphrase.
    pub fn start(&mut self, passphrase: String) -> Vec<PairingAction> {
        self.passphrase = Some(passphrase);
        self.status = PairingStatus::Verifying;

        vec![
            PairingAction::Step(PairingStep::SendingRequest),
            PairingAction::Send(Message::new(Payload::PairRequest {
                device_info: self.local.clone(),
            })),
            PairingAction::Step(PairingStep::WaitingForChallenge),
        ]
    }

    /// Feed an incoming `pair_*` message into the flow.
    pub fn on_message(&mut self, message: &Message) -> Vec<PairingAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        match &message.payload {
            Payload::PairRequest { device_info } => self.on_request(device_info.clone()),
            Payload::PairChallenge { challenge, .. } => self.on_challenge(challenge),
            Payload::PairResponse {
                response,
                device_info,
            } => self.on_response(response, device_info.clone()),
            Payload::PairConfirm { device_info } => self.on_confirm(device_info.clone()),
            Payload::PairReject { reason } => self.fail(reason.clone()),
            _ => Vec::new(),
        }
    }

    /// Supply the passphrase the responder's user typed.
    pub fn provide_passphrase(&mut self, passphrase: String) -> Vec<PairingAction> {
        self.passphrase = Some(passphrase);
        if self.status == PairingStatus::Waiting && self.remote.is_some() {
            self.issue_challenge()
        } else {
            Vec::new()
        }
    }

    fn on_request(&mut self, device: DeviceInfo) -> Vec<PairingAction> {
        self.remote = Some(device.clone());

        if self.passphrase.is_some() {
            // Crossed requests, or a passphrase queued ahead of the request:
            // answer as responder with the passphrase already held.
            self.issue_challenge()
        } else {
            self.status = PairingStatus::Waiting;
            vec![
                PairingAction::Step(PairingStep::WaitingForPassphrase),
                PairingAction::NeedPassphrase(device),
            ]
        }
    }

    fn issue_challenge(&mut self) -> Vec<PairingAction> {
        let Some(remote) = self.remote.clone() else {
            return self.fail("pairing peer unknown".to_string());
        };
        let Some(passphrase) = self.passphrase.clone() else {
            return self.fail("no passphrase available".to_string());
        };

        let secret = crypto::derive_shared_secret(&passphrase, &self.local.id, &remote.id);
        self.secret = Some(secret);

        let challenge = crypto::generate_challenge();
        self.issued_challenge = Some(challenge.to_vec());
        self.status = PairingStatus::Verifying;

        tracing::debug!(peer = %remote.id, "issuing pairing challenge");

        vec![
            PairingAction::Step(PairingStep::DerivingKey),
            PairingAction::Step(PairingStep::SendingChallenge),
            PairingAction::Send(Message::new(Payload::PairChallenge {
                challenge: STANDARD.encode(challenge),
                timestamp: epoch_millis(),
            })),
        ]
    }

    fn on_challenge(&mut self, challenge_b64: &str) -> Vec<PairingAction> {
        let Some(remote) = self.remote.clone() else {
            return self.fail("challenge received before peer identity".to_string());
        };
        let Some(passphrase) = self.passphrase.clone() else {
            return self.fail("challenge received without a passphrase".to_string());
        };
        let Ok(challenge) = STANDARD.decode(challenge_b64) else {
            return self.fail("malformed challenge".to_string());
        };

        let secret = crypto::derive_shared_secret(&passphrase, &self.local.id, &remote.id);
        self.secret = Some(secret);
        self.status = PairingStatus::Verifying;

        let response = crypto::challenge_response(&challenge, &secret);

        vec![
            PairingAction::Step(PairingStep::DerivingKey),
            PairingAction::Step(PairingStep::RespondingToChallenge),
            PairingAction::Send(Message::new(Payload::PairResponse {
                response: STANDARD.encode(response),
                device_info: self.local.clone(),
            })),
        ]
    }

    fn on_response(&mut self, response_b64: &str, device: DeviceInfo) -> Vec<PairingAction> {
        self.remote = Some(device.clone());

        let (Some(secret), Some(challenge)) = (self.secret, self.issued_challenge.as_deref())
        else {
            return self.fail("response received before a challenge was issued".to_string());
        };
        let Ok(response) = STANDARD.decode(response_b64) else {
            return self.fail("malformed response".to_string());
        };

        let expected = crypto::challenge_response(challenge, &secret);
        let mut actions = vec![PairingAction::Step(PairingStep::VerifyingResponse)];

        if crypto::constant_time_eq(&response, &expected) {
            self.status = PairingStatus::Success;
            tracing::info!(peer = %device.id, "pairing verified");
            actions.push(PairingAction::Step(PairingStep::Confirming));
            actions.push(PairingAction::Send(Message::new(Payload::PairConfirm {
                device_info: self.local.clone(),
            })));
            actions.push(PairingAction::Step(PairingStep::Success));
            actions.push(PairingAction::Established { device, secret });
            actions
        } else {
            tracing::warn!(peer = %device.id, "pairing proof mismatch");
            actions.push(PairingAction::Send(Message::new(Payload::PairReject {
                reason: MISMATCH_REASON.to_string(),
            })));
            self.status = PairingStatus::Failed;
            actions.push(PairingAction::Step(PairingStep::Failed));
            actions.push(PairingAction::Failed(MISMATCH_REASON.to_string()));
            actions
        }
    }

    fn on_confirm(&mut self, device: DeviceInfo) -> Vec<PairingAction> {
        let Some(secret) = self.secret else {
            return self.fail("confirm received before key derivation".to_string());
        };
        self.remote = Some(device.clone());
        self.status = PairingStatus::Success;
        tracing::info!(peer = %device.id, "pairing confirmed");

        vec![
            PairingAction::Step(PairingStep::Success),
            PairingAction::Established { device, secret },
        ]
    }

    fn fail(&mut self, reason: String) -> Vec<PairingAction> {
        self.status = PairingStatus::Failed;
        tracing::warn!(%reason, "pairing failed");
        vec![
            PairingAction::Step(PairingStep::Failed),
            PairingAction::Failed(reason),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;

    fn device(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: name.to_string(),
            platform: Platform::Desktop,
            version: "1.0.0".to_string(),
            host: None,
            port: None,
        }
    }

    /// Deliver every Send action from `actions` into `other`, returning the
    /// actions it produced plus the leftover non-send actions.
    fn relay(actions: Vec<PairingAction>, other: &mut PairingFlow) -> Vec<PairingAction> {
        let mut produced = Vec::new();
        for action in actions {
            match action {
                PairingAction::Send(message) => produced.extend(other.on_message(&message)),
                other_action => produced.push(other_action),
            }
        }
        produced
    }

    fn established_secret(actions: &[PairingAction]) -> Option<[u8; 32]> {
        actions.iter().find_map(|a| match a {
            PairingAction::Established { secret, .. } => Some(*secret),
            _ => None,
        })
    }

    #[test]
    fn test_pairing_success_both_sides() {
        let a_info = device("device-a", "Laptop");
        let b_info = device("device-b", "Phone");

        let mut a = PairingFlow::new(a_info.clone(), Some(b_info.clone()));
        let mut b = PairingFlow::new(b_info, None);

        // A starts; B receives the request and asks its user for a passphrase.
        let to_b = a.start("7291".to_string());
        let b_actions = relay(to_b, &mut b);
        assert!(b_actions
            .iter()
            .any(|a| matches!(a, PairingAction::NeedPassphrase(d) if d.id == "device-a")));
        assert_eq!(b.status(), PairingStatus::Waiting);

        // B's user types the same passphrase; challenge flows to A, the
        // response back to B, the confirm back to A.
        let to_a = b.provide_passphrase("7291".to_string());
        let a_actions = relay(to_a, &mut a);
        let b_actions = relay(a_actions, &mut b);
        let a_actions = relay(b_actions, &mut a);

        assert_eq!(a.status(), PairingStatus::Success);
        assert_eq!(b.status(), PairingStatus::Success);

        let a_secret = established_secret(&a_actions).expect("A established");
        assert_eq!(a_secret, *a.secret().unwrap());
        assert_eq!(
            a.secret().unwrap(),
            b.secret().unwrap(),
            "both sides must hold the same secret"
        );
    }

    #[test]
    fn test_pairing_passphrase_mismatch() {
        let a_info = device("device-a", "Laptop");
        let b_info = device("device-b", "Phone");

        let mut a = PairingFlow::new(a_info, Some(b_info.clone()));
        let mut b = PairingFlow::new(b_info, None);

        let to_b = a.start("7291".to_string());
        relay(to_b, &mut b);
        let to_a = b.provide_passphrase("0000".to_string());
        let a_actions = relay(to_a, &mut a);
        // A's response reaches B, which rejects; the reject reaches A.
        let b_actions = relay(a_actions, &mut b);
        let a_actions = relay(b_actions, &mut a);

        assert_eq!(a.status(), PairingStatus::Failed);
        assert_eq!(b.status(), PairingStatus::Failed);
        assert!(a_actions
            .iter()
            .any(|act| matches!(act, PairingAction::Failed(r) if r == MISMATCH_REASON)));
        assert!(established_secret(&a_actions).is_none());
    }

    #[test]
    fn test_crossed_requests_resolve() {
        let a_info = device("device-a", "Laptop");
        let b_info = device("device-b", "Phone");

        let mut a = PairingFlow::new(a_info.clone(), Some(b_info.clone()));
        let mut b = PairingFlow::new(b_info, Some(a_info));

        // Both sides start with the same passphrase before seeing the
        // other's request.
        let a_out = a.start("5to5".to_string());
        let b_out = b.start("5to5".to_string());

        // Each request lands on a side that already holds a passphrase, so
        // each answers with a challenge, and the handshakes run to
        // completion independently.
        let b_actions = relay(a_out, &mut b);
        let a_actions = relay(b_out, &mut a);
        let a_actions2 = relay(b_actions, &mut a);
        let b_actions2 = relay(a_actions, &mut b);
        relay(a_actions2, &mut b);
        relay(b_actions2, &mut a);

        assert_eq!(a.status(), PairingStatus::Success);
        assert_eq!(b.status(), PairingStatus::Success);
        assert_eq!(a.secret().unwrap(), b.secret().unwrap());
    }

    #[test]
    fn test_reject_terminates_initiator() {
        let mut a = PairingFlow::new(
            device("device-a", "Laptop"),
            Some(device("device-b", "Phone")),
        );
        a.start("7291".to_string());

        let actions = a.on_message(&Message::new(Payload::PairReject {
            reason: MISMATCH_REASON.to_string(),
        }));
        assert_eq!(a.status(), PairingStatus::Failed);
        assert!(actions
            .iter()
            .any(|act| matches!(act, PairingAction::Failed(r) if r == MISMATCH_REASON)));
    }

    #[test]
    fn test_terminal_flow_ignores_messages() {
        let mut a = PairingFlow::new(
            device("device-a", "Laptop"),
            Some(device("device-b", "Phone")),
        );
        a.start("7291".to_string());
        a.on_message(&Message::new(Payload::PairReject {
            reason: "gone".to_string(),
        }));
        assert!(a.is_terminal());

        let actions = a.on_message(&Message::new(Payload::PairConfirm {
            device_info: device("device-b", "Phone"),
        }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_challenge_without_passphrase_fails() {
        let mut a = PairingFlow::new(
            device("device-a", "Laptop"),
            Some(device("device-b", "Phone")),
        );
        let actions = a.on_message(&Message::new(Payload::PairChallenge {
            challenge: STANDARD.encode([1u8; 32]),
            timestamp: epoch_millis(),
        }));
        assert_eq!(a.status(), PairingStatus::Failed);
        assert!(actions
            .iter()
            .any(|act| matches!(act, PairingAction::Failed(_))));
    }
}
