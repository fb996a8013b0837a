//! Error types for EasyShare.
//!
//! This module provides a unified error type for all EasyShare operations.
//! Every failure is classified into one of the protocol's error kinds,
//! which determines how the connection manager reacts to it (tear down the
//! socket, fail only the current operation, or surface and continue).

use std::io;

use thiserror::Error;

/// A specialized `Result` type for EasyShare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, driving the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect refused, reset, timeout. Surfaced in the connection state;
    /// the caller may retry the connect.
    Network,
    /// Oversized frame, malformed JSON, unexpected message mid-flow.
    /// Tears down the socket.
    Protocol,
    /// Passphrase mismatch or challenge verification failure. Pairing ends
    /// `failed`; the socket survives but the data plane stays disabled.
    Auth,
    /// Checksum or size mismatch on receive. Received bytes are discarded.
    Integrity,
    /// File open/read/write failure. Aborts the offending transfer only.
    Io,
    /// Transfer refused by local policy.
    Policy,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Auth => "auth",
            Self::Integrity => "integrity",
            Self::Io => "io",
            Self::Policy => "policy",
        };
        write!(f, "{s}")
    }
}

/// The main error type for EasyShare.
#[derive(Error, Debug)]
pub enum Error {
    /// TCP connect failed after all retries
    #[error("failed to connect to {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        /// Target address
        addr: String,
        /// Number of attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Connection lost while an operation was in flight
    #[error("connection lost")]
    ConnectionLost,

    /// No peer connection is active
    #[error("not connected to a peer")]
    NotConnected,

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Frame exceeds the protocol payload limit
    #[error("frame payload of {0} bytes exceeds the 10 MiB limit")]
    FrameTooLarge(usize),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unexpected message type mid-flow
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Pairing failed
    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// Remote passphrase proof did not verify
    #[error("passphrase mismatch")]
    PassphraseMismatch,

    /// Data-plane decryption failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Full-file checksum mismatch on receive
    #[error("checksum mismatch for '{file}'")]
    ChecksumMismatch {
        /// The file being received
        file: String,
    },

    /// Received byte count differs from the announced size
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Announced size
        expected: u64,
        /// Received byte count
        actual: u64,
    },

    /// Incoming transfer refused by policy
    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistent store error
    #[error("storage error: {0}")]
    Storage(String),

    /// mDNS discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Auxiliary HTTP transfer error
    #[error("HTTP transfer error: {0}")]
    Http(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into the protocol's recovery taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectFailed { .. }
            | Self::ConnectionLost
            | Self::NotConnected
            | Self::Timeout(_) => ErrorKind::Network,
            Self::FrameTooLarge(_)
            | Self::ProtocolError(_)
            | Self::UnexpectedMessage { .. }
            | Self::Serialization(_) => ErrorKind::Protocol,
            Self::PairingFailed(_) | Self::PassphraseMismatch | Self::DecryptFailed => {
                ErrorKind::Auth
            }
            Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. } => ErrorKind::Integrity,
            Self::TransferRejected(_) => ErrorKind::Policy,
            Self::Io(_)
            | Self::Storage(_)
            | Self::Discovery(_)
            | Self::Http(_)
            | Self::Internal(_) => ErrorKind::Io,
        }
    }

    /// Whether the failed operation may be retried by the caller.
    ///
    /// Only TCP connect is retryable; everything else is terminal for its
    /// operation and the user initiates any retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::Timeout(_))
    }

    /// Whether this error must tear down the peer socket.
    #[must_use]
    pub const fn is_fatal_to_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::ConnectionLost.kind(), ErrorKind::Network);
        assert_eq!(Error::FrameTooLarge(11 << 20).kind(), ErrorKind::Protocol);
        assert_eq!(Error::PassphraseMismatch.kind(), ErrorKind::Auth);
        assert_eq!(
            Error::ChecksumMismatch {
                file: "a.bin".to_string()
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            Error::TransferRejected("declined".to_string()).kind(),
            ErrorKind::Policy
        );
        assert_eq!(
            Error::Io(io::Error::other("disk full")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_only_protocol_errors_are_fatal() {
        assert!(Error::ProtocolError("bad json".to_string()).is_fatal_to_connection());
        assert!(Error::FrameTooLarge(usize::MAX).is_fatal_to_connection());
        assert!(!Error::PassphraseMismatch.is_fatal_to_connection());
        assert!(!Error::SizeMismatch {
            expected: 10,
            actual: 9
        }
        .is_fatal_to_connection());
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::ConnectFailed {
            addr: "10.0.0.2:4000".to_string(),
            attempts: 3,
            reason: "refused".to_string()
        }
        .is_recoverable());
        assert!(!Error::ConnectionLost.is_recoverable());
        assert!(!Error::PassphraseMismatch.is_recoverable());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Network.to_string(), "network");
        assert_eq!(ErrorKind::Integrity.to_string(), "integrity");
    }
}
