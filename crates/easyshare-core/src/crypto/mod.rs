//! Cryptographic primitives for EasyShare.
//!
//! This module provides:
//! - Passphrase key derivation (iterated SHA-512)
//! - Authenticated data-plane encryption (XChaCha20-Poly1305)
//! - Challenge/response proof of secret possession
//! - Truncated-SHA-512 file checksums (batch and streaming)
//! - Random identifier generation
//!
//! ## Security Model
//!
//! The shared secret never leaves the device: pairing proves possession of
//! the passphrase via a challenge/response over the derived key. The same
//! `(passphrase, idA, idB)` triple yields the same 32-byte secret on both
//! peers regardless of which side derives it first.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};
use crate::KDF_ITERATIONS;

/// Nonce length for the data-plane AEAD.
pub const NONCE_LEN: usize = 24;

/// Truncated checksum length in bytes.
pub const CHECKSUM_LEN: usize = 16;

/// Compute SHA-512 of data.
#[must_use]
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Generate cryptographically secure random bytes.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;

    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a device identifier: 16 random bytes, URL-safe base64 without
/// padding. Generated once per install and persisted.
#[must_use]
pub fn generate_device_id() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<16>())
}

/// Generate a message identifier: 8 random bytes, URL-safe base64 without
/// padding.
#[must_use]
pub fn generate_message_id() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<8>())
}

/// Derive the 32-byte shared secret from a passphrase and the two device ids.
///
/// The ids are sorted lexicographically so both peers derive from the same
/// input; the salt is the first 16 bytes of `SHA-512("idA:idB")`. The
/// passphrase is then strengthened by [`KDF_ITERATIONS`] chained SHA-512
/// rounds over `state ‖ salt`.
#[must_use]
pub fn derive_shared_secret(passphrase: &str, id_a: &str, id_b: &str) -> [u8; 32] {
    let (lo, hi) = if id_a <= id_b {
        (id_a, id_b)
    } else {
        (id_b, id_a)
    };
    let salt_digest = sha512(format!("{lo}:{hi}").as_bytes());
    let salt = &salt_digest[..16];

    let mut state = passphrase.as_bytes().to_vec();
    for _ in 0..KDF_ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(&state);
        hasher.update(salt);
        state = hasher.finalize().to_vec();
    }

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&state[..32]);
    secret
}

/// Generate a random 32-byte pairing challenge.
#[must_use]
pub fn generate_challenge() -> [u8; 32] {
    random_bytes::<32>()
}

/// Compute the challenge response: first 32 bytes of
/// `SHA-512(challenge ‖ secret)`.
#[must_use]
pub fn challenge_response(challenge: &[u8], secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha512::new();
    hasher.update(challenge);
    hasher.update(secret);
    let digest = hasher.finalize();

    let mut response = [0u8; 32];
    response.copy_from_slice(&digest[..32]);
    response
}

/// Constant-time comparison of two byte slices.
///
/// Takes the same amount of time regardless of where the first difference
/// occurs, preventing timing attacks on the pairing proof.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Encrypt data under the session secret.
///
/// Produces `[nonce_len(1)][nonce(24)][ciphertext ‖ tag(16)]` with a fresh
/// random nonce per call.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn encrypt(plaintext: &[u8], secret: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    let nonce_bytes = random_bytes::<NONCE_LEN>();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Internal("encryption failure".to_string()))?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(NONCE_LEN as u8);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `[nonce_len][nonce][ciphertext]` envelope.
///
/// # Errors
///
/// Returns [`Error::DecryptFailed`] on any malformed envelope or failed
/// authentication; no partial plaintext is ever returned.
pub fn decrypt(envelope: &[u8], secret: &[u8; 32]) -> Result<Vec<u8>> {
    if envelope.len() < 2 {
        return Err(Error::DecryptFailed);
    }
    let nonce_len = envelope[0] as usize;
    if nonce_len != NONCE_LEN || envelope.len() < 1 + nonce_len {
        return Err(Error::DecryptFailed);
    }

    let nonce = XNonce::from_slice(&envelope[1..1 + nonce_len]);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));

    cipher
        .decrypt(nonce, &envelope[1 + nonce_len..])
        .map_err(|_| Error::DecryptFailed)
}

/// Compute the file checksum: base64 of the first 16 bytes of SHA-512.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    let digest = sha512(data);
    STANDARD.encode(&digest[..CHECKSUM_LEN])
}

/// Incremental checksum over a byte stream.
///
/// Produces the same truncated digest as [`checksum`] without holding the
/// whole input in memory. Used on the streaming receive and large-file send
/// paths.
#[derive(Debug)]
pub struct StreamingChecksum {
    hasher: Sha512,
}

impl StreamingChecksum {
    /// Create a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha512::new(),
        }
    }

    /// Feed bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish and produce the base64 truncated digest.
    #[must_use]
    pub fn digest(self) -> String {
        let digest = self.hasher.finalize();
        STANDARD.encode(&digest[..CHECKSUM_LEN])
    }
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// The synthetic checksum tag used when computing a digest is prohibitive
/// (mobile large-file send): `size:<fileSize>`.
#[must_use]
pub fn size_tag(file_size: u64) -> String {
    format!("size:{file_size}")
}

/// Parse a `size:<N>` tag back into a byte count, if the checksum field
/// carries one.
#[must_use]
pub fn parse_size_tag(checksum: &str) -> Option<u64> {
    checksum.strip_prefix("size:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_shared_secret_symmetric() {
        let a = derive_shared_secret("orange-battery", "device-aaa", "device-bbb");
        let b = derive_shared_secret("orange-battery", "device-bbb", "device-aaa");
        assert_eq!(a, b, "id order must not matter");
    }

    #[test]
    fn test_derive_shared_secret_passphrase_sensitivity() {
        let a = derive_shared_secret("orange-battery", "device-aaa", "device-bbb");
        let b = derive_shared_secret("orange-batterz", "device-aaa", "device-bbb");
        assert_ne!(a, b);

        let c = derive_shared_secret("orange-battery", "device-aaa", "device-ccc");
        assert_ne!(a, c, "different peer pair must derive a different secret");
    }

    #[test]
    fn test_derive_shared_secret_deterministic() {
        let a = derive_shared_secret("pw", "x", "y");
        let b = derive_shared_secret("pw", "x", "y");
        assert_eq!(a, b);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secret = random_bytes::<32>();
        let plaintext = b"hello over the wire";

        let envelope = encrypt(plaintext, &secret).expect("encrypt");
        assert_eq!(envelope[0] as usize, NONCE_LEN);
        assert_eq!(envelope.len(), 1 + NONCE_LEN + plaintext.len() + 16);

        let decrypted = decrypt(&envelope, &secret).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let secret = random_bytes::<32>();
        let other = random_bytes::<32>();
        let envelope = encrypt(b"secret payload", &secret).expect("encrypt");

        assert!(matches!(
            decrypt(&envelope, &other),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_decrypt_rejects_malformed_envelopes() {
        let secret = random_bytes::<32>();
        assert!(decrypt(&[], &secret).is_err());
        assert!(decrypt(&[24], &secret).is_err());
        assert!(decrypt(&[12, 0, 0, 0], &secret).is_err());
    }

    #[test]
    fn test_nonce_fresh_per_call() {
        let secret = random_bytes::<32>();
        let a = encrypt(b"same input", &secret).expect("encrypt");
        let b = encrypt(b"same input", &secret).expect("encrypt");
        assert_ne!(a, b, "nonce must be fresh per call");
    }

    #[test]
    fn test_challenge_response_verifies() {
        let secret = random_bytes::<32>();
        let challenge = generate_challenge();

        let response = challenge_response(&challenge, &secret);
        let expected = challenge_response(&challenge, &secret);
        assert!(constant_time_eq(&response, &expected));

        let wrong = challenge_response(&challenge, &random_bytes::<32>());
        assert!(!constant_time_eq(&response, &wrong));
    }

    #[test]
    fn test_checksum_batch_and_streaming_agree() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let batch = checksum(&data);

        let mut streaming = StreamingChecksum::new();
        for piece in data.chunks(7919) {
            streaming.update(piece);
        }
        assert_eq!(streaming.digest(), batch);
    }

    #[test]
    fn test_checksum_is_16_bytes_base64() {
        let sum = checksum(b"abc");
        let raw = STANDARD.decode(&sum).expect("valid base64");
        assert_eq!(raw.len(), CHECKSUM_LEN);
    }

    #[test]
    fn test_size_tag_roundtrip() {
        assert_eq!(size_tag(10_485_760), "size:10485760");
        assert_eq!(parse_size_tag("size:10485760"), Some(10_485_760));
        assert_eq!(parse_size_tag("u3+qbEXW0K4="), None);
        assert_eq!(parse_size_tag("size:abc"), None);
    }

    #[test]
    fn test_device_and_message_ids() {
        let device = generate_device_id();
        let message = generate_message_id();

        assert_eq!(URL_SAFE_NO_PAD.decode(&device).expect("base64").len(), 16);
        assert_eq!(URL_SAFE_NO_PAD.decode(&message).expect("base64").len(), 8);
        assert!(!device.contains('='), "padding must be stripped");
        assert_ne!(generate_device_id(), device);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abcd", b"abc"));
    }
}
