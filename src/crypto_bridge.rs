//! `CryptoBridge`: the external collaborator the core consumes for all
//! end-to-end encryption.
//!
//! The actual Olm/Signal double-ratchet math, the post-quantum KEM, and
//! any WASM/FFI bindings to a crypto library are explicitly out of scope
//! for this crate — a host supplies an `Arc<dyn CryptoBridge>` backed by
//! whatever implementation it likes. What lives here is the *shape* of
//! that collaborator (grounded in the wire formats a concrete
//! implementation would have to honor) plus the one piece of pure data
//! plumbing the core can't delegate: parsing the fixed-layout pairing
//! bundle bytes into a struct before handing them to
//! `CryptoBridge::create_session`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::HubId;

/// Binary inner content type: JSON control message.
pub const CONTENT_MSG: u8 = 0x00;
/// Binary inner content type: PTY I/O.
pub const CONTENT_PTY: u8 = 0x01;
/// Binary inner content type: TCP stream multiplexer frame.
pub const CONTENT_STREAM: u8 = 0x02;
/// Binary inner content type: file transfer, sent atomically.
pub const CONTENT_FILE: u8 = 0x03;
/// Binary inner content type: file transfer chunk.
pub const CONTENT_FILE_CHUNK: u8 = 0x04;

/// Olm message type: PreKey (session establishment).
pub const MSG_TYPE_PREKEY: u8 = 0x00;
/// Olm message type: Normal (established session).
pub const MSG_TYPE_NORMAL: u8 = 0x01;
/// Cleartext bundle refresh (ratchet restart), rides at the same wire
/// position as the Olm message type byte.
pub const MSG_TYPE_BUNDLE_REFRESH: u8 = 0x02;

/// Encrypted message envelope for signaling (ActionCable/JSON transport).
///
/// Uses short keys to minimize wire size:
/// - `t`: message type (`MSG_TYPE_PREKEY` or `MSG_TYPE_NORMAL`)
/// - `b`: ciphertext, base64 unpadded
/// - `k`: sender's Curve25519 identity key, base64 unpadded; present only
///   on PreKey messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlmEnvelope {
    /// Message type: 0 = PreKey, 1 = Normal.
    #[serde(rename = "t")]
    pub message_type: u8,
    /// Base64-unpadded ciphertext.
    #[serde(rename = "b")]
    pub ciphertext: String,
    /// Sender's Curve25519 identity key (base64 unpadded), PreKey only.
    #[serde(rename = "k", skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
}

/// The external end-to-end encryption collaborator.
///
/// Implementations own all ratchet state; the core never inspects it.
/// Every method is keyed by `HubId` because a single browser session may
/// hold concurrent sessions with multiple hubs.
#[async_trait]
pub trait CryptoBridge: Send + Sync {
    /// Decrypt a signaling-channel envelope into plaintext JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SessionMissing` or
    /// `TransportError::RatchetDesynchronized` when the ratchet state
    /// can't process the envelope; `Corrupt` ciphertext should also map to
    /// one of those (the core treats both as "needs a bundle refresh").
    async fn decrypt(&self, hub_id: &HubId, envelope: &OlmEnvelope) -> Result<Vec<u8>, TransportError>;

    /// Decrypt a DataChannel frame. `bytes` begins with the frame-type
    /// byte (`MSG_TYPE_PREKEY` / `MSG_TYPE_NORMAL`).
    async fn decrypt_binary(&self, hub_id: &HubId, bytes: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Encrypt `json` for transmission inside a signaling message.
    async fn encrypt(&self, hub_id: &HubId, json: &[u8]) -> Result<OlmEnvelope, TransportError>;

    /// Encrypt `bytes` into a binary Olm frame ready for the DataChannel.
    async fn encrypt_binary(&self, hub_id: &HubId, bytes: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Install (or reset) a session for `hub_id` from a parsed pairing bundle.
    async fn create_session(&self, hub_id: &HubId, bundle: &PairingBundle) -> Result<(), TransportError>;
}

/// Byte offsets and sizes for the 1,813-byte pairing bundle layout.
pub mod binary_format {
    /// Total bundle size in bytes.
    pub const BUNDLE_SIZE: usize = 1813;

    pub(super) const VERSION: usize = 0;
    pub(super) const REGISTRATION_ID: usize = 1;
    pub(super) const IDENTITY_KEY: usize = 5;
    pub(super) const SIGNED_PREKEY_ID: usize = 38;
    pub(super) const SIGNED_PREKEY: usize = 42;
    pub(super) const SIGNED_PREKEY_SIGNATURE: usize = 75;
    pub(super) const PREKEY_ID: usize = 139;
    pub(super) const PREKEY: usize = 143;
    pub(super) const KYBER_PREKEY_ID: usize = 176;
    pub(super) const KYBER_PREKEY: usize = 180;
    pub(super) const KYBER_PREKEY_SIGNATURE: usize = 1749;

    pub(super) const IDENTITY_KEY_LEN: usize = 33;
    pub(super) const SIGNED_PREKEY_LEN: usize = 33;
    pub(super) const SIGNED_PREKEY_SIGNATURE_LEN: usize = 64;
    pub(super) const PREKEY_LEN: usize = 33;
    pub(super) const KYBER_PREKEY_LEN: usize = 1569;
    pub(super) const KYBER_PREKEY_SIGNATURE_LEN: usize = 64;
}

/// A parsed pairing bundle: long-term identity, signed pre-keys, and
/// post-quantum KEM keys used to bootstrap an end-to-end session.
///
/// Parsing here is pure data-layout decoding — no cryptographic
/// validation is performed; that is `CryptoBridge::create_session`'s job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingBundle {
    /// Bundle format version.
    pub version: u8,
    /// Registration ID.
    pub registration_id: u32,
    /// Long-term Curve25519 identity key.
    pub identity_key: [u8; binary_format::IDENTITY_KEY_LEN],
    /// Signed pre-key ID.
    pub signed_prekey_id: u32,
    /// Signed pre-key.
    pub signed_prekey: [u8; binary_format::SIGNED_PREKEY_LEN],
    /// Signature over the signed pre-key.
    pub signed_prekey_signature: [u8; binary_format::SIGNED_PREKEY_SIGNATURE_LEN],
    /// One-time pre-key ID. `0` means "none".
    pub prekey_id: u32,
    /// One-time pre-key.
    pub prekey: [u8; binary_format::PREKEY_LEN],
    /// Kyber (post-quantum KEM) pre-key ID.
    pub kyber_prekey_id: u32,
    /// Kyber pre-key.
    pub kyber_prekey: Vec<u8>,
    /// Signature over the Kyber pre-key.
    pub kyber_prekey_signature: [u8; binary_format::KYBER_PREKEY_SIGNATURE_LEN],
}

impl PairingBundle {
    /// Parse a bundle from its fixed 1,813-byte binary layout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidBundle` if `bytes` is shorter than
    /// the expected size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        use binary_format::*;

        if bytes.len() < BUNDLE_SIZE {
            return Err(TransportError::InvalidBundle(format!(
                "bundle too small: {} < {BUNDLE_SIZE}",
                bytes.len()
            )));
        }

        let u32_le = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let array = |offset: usize, len: usize| -> Vec<u8> { bytes[offset..offset + len].to_vec() };

        Ok(Self {
            version: bytes[VERSION],
            registration_id: u32_le(REGISTRATION_ID),
            identity_key: array(IDENTITY_KEY, IDENTITY_KEY_LEN)
                .try_into()
                .expect("slice length matches array size"),
            signed_prekey_id: u32_le(SIGNED_PREKEY_ID),
            signed_prekey: array(SIGNED_PREKEY, SIGNED_PREKEY_LEN)
                .try_into()
                .expect("slice length matches array size"),
            signed_prekey_signature: array(SIGNED_PREKEY_SIGNATURE, SIGNED_PREKEY_SIGNATURE_LEN)
                .try_into()
                .expect("slice length matches array size"),
            prekey_id: u32_le(PREKEY_ID),
            prekey: array(PREKEY, PREKEY_LEN)
                .try_into()
                .expect("slice length matches array size"),
            kyber_prekey_id: u32_le(KYBER_PREKEY_ID),
            kyber_prekey: array(KYBER_PREKEY, KYBER_PREKEY_LEN),
            kyber_prekey_signature: array(KYBER_PREKEY_SIGNATURE, KYBER_PREKEY_SIGNATURE_LEN)
                .try_into()
                .expect("slice length matches array size"),
        })
    }

    /// Decode a bundle from its out-of-band transport form: unpadded,
    /// upper-case Base32 (RFC 4648) embedded in a URL fragment.
    pub fn from_base32(encoded: &str) -> Result<Self, TransportError> {
        let bytes = BASE32_NOPAD
            .decode(encoded.to_uppercase().as_bytes())
            .map_err(|e| TransportError::InvalidBundle(format!("invalid base32: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Decode base64 that may or may not carry padding (signaling envelopes
/// from different hub versions have been observed both ways).
pub fn decode_b64(input: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD_NO_PAD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(input))
        .map_err(|e| TransportError::InvalidBundle(format!("invalid base64: {e}")))
}

/// A fake [`CryptoBridge`] for exercising framing and dispatch without a
/// real Olm implementation. Built into this crate's own tests; also
/// available to downstream integration tests behind the `test-util`
/// feature.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    //! A trivial, non-cryptographic `CryptoBridge` used only by this
    //! crate's own tests to exercise framing, dispatch and chunking
    //! without pulling in a real Olm implementation.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{decode_b64, CryptoBridge, OlmEnvelope, PairingBundle};
    use crate::error::TransportError;
    use crate::HubId;

    /// XORs with a fixed keystream so encrypt/decrypt round-trip without
    /// claiming to be a real ratchet. `fail_decrypt` lets tests simulate
    /// `SessionMissing`/`RatchetDesynchronized`.
    #[derive(Debug, Default)]
    pub struct FakeCryptoBridge {
        sessions: Mutex<HashMap<HubId, PairingBundle>>,
        pub fail_decrypt: std::sync::atomic::AtomicBool,
    }

    fn xor(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().map(|b| b ^ 0xA5).collect()
    }

    #[async_trait]
    impl CryptoBridge for FakeCryptoBridge {
        async fn decrypt(&self, _hub_id: &HubId, envelope: &OlmEnvelope) -> Result<Vec<u8>, TransportError> {
            if self.fail_decrypt.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError::SessionMissing(_hub_id.clone()));
            }
            let ciphertext = decode_b64(&envelope.ciphertext)?;
            Ok(xor(&ciphertext))
        }

        async fn decrypt_binary(&self, hub_id: &HubId, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
            if self.fail_decrypt.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError::SessionMissing(hub_id.clone()));
            }
            Ok(xor(&bytes[1..]))
        }

        async fn encrypt(&self, _hub_id: &HubId, json: &[u8]) -> Result<OlmEnvelope, TransportError> {
            use base64::engine::general_purpose::STANDARD_NO_PAD;
            use base64::Engine;
            Ok(OlmEnvelope {
                message_type: super::MSG_TYPE_NORMAL,
                ciphertext: STANDARD_NO_PAD.encode(xor(json)),
                sender_key: None,
            })
        }

        async fn encrypt_binary(&self, _hub_id: &HubId, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
            let mut out = vec![super::MSG_TYPE_NORMAL];
            out.extend(xor(bytes));
            Ok(out)
        }

        async fn create_session(&self, hub_id: &HubId, bundle: &PairingBundle) -> Result<(), TransportError> {
            self.sessions
                .lock()
                .expect("lock not poisoned")
                .insert(hub_id.clone(), bundle.clone());
            Ok(())
        }
    }

    impl FakeCryptoBridge {
        pub fn has_session(&self, hub_id: &HubId) -> bool {
            self.sessions.lock().expect("lock not poisoned").contains_key(hub_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; binary_format::BUNDLE_SIZE];
        bytes[binary_format::VERSION] = 6;
        bytes[binary_format::REGISTRATION_ID..binary_format::REGISTRATION_ID + 4]
            .copy_from_slice(&42u32.to_le_bytes());
        bytes[binary_format::IDENTITY_KEY] = 0xAB;
        bytes[binary_format::PREKEY_ID..binary_format::PREKEY_ID + 4]
            .copy_from_slice(&7u32.to_le_bytes());
        bytes[binary_format::KYBER_PREKEY_ID..binary_format::KYBER_PREKEY_ID + 4]
            .copy_from_slice(&99u32.to_le_bytes());
        bytes
    }

    #[test]
    fn parses_fixed_layout_fields() {
        let bytes = sample_bundle_bytes();
        let bundle = PairingBundle::from_bytes(&bytes).expect("parses");
        assert_eq!(bundle.version, 6);
        assert_eq!(bundle.registration_id, 42);
        assert_eq!(bundle.identity_key[0], 0xAB);
        assert_eq!(bundle.prekey_id, 7);
        assert_eq!(bundle.kyber_prekey_id, 99);
        assert_eq!(bundle.kyber_prekey.len(), binary_format::KYBER_PREKEY_LEN);
    }

    #[test]
    fn rejects_short_input() {
        let err = PairingBundle::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, TransportError::InvalidBundle(_)));
    }

    #[test]
    fn base32_round_trips_through_url_fragment_form() {
        let bytes = sample_bundle_bytes();
        let encoded = BASE32_NOPAD.encode(&bytes);
        let bundle = PairingBundle::from_base32(&encoded).expect("decodes");
        assert_eq!(bundle.registration_id, 42);
    }
}
