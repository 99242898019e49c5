//! Error kinds for the transport core.
//!
//! Mirrors the disposition table in the design: most errors are recovered
//! locally (decrypt failures trigger a bundle refresh, transient signaling
//! errors are retried by the transport) and never reach a caller. The
//! variants below are the ones that do — surfaced synchronously from the
//! call that triggered them, or via the manager's `onError` observer for
//! ambient failures that have no caller to return to.

use std::fmt;

use crate::HubId;

/// Errors raised by the transport core.
#[derive(Debug)]
pub enum TransportError {
    /// The ICE server configuration HTTP request failed.
    IceConfigFetchFailed(String),
    /// The signaling subscription was rejected by the hub.
    SignalingRejected(String),
    /// No Olm session exists for this hub; a bundle refresh is needed.
    SessionMissing(HubId),
    /// The ratchet is desynchronized; a bundle refresh is needed.
    RatchetDesynchronized(HubId),
    /// A bundle refresh itself failed to parse or install.
    SessionInvalid {
        /// The hub the refresh was for.
        hub_id: HubId,
        /// Human-readable explanation.
        message: String,
    },
    /// A send was attempted while the DataChannel is not open.
    DataChannelNotOpen(HubId),
    /// `subscribe` did not receive a `subscribed` confirmation in time.
    SubscriptionTimeout(String),
    /// The hub rejected a subscription with a server error.
    SubscriptionRejected(String),
    /// Outbound encryption failed; the frame was dropped.
    EncryptionFailed(String),
    /// An inbound frame's content-type byte did not match any known type.
    UnknownContentType(u8),
    /// A reused peer was found dead on a liveness probe.
    PeerDead(HubId),
    /// A plaintext frame exceeded the DataChannel's chunk limit for a
    /// content type that must be sent atomically.
    PayloadTooLarge {
        /// Content type byte that was asked to go out atomically.
        content_type: u8,
        /// Size of the plaintext payload.
        size: usize,
        /// The chunk limit it was compared against.
        limit: usize,
    },
    /// `subscribe` was called without a pre-encrypted subscribe frame.
    MissingEncryptedFrame,
    /// The pairing bundle's byte layout did not match the expected format.
    InvalidBundle(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceConfigFetchFailed(msg) => write!(f, "ICE config fetch failed: {msg}"),
            Self::SignalingRejected(msg) => write!(f, "signaling rejected: {msg}"),
            Self::SessionMissing(hub) => write!(f, "no session for hub {hub}"),
            Self::RatchetDesynchronized(hub) => write!(f, "ratchet desynchronized for hub {hub}"),
            Self::SessionInvalid { hub_id, message } => {
                write!(f, "session invalid for hub {hub_id}: {message}")
            }
            Self::DataChannelNotOpen(hub) => write!(f, "data channel not open for hub {hub}"),
            Self::SubscriptionTimeout(id) => write!(f, "subscription {id} timed out"),
            Self::SubscriptionRejected(msg) => write!(f, "subscription rejected: {msg}"),
            Self::EncryptionFailed(msg) => write!(f, "encryption failed: {msg}"),
            Self::UnknownContentType(byte) => write!(f, "unknown content type: 0x{byte:02x}"),
            Self::PeerDead(hub) => write!(f, "peer connection for hub {hub} is dead"),
            Self::PayloadTooLarge {
                content_type,
                size,
                limit,
            } => write!(
                f,
                "payload of {size} bytes for content type 0x{content_type:02x} exceeds chunk limit {limit}"
            ),
            Self::MissingEncryptedFrame => {
                write!(f, "subscribe requires a pre-encrypted subscribe frame")
            }
            Self::InvalidBundle(msg) => write!(f, "invalid pairing bundle: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Ambient errors with no initiating caller, delivered to
/// `TransportManager::on_error` observers.
#[derive(Debug, Clone)]
pub struct AmbientError {
    /// Which hub the error is associated with, if any.
    pub hub_id: Option<HubId>,
    /// Machine-matchable error type tag (e.g. `"server_error"`, `"encryption_failed"`).
    pub kind: &'static str,
    /// Human-readable detail.
    pub message: String,
}
