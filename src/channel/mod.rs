//! Transport-layer channels: the ActionCable-shaped signaling channel and
//! the WebRTC peer connection, plus the gzip compression helper the PTY
//! fast lane uses.

pub mod compression;
pub mod peer;
pub mod signaling;

pub use compression::{maybe_compress, maybe_decompress};
pub use peer::{PeerConnectionHandle, PeerEvent};
pub use signaling::{ActionCableSignaling, SignalingChannel, SignalingMessage};

/// Connection state shared by the signaling channel and the peer
/// connection; both report into the same taxonomy so
/// [`crate::TransportManager`] can reason about them uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Reconnecting after disconnect.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
        /// Milliseconds until next retry.
        next_retry_ms: u64,
    },
    /// Permanent error state.
    Error(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}
