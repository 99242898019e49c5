//! Browser-side transport and session core.
//!
//! Gives a host application a secure, multiplexed, real-time channel to a
//! remote hub process: WebRTC peer connection setup over an ActionCable-
//! shaped signaling channel, Olm-encrypted framing on top of the
//! DataChannel, a TCP-like stream multiplexer, and a subscription router
//! for named logical channels (terminal I/O, file transfer, previews).
//!
//! This crate never implements end-to-end cryptography itself — see
//! [`crypto_bridge::CryptoBridge`] for the seam a host fills in.

pub mod channel;
pub mod codec;
pub mod config;
pub mod constants;
pub mod crypto_bridge;
pub mod error;
pub mod events;
pub mod http_parser;
pub mod manager;
pub mod router;
pub mod stream_mux;
pub mod types;

pub use config::TransportConfig;
pub use crypto_bridge::{CryptoBridge, OlmEnvelope, PairingBundle};
pub use error::{AmbientError, TransportError};
pub use events::TransportEvent;
pub use manager::TransportManager;
pub use types::{HubId, SubscriptionId};
