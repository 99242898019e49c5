//! The event taxonomy a host observes from a [`crate::TransportManager`].
//!
//! Every asynchronous notification the core raises — connection state
//! transitions, subscription lifecycle, stream frames, ambient errors —
//! flows through this single enum so a host can register one observer per
//! manager instead of per-subsystem callbacks.

use bytes::Bytes;

use crate::channel::ConnectionState;
use crate::error::AmbientError;
use crate::{HubId, SubscriptionId};

/// Direct vs relayed transport, determined from the nominated ICE
/// candidate pair once the peer connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Nominated pair is a host/srflx candidate on both sides.
    Direct,
    /// Nominated pair routes through a TURN relay.
    Relayed,
    /// ICE has disrupted and a restart is in progress; the path may change
    /// once the connection recovers.
    Unknown,
}

impl ConnectionMode {
    /// Human-readable label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relayed => "relayed",
            Self::Unknown => "unknown",
        }
    }
}

/// Health snapshot emitted periodically while a peer connection is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Signaling and peer connection are both live.
    Healthy,
    /// The peer connection looks dead (disconnected/failed and not
    /// recovering); a restart or teardown is imminent.
    Degraded,
}

/// All events a [`crate::TransportManager`] can raise.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The signaling (ActionCable) connection changed state.
    SignalingState {
        /// Which hub this event is for.
        hub_id: HubId,
        /// Whether the signaling channel is connected.
        connected: bool,
    },
    /// The WebRTC peer connection changed state.
    ConnectionState {
        /// Which hub this event is for.
        hub_id: HubId,
        /// The new state.
        state: ConnectionState,
    },
    /// Transport mode was determined or changed after an ICE restart.
    ConnectionMode {
        /// Which hub this event is for.
        hub_id: HubId,
        /// Direct or relayed.
        mode: ConnectionMode,
    },
    /// A `subscribe` call's `subscribed` confirmation arrived.
    SubscriptionConfirmed {
        /// Which hub this event is for.
        hub_id: HubId,
        /// The subscription that was confirmed.
        subscription_id: SubscriptionId,
    },
    /// A message arrived on a confirmed subscription.
    SubscriptionMessage {
        /// Which hub this event is for.
        hub_id: HubId,
        /// The subscription the message is addressed to.
        subscription_id: SubscriptionId,
        /// Decrypted payload bytes (JSON for control messages, raw for PTY).
        payload: Bytes,
    },
    /// Periodic liveness snapshot for a hub's peer connection.
    Health {
        /// Which hub this event is for.
        hub_id: HubId,
        /// Current health status.
        status: HealthStatus,
    },
    /// A new Olm session was installed from a bundle refresh.
    SessionRefreshed {
        /// Which hub this event is for.
        hub_id: HubId,
    },
    /// The session for a hub became unusable and a refresh was requested
    /// but has not yet completed.
    SessionInvalid {
        /// Which hub this event is for.
        hub_id: HubId,
        /// Human-readable reason.
        reason: String,
    },
    /// A stream-multiplexer frame arrived for an open stream.
    StreamFrame {
        /// Which hub this event is for.
        hub_id: HubId,
        /// The multiplexed stream id.
        stream_id: u16,
        /// Frame payload (empty on close).
        payload: Bytes,
    },
    /// An ambient error with no synchronous caller to return to.
    Error(AmbientError),
}
