//! Crate-wide constants for the transport core.
//!
//! This module centralizes the magic numbers called out by name in the
//! design: timeouts, backoff parameters, and wire-size limits. Constants
//! are grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timeouts**: subscription confirmation, DataChannel open, grace period
//! - **ICE restart**: exponential backoff parameters
//! - **Wire limits**: DataChannel chunk sizing for the file-transfer codec

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// How long `subscribe` waits for the hub's `subscribed` confirmation
/// before failing with `SubscriptionTimeout`.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How long to wait for the DataChannel to reach the `open` state.
pub const DATA_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Deferred-teardown window for `disconnect`. A concurrent `connect`
/// within this window cancels the teardown and reuses the existing peer.
pub const GRACE_PERIOD: Duration = Duration::from_millis(3_000);

// ============================================================================
// ICE restart backoff
// ============================================================================

/// Base delay before the first ICE restart attempt.
pub const ICE_RESTART_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Backoff multiplier applied per ICE restart attempt.
pub const ICE_RESTART_BACKOFF_MULTIPLIER: u32 = 2;

/// Maximum number of ICE restart attempts before tearing the peer down.
pub const ICE_RESTART_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Wire limits
// ============================================================================

/// Typical SCTP `maxMessageSize` assumed for the DataChannel when the
/// transport doesn't report one explicitly.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Reserve subtracted from `maxMessageSize` to account for Olm envelope
/// overhead (ciphertext expansion, base64/binary framing) when computing
/// the chunk limit for file transfers.
pub const ENVELOPE_OVERHEAD_RESERVE: usize = 256;

/// Gzip-compress outbound PTY payloads at or above this size.
pub const PTY_COMPRESSION_THRESHOLD: usize = 4096;
