//! WebRTC peer connection: the browser's offerer-side counterpart to a
//! hub's answerer-side connection.
//!
//! Creates the offer and the DataChannel (the browser always initiates,
//! per the handshake), drives ICE restart with exponential backoff,
//! detects Direct vs Relayed transport mode from the nominated candidate
//! pair, and exposes a grace-period deferred teardown so a page
//! navigation doesn't tear down an otherwise-healthy peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustrtc::transports::ice::IceCandidate;
use rustrtc::transports::sctp::DataChannel;
use rustrtc::{
    DataChannelEvent, IceServer, PeerConnection, PeerConnectionEvent, PeerConnectionState,
    RtcConfiguration, SdpType, SessionDescription, SignalingState,
};
use tokio::sync::{mpsc, Mutex, RwLock};

use super::ConnectionState;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::ConnectionMode;
use crate::HubId;

/// Events a [`PeerConnectionHandle`] emits for
/// [`crate::manager::TransportManager`] to translate into
/// [`crate::TransportEvent`]s.
#[derive(Debug)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and needs relaying through signaling.
    LocalIceCandidate(IceCandidate),
    /// The DataChannel opened.
    DataChannelOpen,
    /// A raw (still Olm-framed) binary message arrived on the DataChannel.
    DataChannelMessage(Vec<u8>),
    /// The DataChannel closed.
    DataChannelClose,
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// Transport mode was determined from the nominated candidate pair.
    ModeDetected(ConnectionMode),
    /// An ICE restart produced a fresh local offer that needs relaying
    /// through signaling, encrypted, the same way the initial offer is.
    IceRestartOffer(String),
}

/// Insert `a=max-message-size` when `rustrtc` omits it; per RFC 8841
/// browsers default to 65536 without it, which is too small for a
/// gzip-expanded screenshot or file chunk.
fn inject_max_message_size(sdp: &str, value: u64) -> String {
    let mut result = String::with_capacity(sdp.len() + 30);
    let mut injected = false;
    for line in sdp.lines() {
        result.push_str(line);
        result.push_str("\r\n");
        if !injected && line.starts_with("m=application") {
            result.push_str(&format!("a=max-message-size:{value}\r\n"));
            injected = true;
        }
    }
    result
}

#[derive(serde::Deserialize)]
struct IceConfigResponse {
    ice_servers: Vec<IceServerJson>,
}

#[derive(serde::Deserialize)]
struct IceServerJson {
    urls: String,
    username: Option<String>,
    credential: Option<String>,
}

async fn fetch_ice_config(config: &TransportConfig, hub_id: &HubId) -> Result<Vec<IceServer>, TransportError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| TransportError::IceConfigFetchFailed(format!("client build failed: {e}")))?;

    let response = client
        .get(config.ice_config_url(hub_id.as_ref()))
        .bearer_auth(&config.api_key)
        .send()
        .await
        .map_err(|e| TransportError::IceConfigFetchFailed(format!("request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(TransportError::IceConfigFetchFailed(format!(
            "server returned {}",
            response.status()
        )));
    }

    let parsed: IceConfigResponse = response
        .json()
        .await
        .map_err(|e| TransportError::IceConfigFetchFailed(format!("invalid response body: {e}")))?;

    Ok(parsed
        .ice_servers
        .into_iter()
        .map(|s| IceServer {
            urls: vec![s.urls],
            username: s.username,
            credential: s.credential,
            credential_type: rustrtc::IceCredentialType::Password,
        })
        .collect())
}

/// A single hub's WebRTC peer connection, owned by the manager.
pub struct PeerConnectionHandle {
    hub_id: HubId,
    config: TransportConfig,
    peer_connection: Mutex<Option<PeerConnection>>,
    data_channel: Mutex<Option<Arc<DataChannel>>>,
    data_channel_id: Mutex<Option<u16>>,
    state: Arc<RwLock<ConnectionState>>,
    mode: Arc<RwLock<Option<ConnectionMode>>>,
    ice_restart_attempt: AtomicU32,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    event_loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    grace_cancel: Arc<tokio::sync::Notify>,
}

impl std::fmt::Debug for PeerConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionHandle")
            .field("hub_id", &self.hub_id)
            .finish_non_exhaustive()
    }
}

impl PeerConnectionHandle {
    /// Create a handle with no connection yet established.
    #[must_use]
    pub fn new(hub_id: HubId, config: TransportConfig, event_tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            hub_id,
            config,
            peer_connection: Mutex::new(None),
            data_channel: Mutex::new(None),
            data_channel_id: Mutex::new(None),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            mode: Arc::new(RwLock::new(None)),
            ice_restart_attempt: AtomicU32::new(0),
            event_tx,
            event_loop_handle: Mutex::new(None),
            grace_cancel: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Detected transport mode, if the connection has reached a state
    /// where a nominated candidate pair exists.
    pub async fn mode(&self) -> Option<ConnectionMode> {
        *self.mode.read().await
    }

    /// Create the offer and the control DataChannel (browser initiates,
    /// per the handshake). Returns the local SDP offer to relay through
    /// signaling.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IceConfigFetchFailed` if the ICE server
    /// list can't be fetched.
    pub async fn create_offer(self: &Arc<Self>) -> Result<String, TransportError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ice_servers = fetch_ice_config(&self.config, &self.hub_id).await?;
        let rtc_config = RtcConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = PeerConnection::new(rtc_config);

        let dc = pc
            .create_data_channel("relay", None)
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("data channel create failed: {e}")))?;
        *self.data_channel_id.lock().await = Some(dc.id());
        *self.data_channel.lock().await = Some(Arc::clone(&dc));

        let offer = pc
            .create_offer()
            .await
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("create offer failed: {e}")))?;
        pc.set_local_description(offer.clone())
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("set local description failed: {e}")))?;

        *self.peer_connection.lock().await = Some(pc.clone());

        let handle = self.spawn_event_loop(pc, dc);
        *self.event_loop_handle.lock().await = Some(handle);

        let mut sdp = offer.to_sdp_string();
        if !sdp.contains("max-message-size") {
            sdp = inject_max_message_size(&sdp, 16 * 1024 * 1024);
        }
        Ok(sdp)
    }

    /// Apply the hub's SDP answer to the pending or existing connection.
    ///
    /// Late answers are dropped: once the signaling state has already
    /// reached `stable` (the offer/answer exchange already completed),
    /// a second answer would reenter negotiation and is ignored.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IceConfigFetchFailed` if no connection is
    /// pending, or the answer fails to parse/apply.
    pub async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let guard = self.peer_connection.lock().await;
        let pc = guard
            .as_ref()
            .ok_or_else(|| TransportError::IceConfigFetchFailed("no pending offer".to_string()))?
            .clone();
        drop(guard);

        if pc.signaling_state() == SignalingState::Stable {
            log::debug!("dropping late SDP answer for hub {}: already stable", self.hub_id);
            return Ok(());
        }

        let answer = SessionDescription::parse(SdpType::Answer, sdp)
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("invalid SDP answer: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("set remote description failed: {e}")))
    }

    /// Add a remote ICE candidate relayed from the hub. Candidates that
    /// arrive before the remote description is set are buffered by
    /// `rustrtc` itself; this call is always safe.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IceConfigFetchFailed` if no connection exists.
    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let guard = self.peer_connection.lock().await;
        let pc = guard
            .as_ref()
            .ok_or_else(|| TransportError::IceConfigFetchFailed("no connection".to_string()))?;
        pc.add_ice_candidate(candidate)
            .await
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("add ICE candidate failed: {e}")))
    }

    /// Restart ICE: create a fresh offer on the existing connection so
    /// the hub can renegotiate without tearing down the DataChannel.
    /// Caller is responsible for running this under the backoff schedule
    /// in [`crate::constants`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IceConfigFetchFailed` if no connection
    /// exists or offer creation fails.
    pub async fn restart_ice(&self) -> Result<String, TransportError> {
        let guard = self.peer_connection.lock().await;
        let pc = guard
            .as_ref()
            .ok_or_else(|| TransportError::IceConfigFetchFailed("no connection to restart".to_string()))?
            .clone();
        drop(guard);

        self.ice_restart_attempt.fetch_add(1, Ordering::Relaxed);

        let offer = pc
            .create_offer()
            .await
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("ICE restart offer failed: {e}")))?;
        pc.set_local_description(offer.clone())
            .map_err(|e| TransportError::IceConfigFetchFailed(format!("set local description failed: {e}")))?;

        let mut sdp = offer.to_sdp_string();
        if !sdp.contains("max-message-size") {
            sdp = inject_max_message_size(&sdp, 16 * 1024 * 1024);
        }
        Ok(sdp)
    }

    /// Number of ICE restart attempts made since the connection was created.
    pub fn ice_restart_attempts(&self) -> u32 {
        self.ice_restart_attempt.load(Ordering::Relaxed)
    }

    /// Backoff delay for ICE restart attempt number `attempt` (0-indexed),
    /// per this handle's configured base delay and multiplier.
    fn ice_restart_delay(&self, attempt: u32) -> Duration {
        self.config
            .ice_restart_base_delay
            .saturating_mul(self.config.ice_restart_backoff_multiplier.saturating_pow(attempt))
    }

    /// Whether this peer should be treated as dead and replaced rather
    /// than reused: its connection state has collapsed, or it claims to
    /// be connected but the DataChannel has gone missing (observed on
    /// mobile-device sleep/resume).
    pub async fn is_dead(&self) -> bool {
        match self.state().await {
            ConnectionState::Disconnected | ConnectionState::Error(_) => true,
            ConnectionState::Connected => self.data_channel_id.lock().await.is_none(),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => false,
        }
    }

    /// Whether the DataChannel itself currently has an id assigned (i.e.
    /// looks open from this side's bookkeeping). Backs `probePeerHealth`'s
    /// `dcState` field.
    pub async fn data_channel_open(&self) -> bool {
        self.data_channel_id.lock().await.is_some()
    }

    /// Send a raw (already Olm-framed) binary frame over the DataChannel.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if the DataChannel
    /// hasn't opened yet.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let pc_guard = self.peer_connection.lock().await;
        let pc = pc_guard
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(self.hub_id.clone()))?;
        let dc_id = self
            .data_channel_id
            .lock()
            .await
            .ok_or_else(|| TransportError::DataChannelNotOpen(self.hub_id.clone()))?;
        pc.send_data(dc_id, bytes)
            .map_err(|e| TransportError::DataChannelNotOpen(HubId::from(format!("{}: {e}", self.hub_id))))
    }

    /// Start the grace-period deferred-teardown timer. If `cancel` or a
    /// new `create_offer`/reuse happens before it elapses, the close
    /// never runs.
    pub fn start_grace_period(self: &Arc<Self>, grace_period: Duration) {
        let this = Arc::clone(self);
        let cancel = Arc::clone(&self.grace_cancel);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(grace_period) => {
                    this.close().await;
                }
                () = cancel.notified() => {}
            }
        });
    }

    /// Cancel a pending grace-period teardown (a host reacquired the hub
    /// before the timer elapsed).
    pub fn cancel_grace_period(&self) {
        self.grace_cancel.notify_one();
    }

    /// Close the peer connection and DataChannel immediately.
    pub async fn close(&self) {
        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(pc) = self.peer_connection.lock().await.take() {
            pc.close();
        }
        self.data_channel.lock().await.take();
        self.data_channel_id.lock().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn spawn_event_loop(self: &Arc<Self>, pc: PeerConnection, dc: Arc<DataChannel>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let state = Arc::clone(&self.state);
        let mode = Arc::clone(&self.mode);
        let data_channel = Arc::new(Mutex::new(Some(Arc::clone(&dc))));
        let event_tx = self.event_tx.clone();
        let hub_id = self.hub_id.clone();

        let mut ice_rx = pc.subscribe_ice_candidates();
        let mut peer_state_rx = pc.subscribe_peer_state();
        let ice_event_tx = event_tx.clone();

        tokio::spawn(async move {
            let ice_task = tokio::spawn(async move {
                loop {
                    match ice_rx.recv().await {
                        Ok(candidate) => {
                            let _ = ice_event_tx.send(PeerEvent::LocalIceCandidate(candidate));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("ICE candidate subscription lagged by {n} for hub {hub_id}");
                        }
                    }
                }
            });

            let dc_closed = Arc::new(tokio::sync::Notify::new());
            let dc_reader_tx = event_tx.clone();
            let dc_closed_signal = Arc::clone(&dc_closed);
            let dc_reader = Arc::clone(&dc);
            let dc_reader_handle = tokio::spawn(async move {
                loop {
                    match dc_reader.recv().await {
                        Some(DataChannelEvent::Message(data)) => {
                            let _ = dc_reader_tx.send(PeerEvent::DataChannelMessage(data));
                        }
                        Some(DataChannelEvent::Open) => {
                            let _ = dc_reader_tx.send(PeerEvent::DataChannelOpen);
                        }
                        Some(DataChannelEvent::Close) | None => {
                            let _ = dc_reader_tx.send(PeerEvent::DataChannelClose);
                            dc_closed_signal.notify_one();
                            break;
                        }
                    }
                }
            });

            loop {
                tokio::select! {
                    event = pc.recv() => {
                        match event {
                            Some(PeerConnectionEvent::DataChannel(_)) | Some(PeerConnectionEvent::Track(_)) => {}
                            None => {
                                *state.write().await = ConnectionState::Disconnected;
                                data_channel.lock().await.take();
                                let _ = event_tx.send(PeerEvent::StateChanged(ConnectionState::Disconnected));
                                break;
                            }
                        }
                    }
                    _ = peer_state_rx.changed() => {
                        let s = *peer_state_rx.borrow();
                        let new_state = match s {
                            PeerConnectionState::Connected => {
                                this.ice_restart_attempt.store(0, Ordering::Relaxed);
                                if let Some(pair) = pc.selected_candidate_pair() {
                                    let detected = if pair.is_relay() {
                                        ConnectionMode::Relayed
                                    } else {
                                        ConnectionMode::Direct
                                    };
                                    *mode.write().await = Some(detected);
                                    let _ = event_tx.send(PeerEvent::ModeDetected(detected));
                                }
                                ConnectionState::Connected
                            }
                            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                                let attempt = this.ice_restart_attempt.load(Ordering::Relaxed);
                                if attempt >= this.config.ice_restart_max_attempts {
                                    ConnectionState::Disconnected
                                } else {
                                    let delay = this.ice_restart_delay(attempt);
                                    *mode.write().await = Some(ConnectionMode::Unknown);
                                    let _ = event_tx.send(PeerEvent::ModeDetected(ConnectionMode::Unknown));
                                    let restart_state = ConnectionState::Reconnecting {
                                        attempt,
                                        next_retry_ms: delay.as_millis() as u64,
                                    };
                                    *state.write().await = restart_state.clone();
                                    let _ = event_tx.send(PeerEvent::StateChanged(restart_state));

                                    let restarter = Arc::clone(&this);
                                    let restart_tx = event_tx.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        match restarter.restart_ice().await {
                                            Ok(offer) => {
                                                let _ = restart_tx.send(PeerEvent::IceRestartOffer(offer));
                                            }
                                            Err(e) => {
                                                log::warn!("ICE restart attempt failed: {e}");
                                            }
                                        }
                                    });
                                    continue
                                }
                            }
                            PeerConnectionState::Closed => ConnectionState::Disconnected,
                            _ => continue,
                        };
                        *state.write().await = new_state.clone();
                        let _ = event_tx.send(PeerEvent::StateChanged(new_state));
                    }
                    () = dc_closed.notified() => {
                        *state.write().await = ConnectionState::Disconnected;
                        data_channel.lock().await.take();
                        let _ = event_tx.send(PeerEvent::StateChanged(ConnectionState::Disconnected));
                        break;
                    }
                }
            }

            ice_task.abort();
            dc_reader_handle.abort();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_injected_after_application_section() {
        let sdp = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n";
        let out = inject_max_message_size(sdp, 16 * 1024 * 1024);
        assert!(out.contains("a=max-message-size:16777216"));
        let app_idx = out.find("m=application").unwrap();
        let size_idx = out.find("a=max-message-size").unwrap();
        assert!(size_idx > app_idx);
    }

    #[test]
    fn max_message_size_not_duplicated_when_present() {
        let sdp = "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=max-message-size:65536\r\n";
        assert!(sdp.contains("max-message-size"));
    }
}
