//! Process-wide transport manager: the single entry point a host uses to
//! connect to hubs, subscribe to logical channels, and tear everything
//! down on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::channel::peer::{PeerConnectionHandle, PeerEvent};
use crate::channel::signaling::{ActionCableSignaling, SignalingChannel, SignalingMessage};
use crate::channel::ConnectionState;
use crate::codec::{DataChannelCodec, InboundContent};
use crate::config::TransportConfig;
use crate::constants::{DEFAULT_MAX_MESSAGE_SIZE, ENVELOPE_OVERHEAD_RESERVE};
use crate::crypto_bridge::{CryptoBridge, OlmEnvelope, PairingBundle, CONTENT_PTY, CONTENT_STREAM, MSG_TYPE_BUNDLE_REFRESH};
use crate::error::{AmbientError, TransportError};
use crate::events::{HealthStatus, TransportEvent};
use crate::router::SubscriptionRouter;
use crate::stream_mux::{MuxStream, StreamFrame, StreamMultiplexer};
use crate::{HubId, SubscriptionId};

static INSTANCE: OnceLock<Arc<TransportManager>> = OnceLock::new();

/// Whether a hub's DataChannel is open, backing [`PeerHealthSnapshot::dc_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// The DataChannel has an assigned id and is usable.
    Open,
    /// No peer connection is up, or its DataChannel hasn't opened.
    Closed,
}

/// Liveness snapshot returned by [`TransportManager::probe_peer_health`].
#[derive(Debug, Clone)]
pub struct PeerHealthSnapshot {
    /// Whether the peer looks alive (not dead per [`PeerConnectionHandle::is_dead`]).
    pub alive: bool,
    /// Current connection state.
    pub pc_state: ConnectionState,
    /// Current DataChannel state.
    pub dc_state: DataChannelState,
}

/// Everything that exists only once a peer connection has been
/// negotiated: signaling alone (just `connectSignaling`) leaves a hub
/// with no `PeerBundle` yet.
struct PeerBundle {
    peer: Arc<PeerConnectionHandle>,
    codec: Arc<DataChannelCodec>,
    router: SubscriptionRouter,
    stream_mux: StreamMultiplexer,
    outbound_plaintext_tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct HubRecord {
    signaling: Arc<dyn SignalingChannel>,
    peer_bundle: Option<PeerBundle>,
}

/// Composes signaling, the peer connection, the codec, the subscription
/// router and the stream multiplexer into one per-hub session, and owns
/// every hub a host is talking to.
pub struct TransportManager {
    config: TransportConfig,
    crypto: Arc<dyn CryptoBridge>,
    hubs: RwLock<HashMap<HubId, HubRecord>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager").finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Build a manager. Hosts normally use [`TransportManager::global`]
    /// instead of calling this directly.
    #[must_use]
    pub fn new(config: TransportConfig, crypto: Arc<dyn CryptoBridge>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            crypto,
            hubs: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Get or initialize the process-wide singleton.
    pub fn global(config: TransportConfig, crypto: Arc<dyn CryptoBridge>) -> Arc<Self> {
        INSTANCE.get_or_init(|| Self::new(config, crypto)).clone()
    }

    /// Take ownership of the event stream. Only one caller may hold it;
    /// subsequent calls return `None`.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Connect to `hub_id`: establish signaling, then negotiate the peer
    /// connection over it.
    ///
    /// If a grace-period teardown is pending for this hub, it is
    /// cancelled and the existing peer reused instead of reconnecting.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IceConfigFetchFailed` or
    /// `TransportError::SignalingRejected` if either leg of the handshake
    /// fails, or `TransportError::DataChannelNotOpen` if the DataChannel
    /// doesn't open within `data_channel_open_timeout`.
    pub async fn connect(self: &Arc<Self>, hub_id: HubId) -> Result<(), TransportError> {
        {
            let hubs = self.hubs.read().await;
            if let Some(record) = hubs.get(&hub_id) {
                if let Some(bundle) = &record.peer_bundle {
                    if !bundle.peer.is_dead().await {
                        bundle.peer.cancel_grace_period();
                        return Ok(());
                    }
                }
            }
        }

        self.connect_signaling(&hub_id).await?;
        self.connect_peer(hub_id).await
    }

    /// Establish (or reuse) the signaling connection for `hub_id` without
    /// negotiating a peer connection. A host that only needs pairing or
    /// bundle-refresh traffic can stop here.
    ///
    /// # Errors
    ///
    /// Returns whatever `SignalingChannel::connect` returns (typically
    /// `TransportError::SignalingRejected`).
    pub async fn connect_signaling(self: &Arc<Self>, hub_id: &HubId) -> Result<(), TransportError> {
        if let Some(record) = self.hubs.read().await.get(hub_id) {
            if record.peer_bundle.is_none() {
                return Ok(());
            }
        }

        if let Some(record) = self.hubs.write().await.remove(hub_id) {
            if let Some(bundle) = record.peer_bundle {
                bundle.peer.close().await;
                bundle.stream_mux.close_all().await;
            }
            record.signaling.disconnect().await;
        }

        let signaling: Arc<dyn SignalingChannel> = Arc::new(ActionCableSignaling::new());
        signaling
            .connect(&self.config.server_url, &self.config.api_key, hub_id)
            .await?;
        self.emit(TransportEvent::SignalingState {
            hub_id: hub_id.clone(),
            connected: true,
        });

        self.hubs.write().await.insert(
            hub_id.clone(),
            HubRecord {
                signaling,
                peer_bundle: None,
            },
        );
        Ok(())
    }

    /// Negotiate the WebRTC peer connection for `hub_id`, which must
    /// already have a signaling connection from [`Self::connect_signaling`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if signaling isn't
    /// connected yet, or any handshake failure from [`Self::connect_signaling`].
    pub async fn connect_peer(self: &Arc<Self>, hub_id: HubId) -> Result<(), TransportError> {
        let signaling = {
            let hubs = self.hubs.read().await;
            let record = hubs
                .get(&hub_id)
                .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
            Arc::clone(&record.signaling)
        };

        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(PeerConnectionHandle::new(
            hub_id.clone(),
            self.config.clone(),
            peer_events_tx,
        ));

        let offer_sdp = peer.create_offer().await?;
        let offer_envelope = self.crypto.encrypt(&hub_id, offer_sdp.as_bytes()).await?;
        signaling
            .send(&serde_json::to_vec(&offer_envelope).expect("envelope serializes"))
            .await?;

        let answer_message = tokio::time::timeout(self.config.subscribe_timeout, signaling.recv())
            .await
            .map_err(|_| TransportError::SubscriptionTimeout(hub_id.to_string()))??;
        let SignalingMessage::Data(answer_bytes) = answer_message else {
            return Err(TransportError::SignalingRejected("expected SDP answer".to_string()));
        };
        let envelope: OlmEnvelope = serde_json::from_slice(&answer_bytes)
            .map_err(|e| TransportError::SignalingRejected(format!("invalid answer envelope: {e}")))?;
        let answer_sdp = self.crypto.decrypt(&hub_id, &envelope).await?;
        peer.apply_answer(&String::from_utf8_lossy(&answer_sdp)).await?;

        let codec = Arc::new(DataChannelCodec::new(self.config.pty_compression_threshold));
        let (outbound_plaintext_tx, mut outbound_plaintext_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (stream_output_tx, mut stream_output_rx) = mpsc::unbounded_channel();
        let stream_mux = StreamMultiplexer::new(stream_output_tx);
        let router = SubscriptionRouter::new(outbound_plaintext_tx.clone());

        // Forward control-message sends into the outbound plaintext queue
        // already happens via `outbound_plaintext_tx` passed to the
        // router above; stream frames need their own forwarding task.
        {
            let outbound_plaintext_tx = outbound_plaintext_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream_output_rx.recv().await {
                    let plaintext = DataChannelCodec::encode_stream(&frame);
                    if outbound_plaintext_tx.send(plaintext).is_err() {
                        break;
                    }
                }
            });
        }

        // Encrypt and send every plaintext frame queued by the router,
        // stream multiplexer, or direct PTY/file sends.
        {
            let peer = Arc::clone(&peer);
            let crypto = Arc::clone(&self.crypto);
            let hub_id = hub_id.clone();
            tokio::spawn(async move {
                while let Some(plaintext) = outbound_plaintext_rx.recv().await {
                    match crypto.encrypt_binary(&hub_id, &plaintext).await {
                        Ok(framed) => {
                            if let Err(e) = peer.send(&framed).await {
                                log::warn!("failed to send frame to hub {hub_id}: {e}");
                            }
                        }
                        Err(e) => log::warn!("failed to encrypt outbound frame for hub {hub_id}: {e}"),
                    }
                }
            });
        }

        {
            let mut hubs = self.hubs.write().await;
            let record = hubs
                .get_mut(&hub_id)
                .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
            record.peer_bundle = Some(PeerBundle {
                peer: Arc::clone(&peer),
                codec,
                router,
                stream_mux,
                outbound_plaintext_tx,
            });
        }

        self.spawn_peer_event_forwarder(hub_id.clone(), peer_events_rx, Arc::clone(&peer));

        tokio::time::timeout(self.config.data_channel_open_timeout, async {
            loop {
                if matches!(peer.state().await, ConnectionState::Connected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .map_err(|_| TransportError::DataChannelNotOpen(hub_id))?;

        Ok(())
    }

    fn spawn_peer_event_forwarder(
        self: &Arc<Self>,
        hub_id: HubId,
        mut peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
        peer: Arc<PeerConnectionHandle>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = peer_events_rx.recv().await {
                match event {
                    PeerEvent::LocalIceCandidate(candidate) => {
                        let hubs = manager.hubs.read().await;
                        if let Some(record) = hubs.get(&hub_id) {
                            let payload = serde_json::json!({"candidate": candidate.to_sdp()});
                            if let Ok(envelope) = manager
                                .crypto
                                .encrypt(&hub_id, &serde_json::to_vec(&payload).unwrap_or_default())
                                .await
                            {
                                let _ = record
                                    .signaling
                                    .send(&serde_json::to_vec(&envelope).unwrap_or_default())
                                    .await;
                            }
                        }
                    }
                    PeerEvent::IceRestartOffer(offer) => {
                        let hubs = manager.hubs.read().await;
                        if let Some(record) = hubs.get(&hub_id) {
                            let payload = serde_json::json!({"type": "offer", "sdp": offer});
                            if let Ok(envelope) = manager
                                .crypto
                                .encrypt(&hub_id, &serde_json::to_vec(&payload).unwrap_or_default())
                                .await
                            {
                                let _ = record
                                    .signaling
                                    .send(&serde_json::to_vec(&envelope).unwrap_or_default())
                                    .await;
                            }
                        }
                    }
                    PeerEvent::DataChannelOpen => {
                        manager.emit(TransportEvent::ConnectionState {
                            hub_id: hub_id.clone(),
                            state: ConnectionState::Connected,
                        });
                    }
                    PeerEvent::DataChannelMessage(bytes) => {
                        manager.handle_inbound_frame(&hub_id, bytes).await;
                    }
                    PeerEvent::DataChannelClose => {
                        manager.emit(TransportEvent::ConnectionState {
                            hub_id: hub_id.clone(),
                            state: ConnectionState::Disconnected,
                        });
                        manager.emit(TransportEvent::Health {
                            hub_id: hub_id.clone(),
                            status: HealthStatus::Degraded,
                        });
                    }
                    PeerEvent::StateChanged(state) => {
                        manager.emit(TransportEvent::ConnectionState {
                            hub_id: hub_id.clone(),
                            state,
                        });
                    }
                    PeerEvent::ModeDetected(mode) => {
                        manager.emit(TransportEvent::ConnectionMode {
                            hub_id: hub_id.clone(),
                            mode,
                        });
                    }
                }
            }
            let _ = peer.state().await;
        });
    }

    async fn handle_inbound_frame(self: &Arc<Self>, hub_id: &HubId, framed: Vec<u8>) {
        let decrypted = match self.crypto.decrypt_binary(hub_id, &framed).await {
            Ok(bytes) => bytes,
            Err(TransportError::SessionMissing(_) | TransportError::RatchetDesynchronized(_)) => {
                self.emit(TransportEvent::SessionInvalid {
                    hub_id: hub_id.clone(),
                    reason: "ratchet desynchronized, requesting bundle refresh".to_string(),
                });
                self.request_bundle_refresh(hub_id).await;
                return;
            }
            Err(e) => {
                self.emit(TransportEvent::Error(AmbientError {
                    hub_id: Some(hub_id.clone()),
                    kind: "decryption_failed",
                    message: e.to_string(),
                }));
                return;
            }
        };

        let hubs = self.hubs.read().await;
        let Some(record) = hubs.get(hub_id) else { return };
        let Some(bundle) = &record.peer_bundle else { return };

        match bundle.codec.decode(&decrypted).await {
            Ok(InboundContent::Control(bytes)) => {
                if !bytes.is_empty() {
                    if let Err(e) = bundle.router.handle_incoming(&bytes).await {
                        log::warn!("control message dispatch failed for hub {hub_id}: {e}");
                    }
                }
            }
            Ok(InboundContent::Pty { sub_id, bytes }) => {
                self.emit(TransportEvent::SubscriptionMessage {
                    hub_id: hub_id.clone(),
                    subscription_id: SubscriptionId::from(sub_id),
                    payload: bytes.into(),
                });
            }
            Ok(InboundContent::Stream(frame)) => {
                let payload = frame.payload.clone().into();
                let stream_id = frame.stream_id;
                bundle.stream_mux.handle_frame(frame).await;
                self.emit(TransportEvent::StreamFrame {
                    hub_id: hub_id.clone(),
                    stream_id,
                    payload,
                });
            }
            Ok(InboundContent::File { sub_id, name, bytes }) | Ok(InboundContent::FileReassembled { sub_id, name, bytes }) => {
                log::debug!("delivering file {name} to subscription {sub_id} on hub {hub_id}");
                self.emit(TransportEvent::SubscriptionMessage {
                    hub_id: hub_id.clone(),
                    subscription_id: SubscriptionId::from(sub_id),
                    payload: bytes.into(),
                });
            }
            Ok(InboundContent::Pending) => {}
            Err(e) => {
                self.emit(TransportEvent::Error(AmbientError {
                    hub_id: Some(hub_id.clone()),
                    kind: "unknown_content_type",
                    message: e.to_string(),
                }));
            }
        }
    }

    async fn request_bundle_refresh(&self, hub_id: &HubId) {
        let hubs = self.hubs.read().await;
        let Some(record) = hubs.get(hub_id) else { return };
        let request = serde_json::json!({"t": MSG_TYPE_BUNDLE_REFRESH});
        if let Ok(envelope) = self.crypto.encrypt(hub_id, &serde_json::to_vec(&request).unwrap_or_default()).await {
            let _ = record
                .signaling
                .send(&serde_json::to_vec(&envelope).unwrap_or_default())
                .await;
        }
    }

    /// Install a fresh session for `hub_id` from an out-of-band pairing
    /// bundle, then resume normal operation.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SessionInvalid` if the bundle is rejected
    /// by the crypto bridge.
    pub async fn refresh_session(&self, hub_id: &HubId, bundle: &PairingBundle) -> Result<(), TransportError> {
        self.crypto
            .create_session(hub_id, bundle)
            .await
            .map_err(|e| TransportError::SessionInvalid {
                hub_id: hub_id.clone(),
                message: e.to_string(),
            })?;
        self.emit(TransportEvent::SessionRefreshed { hub_id: hub_id.clone() });
        Ok(())
    }

    /// Subscribe to a named logical channel on `hub_id`.
    ///
    /// `encrypted_subscribe_frame` is a pre-encrypted frame (built and
    /// Olm-sealed by the caller, typically carrying channel-specific
    /// handshake material) that is relayed to the hub ahead of the
    /// `subscribe` control message itself.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::MissingEncryptedFrame` if
    /// `encrypted_subscribe_frame` is empty, `TransportError::DataChannelNotOpen`
    /// if `hub_id` has no peer connection, or the router's own
    /// subscription errors.
    pub async fn subscribe(
        &self,
        hub_id: &HubId,
        subscription_id: impl Into<String>,
        channel: impl Into<String>,
        params: serde_json::Value,
        encrypted_subscribe_frame: &[u8],
    ) -> Result<crate::router::SubscriptionHandle, TransportError> {
        if encrypted_subscribe_frame.is_empty() {
            return Err(TransportError::MissingEncryptedFrame);
        }

        let hubs = self.hubs.read().await;
        let record = hubs.get(hub_id).ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        bundle.peer.send(encrypted_subscribe_frame).await?;
        bundle
            .router
            .subscribe(subscription_id, channel, params, self.config.subscribe_timeout)
            .await
    }

    /// Drop a subscription on `hub_id`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` has no peer connection.
    pub async fn unsubscribe(&self, hub_id: &HubId, subscription_id: &SubscriptionId) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs.get(hub_id).ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        bundle.router.unsubscribe(subscription_id).await;
        Ok(())
    }

    /// Send a PTY I/O payload on the fast lane (no control-message
    /// wrapping, gzip-compressed above the configured threshold).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't
    /// connected, or `TransportError::PayloadTooLarge` if the encoded
    /// frame would exceed the DataChannel's chunk limit (PTY frames are
    /// always sent atomically, never chunked).
    pub async fn send_pty(&self, hub_id: &HubId, sub_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        let frame = bundle.codec.encode_pty(sub_id, payload)?;
        let chunk_limit = DEFAULT_MAX_MESSAGE_SIZE.saturating_sub(ENVELOPE_OVERHEAD_RESERVE);
        if frame.len() > chunk_limit {
            return Err(TransportError::PayloadTooLarge {
                content_type: CONTENT_PTY,
                size: frame.len(),
                limit: chunk_limit,
            });
        }

        bundle
            .outbound_plaintext_tx
            .send(frame)
            .map_err(|_| TransportError::DataChannelNotOpen(hub_id.clone()))
    }

    /// Send a file to `hub_id` for `sub_id`, chunking it automatically
    /// when it would exceed the DataChannel's chunk limit.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't connected.
    pub async fn send_file(
        &self,
        hub_id: &HubId,
        sub_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        let chunk_limit = DEFAULT_MAX_MESSAGE_SIZE.saturating_sub(ENVELOPE_OVERHEAD_RESERVE);
        let atomic_frame = DataChannelCodec::encode_file(sub_id, filename, bytes);

        let frames = if atomic_frame.len() <= chunk_limit {
            vec![atomic_frame]
        } else {
            let transfer_id = rand::random::<u8>();
            DataChannelCodec::encode_file_chunks(transfer_id, sub_id, filename, bytes, chunk_limit)
        };

        for frame in frames {
            bundle
                .outbound_plaintext_tx
                .send(frame)
                .map_err(|_| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        }
        Ok(())
    }

    /// Open a multiplexed TCP-like stream to `port` on `hub_id`'s side.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't
    /// connected or the hub refuses the stream.
    pub async fn open_stream(&self, hub_id: &HubId, port: u16) -> Result<MuxStream, TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        bundle.stream_mux.open(port).await
    }

    /// Write a raw stream-multiplexer frame produced elsewhere directly
    /// (used internally by [`MuxStream::write`]'s caller path in tests;
    /// hosts normally use the handle returned by `open_stream`).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't
    /// connected, or `TransportError::PayloadTooLarge` if the frame would
    /// exceed the DataChannel's chunk limit.
    pub async fn send_stream_frame(&self, hub_id: &HubId, frame: StreamFrame) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        let plaintext = DataChannelCodec::encode_stream(&frame);
        let chunk_limit = DEFAULT_MAX_MESSAGE_SIZE.saturating_sub(ENVELOPE_OVERHEAD_RESERVE);
        if plaintext.len() > chunk_limit {
            return Err(TransportError::PayloadTooLarge {
                content_type: CONTENT_STREAM,
                size: plaintext.len(),
                limit: chunk_limit,
            });
        }

        bundle
            .outbound_plaintext_tx
            .send(plaintext)
            .map_err(|_| TransportError::DataChannelNotOpen(hub_id.clone()))
    }

    /// Send an already-JSON-encoded control payload directly, bypassing
    /// the subscription router (no `subscribed` confirmation is waited
    /// on; the hub is expected to already know how to route it).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't connected.
    pub async fn send_raw(&self, hub_id: &HubId, message: &serde_json::Value) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        let json = serde_json::to_vec(message).map_err(|e| TransportError::EncryptionFailed(e.to_string()))?;
        let frame = DataChannelCodec::encode_control(&json);
        bundle
            .outbound_plaintext_tx
            .send(frame)
            .map_err(|_| TransportError::DataChannelNotOpen(hub_id.clone()))
    }

    /// Send an already Olm-sealed binary frame straight to the
    /// DataChannel, skipping the codec and the manager's own encryption
    /// pipeline entirely. Used for caller-managed handshake traffic that
    /// doesn't fit the `CONTENT_*` envelope (e.g. a subscribe's
    /// pre-encrypted frame sent through a path other than `subscribe`).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` isn't connected.
    pub async fn send_encrypted(&self, hub_id: &HubId, bytes: &[u8]) -> Result<(), TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs
            .get(hub_id)
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        bundle.peer.send(bytes).await
    }

    /// Snapshot the peer connection and DataChannel liveness for
    /// `hub_id` without tearing anything down.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if `hub_id` has never
    /// had a peer connection negotiated.
    pub async fn probe_peer_health(&self, hub_id: &HubId) -> Result<PeerHealthSnapshot, TransportError> {
        let hubs = self.hubs.read().await;
        let record = hubs.get(hub_id).ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;
        let bundle = record
            .peer_bundle
            .as_ref()
            .ok_or_else(|| TransportError::DataChannelNotOpen(hub_id.clone()))?;

        let alive = !bundle.peer.is_dead().await;
        let pc_state = bundle.peer.state().await;
        let dc_state = if bundle.peer.data_channel_open().await {
            DataChannelState::Open
        } else {
            DataChannelState::Closed
        };
        Ok(PeerHealthSnapshot { alive, pc_state, dc_state })
    }

    /// Defer teardown of `hub_id` by the configured grace period instead
    /// of closing immediately — cancelled by a subsequent `connect` for
    /// the same hub within the window.
    pub async fn disconnect(self: &Arc<Self>, hub_id: &HubId) {
        let hubs = self.hubs.read().await;
        if let Some(record) = hubs.get(hub_id) {
            record.signaling.disconnect().await;
            if let Some(bundle) = &record.peer_bundle {
                bundle.peer.start_grace_period(self.config.grace_period);
            }
        }
    }

    /// Close just the peer connection for `hub_id`, leaving its
    /// signaling subscription intact — distinct from [`Self::disconnect`],
    /// which tears down both.
    pub async fn disconnect_peer(&self, hub_id: &HubId) {
        let mut hubs = self.hubs.write().await;
        if let Some(record) = hubs.get_mut(hub_id) {
            if let Some(bundle) = record.peer_bundle.take() {
                bundle.peer.close().await;
                bundle.stream_mux.close_all().await;
            }
        }
    }

    /// Close every peer immediately (page-unload-equivalent shutdown
    /// contract: close peers, not DataChannels individually, and in that
    /// order). A host calls this from its own lifecycle hook.
    pub async fn shutdown_all(&self) {
        let mut hubs = self.hubs.write().await;
        for (_, record) in hubs.drain() {
            if let Some(bundle) = record.peer_bundle {
                bundle.peer.close().await;
                bundle.stream_mux.close_all().await;
            }
            record.signaling.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_bridge::test_support::FakeCryptoBridge;

    #[tokio::test]
    async fn shutdown_all_on_empty_manager_is_a_no_op() {
        let manager = TransportManager::new(
            TransportConfig::new("https://hub.example.com", "key"),
            Arc::new(FakeCryptoBridge::default()),
        );
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn subscribe_without_connection_is_rejected() {
        let manager = TransportManager::new(
            TransportConfig::new("https://hub.example.com", "key"),
            Arc::new(FakeCryptoBridge::default()),
        );
        let result = manager
            .subscribe(
                &HubId::from("hub-1"),
                "sub-1",
                "terminal:agent-0:pty-0",
                serde_json::Value::Null,
                b"encrypted",
            )
            .await;
        assert!(matches!(result, Err(TransportError::DataChannelNotOpen(_))));
    }

    #[tokio::test]
    async fn subscribe_without_encrypted_frame_is_rejected_before_checking_connection() {
        let manager = TransportManager::new(
            TransportConfig::new("https://hub.example.com", "key"),
            Arc::new(FakeCryptoBridge::default()),
        );
        let result = manager
            .subscribe(&HubId::from("hub-1"), "sub-1", "terminal:agent-0:pty-0", serde_json::Value::Null, b"")
            .await;
        assert!(matches!(result, Err(TransportError::MissingEncryptedFrame)));
    }

    #[tokio::test]
    async fn probe_peer_health_on_unconnected_hub_is_rejected() {
        let manager = TransportManager::new(
            TransportConfig::new("https://hub.example.com", "key"),
            Arc::new(FakeCryptoBridge::default()),
        );
        let result = manager.probe_peer_health(&HubId::from("hub-1")).await;
        assert!(matches!(result, Err(TransportError::DataChannelNotOpen(_))));
    }

    #[tokio::test]
    async fn disconnect_peer_on_unknown_hub_is_a_no_op() {
        let manager = TransportManager::new(
            TransportConfig::new("https://hub.example.com", "key"),
            Arc::new(FakeCryptoBridge::default()),
        );
        manager.disconnect_peer(&HubId::from("hub-1")).await;
    }
}
