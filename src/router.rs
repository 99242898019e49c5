//! Subscription router: named logical channels riding inside
//! `CONTENT_MSG` control frames.
//!
//! A host subscribes to a logical channel (terminal output, file
//! listings, preview metadata) by name; the hub confirms or rejects the
//! subscription, and from then on tagged `data` messages for that
//! subscription id are delivered to the host. PTY I/O bypasses this
//! router entirely — it rides the `CONTENT_PTY` content type directly,
//! the "fast lane" that skips JSON parsing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::TransportError;
use crate::SubscriptionId;

/// Control-message vocabulary carried inside `CONTENT_MSG` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Host -> hub: subscribe to a named logical channel.
    Subscribe {
        /// Caller-supplied or generator-allocated subscription id.
        subscription_id: String,
        /// Logical channel name (e.g. `"terminal:agent-0:pty-0"`).
        channel: String,
        /// Opaque, channel-specific parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Host -> hub: drop a subscription.
    Unsubscribe {
        /// The subscription to drop.
        subscription_id: String,
    },
    /// Hub -> host: the subscription is active.
    Subscribed {
        /// The subscription that was confirmed.
        subscription_id: String,
    },
    /// Hub -> host: the subscription was refused.
    Rejected {
        /// The subscription that was refused.
        subscription_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Bidirectional: an application payload addressed to a subscription.
    Data {
        /// The subscription this payload is for.
        subscription_id: String,
        /// Arbitrary JSON payload.
        payload: serde_json::Value,
    },
    /// Hub -> host: a hub-defined status broadcast, delivered to every
    /// currently active subscription rather than one addressee. This is
    /// the DataChannel fallback path for liveness/mode hints that
    /// normally ride the signaling channel.
    Health {
        /// Hub-defined status payload.
        status: serde_json::Value,
    },
}

struct PendingConfirmation {
    tx: oneshot::Sender<Result<(), TransportError>>,
}

/// A live subscription: messages delivered through it arrive via `recv`.
pub struct SubscriptionHandle {
    subscription_id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl SubscriptionHandle {
    /// The id this handle was confirmed under.
    #[must_use]
    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription_id
    }

    /// Receive the next message addressed to this subscription.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

/// Default timeout a `subscribe` call waits for a `subscribed` confirmation.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes named logical channels over the `CONTENT_MSG` content type.
#[derive(Clone)]
pub struct SubscriptionRouter {
    pending: Arc<Mutex<HashMap<String, PendingConfirmation>>>,
    active: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<serde_json::Value>>>>,
    send: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRouter").finish_non_exhaustive()
    }
}

impl SubscriptionRouter {
    /// Create a router that writes outbound control JSON to `send`
    /// (already wired to `DataChannelCodec::encode_control` + encryption
    /// + the DataChannel).
    #[must_use]
    pub fn new(send: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            send,
        }
    }

    /// Subscribe to `channel` under `subscription_id`, waiting up to
    /// `timeout` for confirmation.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SubscriptionTimeout` if no confirmation
    /// arrives in time, or `TransportError::SubscriptionRejected` if the
    /// hub rejects it.
    pub async fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        channel: impl Into<String>,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<SubscriptionHandle, TransportError> {
        let subscription_id = subscription_id.into();
        let channel = channel.into();

        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        self.pending
            .lock()
            .await
            .insert(subscription_id.clone(), PendingConfirmation { tx: confirm_tx });
        self.active.lock().await.insert(subscription_id.clone(), data_tx);

        let message = ControlMessage::Subscribe {
            subscription_id: subscription_id.clone(),
            channel,
            params,
        };
        let json = serde_json::to_vec(&message).expect("control message serializes");
        self.send
            .send(json)
            .map_err(|_| TransportError::SubscriptionRejected("data channel closed".to_string()))?;

        match tokio::time::timeout(timeout, confirm_rx).await {
            Ok(Ok(Ok(()))) => Ok(SubscriptionHandle {
                subscription_id: SubscriptionId::from(subscription_id),
                rx: data_rx,
            }),
            Ok(Ok(Err(e))) => {
                self.active.lock().await.remove(&subscription_id);
                Err(e)
            }
            Ok(Err(_)) => {
                self.active.lock().await.remove(&subscription_id);
                Err(TransportError::SubscriptionTimeout(subscription_id))
            }
            Err(_) => {
                self.pending.lock().await.remove(&subscription_id);
                self.active.lock().await.remove(&subscription_id);
                Err(TransportError::SubscriptionTimeout(subscription_id))
            }
        }
    }

    /// Ask the hub to drop a subscription and stop routing its messages.
    pub async fn unsubscribe(&self, subscription_id: &SubscriptionId) {
        self.active.lock().await.remove(subscription_id.as_ref());
        let message = ControlMessage::Unsubscribe {
            subscription_id: subscription_id.to_string(),
        };
        if let Ok(json) = serde_json::to_vec(&message) {
            let _ = self.send.send(json);
        }
    }

    /// Dispatch an inbound `CONTENT_MSG` control message.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownContentType` if `bytes` is not
    /// valid control-message JSON (the content type byte itself is
    /// already stripped by the caller).
    pub async fn handle_incoming(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let message: ControlMessage =
            serde_json::from_slice(bytes).map_err(|_| TransportError::UnknownContentType(0x00))?;

        match message {
            ControlMessage::Subscribed { subscription_id } => {
                if let Some(pending) = self.pending.lock().await.remove(&subscription_id) {
                    let _ = pending.tx.send(Ok(()));
                }
            }
            ControlMessage::Rejected { subscription_id, reason } => {
                if let Some(pending) = self.pending.lock().await.remove(&subscription_id) {
                    let _ = pending.tx.send(Err(TransportError::SubscriptionRejected(reason)));
                }
            }
            ControlMessage::Data { subscription_id, payload } => {
                if let Some(tx) = self.active.lock().await.get(&subscription_id) {
                    let _ = tx.send(payload);
                }
            }
            ControlMessage::Health { status } => {
                for tx in self.active.lock().await.values() {
                    let _ = tx.send(status.clone());
                }
            }
            ControlMessage::Subscribe { .. } | ControlMessage::Unsubscribe { .. } => {
                // Hub-originated subscribe/unsubscribe has no meaning on
                // this side; the host never receives these, only sends them.
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_resolves_on_confirmation() {
        let (send, mut send_rx) = mpsc::unbounded_channel();
        let router = SubscriptionRouter::new(send);

        let router2 = router.clone();
        let subscriber = tokio::spawn(async move {
            router2
                .subscribe(
                    "sub-1",
                    "terminal:agent-0:pty-0",
                    serde_json::json!({"cols": 80}),
                    Duration::from_secs(1),
                )
                .await
        });

        let sent = send_rx.recv().await.expect("subscribe sent");
        let parsed: ControlMessage = serde_json::from_slice(&sent).expect("parses");
        match parsed {
            ControlMessage::Subscribe { subscription_id, params, .. } => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(params, serde_json::json!({"cols": 80}));
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        router
            .handle_incoming(
                &serde_json::to_vec(&ControlMessage::Subscribed {
                    subscription_id: "sub-1".to_string(),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let handle = subscriber.await.unwrap().expect("confirmed");
        assert_eq!(handle.subscription_id().as_ref(), "sub-1");
    }

    #[tokio::test]
    async fn subscribe_fails_on_rejection() {
        let (send, mut send_rx) = mpsc::unbounded_channel();
        let router = SubscriptionRouter::new(send);

        let router2 = router.clone();
        let subscriber = tokio::spawn(async move {
            router2
                .subscribe("sub-2", "files:root", serde_json::Value::Null, Duration::from_secs(1))
                .await
        });

        send_rx.recv().await.expect("subscribe sent");
        router
            .handle_incoming(
                &serde_json::to_vec(&ControlMessage::Rejected {
                    subscription_id: "sub-2".to_string(),
                    reason: "not found".to_string(),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let result = subscriber.await.unwrap();
        assert!(matches!(result, Err(TransportError::SubscriptionRejected(_))));
    }

    #[tokio::test]
    async fn subscribe_times_out_without_confirmation() {
        let (send, _send_rx) = mpsc::unbounded_channel();
        let router = SubscriptionRouter::new(send);
        let result = router
            .subscribe("sub-3", "files:root", serde_json::Value::Null, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::SubscriptionTimeout(_))));
    }

    #[tokio::test]
    async fn data_routes_to_confirmed_subscription() {
        let (send, mut send_rx) = mpsc::unbounded_channel();
        let router = SubscriptionRouter::new(send);

        let router2 = router.clone();
        let subscriber = tokio::spawn(async move {
            router2
                .subscribe(
                    "sub-4",
                    "terminal:agent-0:pty-0",
                    serde_json::Value::Null,
                    Duration::from_secs(1),
                )
                .await
        });
        send_rx.recv().await.expect("subscribe sent");
        router
            .handle_incoming(
                &serde_json::to_vec(&ControlMessage::Subscribed {
                    subscription_id: "sub-4".to_string(),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        let mut handle = subscriber.await.unwrap().unwrap();

        router
            .handle_incoming(
                &serde_json::to_vec(&ControlMessage::Data {
                    subscription_id: "sub-4".to_string(),
                    payload: serde_json::json!({"bytes": "aGVsbG8="}),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let message = handle.recv().await.expect("message delivered");
        assert_eq!(message["bytes"], "aGVsbG8=");
    }
}
