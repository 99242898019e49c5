//! Subscription lifecycle scenarios driven through the public router API:
//! confirm, reject, data delivery, and the `health` broadcast fan-out.

use std::time::Duration;

use relay_transport::router::{ControlMessage, SubscriptionRouter};
use relay_transport::TransportError;
use tokio::sync::mpsc;

#[tokio::test]
async fn subscribe_carries_params_and_resolves_on_confirmation() {
    let (send, mut send_rx) = mpsc::unbounded_channel();
    let router = SubscriptionRouter::new(send);

    let router2 = router.clone();
    let subscriber = tokio::spawn(async move {
        router2
            .subscribe("sub-1", "files:root", serde_json::Value::Null, Duration::from_secs(1))
            .await
    });

    let sent = send_rx.recv().await.expect("subscribe sent");
    let parsed: ControlMessage = serde_json::from_slice(&sent).expect("parses");
    match parsed {
        ControlMessage::Subscribe {
            subscription_id,
            channel,
            params,
        } => {
            assert_eq!(subscription_id, "sub-1");
            assert_eq!(channel, "files:root");
            assert!(params.is_null());
        }
        other => panic!("unexpected message: {other:?}"),
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

/// A `health` control message is not addressed to one subscription; it
/// must be broadcast to every currently active one.
#[tokio::test]
async fn health_broadcasts_to_every_active_subscription() {
    let (send, mut send_rx) = mpsc::unbounded_channel();
    let router = SubscriptionRouter::new(send);

    let router_a = router.clone();
    let router_b = router.clone();
    let subscriber_a = tokio::spawn(async move {
        router_a
            .subscribe("sub-a", "terminal:agent-0:pty-0", serde_json::Value::Null, Duration::from_secs(1))
            .await
    });
    send_rx.recv().await.expect("subscribe a sent");
    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Subscribed {
                subscription_id: "sub-a".to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let mut handle_a = subscriber_a.await.unwrap().unwrap();

    let subscriber_b = tokio::spawn(async move {
        router_b
            .subscribe("sub-b", "files:root", serde_json::Value::Null, Duration::from_secs(1))
            .await
    });
    send_rx.recv().await.expect("subscribe b sent");
    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Subscribed {
                subscription_id: "sub-b".to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let mut handle_b = subscriber_b.await.unwrap().unwrap();

    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Health {
                status: serde_json::json!({"state": "degraded"}),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let message_a = handle_a.recv().await.expect("health delivered to a");
    let message_b = handle_b.recv().await.expect("health delivered to b");
    assert_eq!(message_a["state"], "degraded");
    assert_eq!(message_b["state"], "degraded");
}

#[tokio::test]
async fn unsubscribe_sends_control_message_and_stops_routing() {
    let (send, mut send_rx) = mpsc::unbounded_channel();
    let router = SubscriptionRouter::new(send);

    let router2 = router.clone();
    let subscriber = tokio::spawn(async move {
        router2
            .subscribe("sub-x", "files:root", serde_json::Value::Null, Duration::from_secs(1))
            .await
    });
    send_rx.recv().await.expect("subscribe sent");
    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Subscribed {
                subscription_id: "sub-x".to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let handle = subscriber.await.unwrap().unwrap();

    router.unsubscribe(handle.subscription_id()).await;
    let sent = send_rx.recv().await.expect("unsubscribe sent");
    let parsed: ControlMessage = serde_json::from_slice(&sent).expect("parses");
    assert!(matches!(parsed, ControlMessage::Unsubscribe { subscription_id } if subscription_id == "sub-x"));

    // Data for a subscription that has been unsubscribed is silently dropped.
    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Data {
                subscription_id: "sub-x".to_string(),
                payload: serde_json::json!({"ignored": true}),
            })
            .unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_subscription_surfaces_the_reason() {
    let (send, mut send_rx) = mpsc::unbounded_channel();
    let router = SubscriptionRouter::new(send);

    let router2 = router.clone();
    let subscriber = tokio::spawn(async move {
        router2
            .subscribe("sub-y", "files:missing", serde_json::Value::Null, Duration::from_secs(1))
            .await
    });
    send_rx.recv().await.expect("subscribe sent");
    router
        .handle_incoming(
            &serde_json::to_vec(&ControlMessage::Rejected {
                subscription_id: "sub-y".to_string(),
                reason: "no such root".to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    match subscriber.await.unwrap() {
        Err(TransportError::SubscriptionRejected(reason)) => assert_eq!(reason, "no such root"),
        other => panic!("expected rejection, got {other:?}"),
    }
}
