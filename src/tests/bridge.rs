use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::bridge::BridgeEnd;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::protocol::{Message, MessageKind};

fn pair() -> (BridgeEnd, BridgeEnd) {
    BridgeEnd::pair(&BridgeConfig::default())
}

#[tokio::test]
async fn should_deliver_messages_in_send_order() {
    let (host, view) = pair();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_clone = seen.clone();
    view.on(MessageKind::ThemeChanged, move |payload| {
        let seen = seen_clone.clone();
        async move {
            seen.lock().push(payload.unwrap_or(Value::Null));
            Ok(None)
        }
    });

    for i in 0..5 {
        host.send(Message::opaque(MessageKind::ThemeChanged, json!(i)))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock();
    assert_eq!(*seen, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn should_correlate_request_with_response() {
    let (host, view) = pair();
    host.on(MessageKind::ReadFile, |payload| async move {
        let name = payload
            .and_then(|value| value.get("name").cloned())
            .unwrap_or(Value::Null);
        Ok(Some(json!({ "greeting": format!("hello {name}") })))
    });

    let response = view
        .request(MessageKind::ReadFile, &json!({ "name": "tern" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response["greeting"], json!("hello \"tern\""));
}

#[tokio::test]
async fn should_turn_handler_failure_into_error_response() {
    let (host, view) = pair();
    host.on(MessageKind::ReadFile, |_| async move {
        Err("the disk is on fire".to_string())
    });

    let err = view
        .request(MessageKind::ReadFile, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Rejected { message } if message.contains("on fire")));

    // The bridge survives a failing handler
    host.on(MessageKind::ReadFile, |_| async move { Ok(Some(json!(1))) });
    assert!(view.request(MessageKind::ReadFile, &json!({})).await.is_ok());
}

#[tokio::test]
async fn should_fail_closed_on_unhandled_kind() {
    let (_host, view) = pair();
    let err = view
        .request(MessageKind::WriteFile, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Rejected { message } if message.contains("no handler")));
}

#[tokio::test]
async fn should_replace_handler_on_second_registration() {
    let (host, view) = pair();
    host.on(MessageKind::ReadFile, |_| async move {
        Ok(Some(json!("first")))
    });
    host.on(MessageKind::ReadFile, |_| async move {
        Ok(Some(json!("second")))
    });

    let response = view
        .request(MessageKind::ReadFile, &json!({}))
        .await
        .unwrap();
    assert_eq!(response, Some(json!("second")));
}

#[tokio::test]
async fn should_fail_send_when_peer_is_gone() {
    let (host, view) = pair();
    drop(view);
    // Give the peer's pump a moment to notice and tear down
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = host
        .send(Message::opaque(MessageKind::ThemeChanged, json!(null)))
        .unwrap_err();
    assert!(matches!(err, BridgeError::NoPeer));
}

#[tokio::test]
async fn should_fail_pending_request_when_peer_disconnects() {
    let (host, view) = pair();
    // The request goes out before the view's pump ever runs; the view then
    // disappears without answering
    let payload = json!({});
    let request = host.request(MessageKind::ReadFile, &payload);
    let ((), result) = tokio::join!(
        async move {
            drop(view);
        },
        request
    );
    let err = result.unwrap_err();
    assert!(matches!(err, BridgeError::PeerGone | BridgeError::NoPeer));
}

#[tokio::test(start_paused = true)]
async fn should_time_out_unanswered_request() {
    let (host, view) = BridgeEnd::pair(&BridgeConfig {
        request_timeout_ms: 1000,
    });
    view.on(MessageKind::ReadFile, |_| async move {
        // Far slower than the requester is willing to wait
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    });

    let err = host
        .request(MessageKind::ReadFile, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::PeerTimeout { timeout_ms: 1000, .. }));
}

#[tokio::test]
async fn should_unregister_handler_with_off() {
    let (host, view) = pair();
    host.on(MessageKind::ReadFile, |_| async move { Ok(Some(json!(1))) });
    assert!(host.off(MessageKind::ReadFile));
    assert!(!host.off(MessageKind::ReadFile));

    let err = view
        .request(MessageKind::ReadFile, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Rejected { .. }));
}

#[tokio::test]
async fn should_round_trip_message_wire_format() {
    let message = Message::opaque(MessageKind::FileUpdate, json!({ "path": "/a.md" }));
    let encoded = serde_json::to_value(&message).unwrap();
    assert_eq!(encoded["kind"], json!("file-update"));
    // Absent fields stay off the wire entirely
    assert!(encoded.get("correlation_id").is_none());
    assert!(encoded.get("reply").is_none());

    let decoded: Message = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded.kind, MessageKind::FileUpdate);
    assert!(!decoded.reply);

    // An unknown kind must fail to decode: the protocol is a closed set
    let bogus = json!({ "kind": "install-malware", "payload": null });
    assert!(serde_json::from_value::<Message>(bogus).is_err());
}
