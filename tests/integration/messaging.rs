use bytes::Bytes;
use courier_core::{Envelope, KeySource, Payload};
use courier_services::{Delivery, MemoryBroker, RouteOptions, SendOptions, Transport};
use serde_json::json;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Messaging — text and JSON batches
// ══════════════════════════════════════════════════════════════════════════════

fn message(delivery: Delivery) -> courier_services::Message {
    match delivery {
        Delivery::Message(m) => m,
        other => panic!("expected a decoded message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_short_text() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("chat", handler, RouteOptions::default())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    assert_eq!(tx.send_text("chat", "hola", &SendOptions::default()).unwrap(), 1);

    let (topic, delivery) = next(&mut inbox).await;
    assert_eq!(topic, "chat");
    let m = message(delivery);
    assert_eq!(m.payload, Payload::Text("hola".into()));
    assert_eq!(m.origin_id, tx.origin_id());
    assert!(!m.is_error);
    node.stop().await;
}

/// Three objects under a 20-byte budget: `[{"a":1},{"a":2}]` is 17 bytes,
/// adding the third makes 25, so the batch splits 2 + 1.
#[tokio::test]
async fn test_json_batch_split_under_budget() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(20), KeySource::none(), move |c| {
        c.register_route("metrics", handler, RouteOptions::default())
    })
    .await;
    let tx = sender(&broker, config(20), KeySource::none()).await;

    let objects = [json!({"a": 1}), json!({"a": 2}), json!({"a": 3})];
    let published = tx
        .send_json_batch("metrics", &objects, &SendOptions::default())
        .unwrap();
    assert_eq!(published, 2);

    for frame in broker.published_on("metrics") {
        let env: Envelope = serde_json::from_slice(&frame).unwrap();
        assert!(serde_json::to_string(&env.data).unwrap().len() < 20);
        assert_eq!(env.total_fragments, 2);
    }

    let first = message(next(&mut inbox).await.1);
    let second = message(next(&mut inbox).await.1);
    assert_eq!(first.payload, Payload::Json(vec![json!({"a": 1}), json!({"a": 2})]));
    assert_eq!(second.payload, Payload::Json(vec![json!({"a": 3})]));
    assert_eq!(first.seq, second.seq);
    node.stop().await;
}

/// A text longer than the budget is chunked on the wire and delivered whole.
#[tokio::test]
async fn test_long_text_reassembled() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(16), KeySource::none(), move |c| {
        c.register_route("chat", handler, RouteOptions::default())
    })
    .await;
    let tx = sender(&broker, config(16), KeySource::none()).await;

    let text = "El veloz murciélago hindú comía feliz cardillo y kiwi.";
    let published = tx.send_text("chat", text, &SendOptions::default()).unwrap();
    assert_eq!(published, 4);
    for frame in broker.published_on("chat") {
        let env: Envelope = serde_json::from_slice(&frame).unwrap();
        let chunk = env.data.as_str().unwrap();
        assert!(chunk.len() <= 16, "{chunk:?} is over the 16-byte budget");
    }

    let m = message(next(&mut inbox).await.1);
    assert_eq!(m.payload, Payload::Text(text.into()));
    assert_quiet(&mut inbox).await;
    node.stop().await;
}

/// Base64 text keeps its flag across fragments and is decoded on arrival.
#[tokio::test]
async fn test_base64_error_text() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(12), KeySource::none(), move |c| {
        c.register_route("errors", handler, RouteOptions::default())
    })
    .await;
    let tx = sender(&broker, config(12), KeySource::none()).await;

    let options = SendOptions {
        encode_base64: true,
        is_error: true,
        ..Default::default()
    };
    tx.send_text("errors", "disk full on /var", &options).unwrap();
    for frame in broker.published_on("errors") {
        let env: Envelope = serde_json::from_slice(&frame).unwrap();
        assert!(env.is_base64 && env.is_error);
    }

    let m = message(next(&mut inbox).await.1);
    assert_eq!(m.payload, Payload::Text("disk full on /var".into()));
    assert!(m.is_error);
    node.stop().await;
}

/// Wildcard routes receive every matching concrete topic.
#[tokio::test]
async fn test_wildcard_route() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("sensors/#", handler, RouteOptions::default())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    tx.send_json_batch("sensors/kitchen/temp", &[json!({"c": 21})], &SendOptions::default())
        .unwrap();
    tx.send_json_batch("other/topic", &[json!({"c": 0})], &SendOptions::default())
        .unwrap();

    let (topic, delivery) = next(&mut inbox).await;
    assert_eq!(topic, "sensors/kitchen/temp");
    assert_eq!(message(delivery).payload, Payload::Json(vec![json!({"c": 21})]));
    assert_quiet(&mut inbox).await;
    node.stop().await;
}

/// Routes that opt out of decoding see the publish bytes as-is.
#[tokio::test]
async fn test_raw_route() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("telemetry", handler, RouteOptions::raw())
    })
    .await;

    let injector = broker.transport();
    injector.connect("localhost", 1883).unwrap();
    injector
        .publish("telemetry", Bytes::from_static(b"\x01\x02 not an envelope"))
        .unwrap();

    match next(&mut inbox).await.1 {
        Delivery::Raw(bytes) => assert_eq!(bytes.as_ref(), b"\x01\x02 not an envelope"),
        other => panic!("expected raw bytes, got {other:?}"),
    }
    node.stop().await;
}

/// Garbage on a decoding route is dropped; the loop keeps going.
#[tokio::test]
async fn test_malformed_envelope_dropped() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("chat", handler, RouteOptions::default())
    })
    .await;

    let injector = broker.transport();
    injector.connect("localhost", 1883).unwrap();
    injector.publish("chat", Bytes::from_static(b"{not json")).unwrap();
    injector
        .publish(
            "chat",
            Bytes::from(
                serde_json::to_vec(&json!({
                    "data": "x", "seq": 0, "sequenceIndex": 3, "totalFragments": 1,
                    "isLastFragment": true, "payloadKind": "text", "isEncrypted": false,
                    "originId": "rogue"
                }))
                .unwrap(),
            ),
        )
        .unwrap();
    assert_quiet(&mut inbox).await;

    let tx = sender(&broker, config(40_000), KeySource::none()).await;
    tx.send_text("chat", "still alive", &SendOptions::default()).unwrap();
    assert_eq!(
        message(next(&mut inbox).await.1).payload,
        Payload::Text("still alive".into())
    );
    node.stop().await;
}
