use courier_core::KeySource;
use courier_services::topic::file_topic;
use courier_services::{Delivery, MemoryBroker, RouteOptions, SendOptions, Transport};
use serde_json::json;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  File transfer — metadata and bytes on sibling topics
// ══════════════════════════════════════════════════════════════════════════════

/// A 5000-byte file goes out as one metadata envelope on `upload` and one
/// raw publish on `upload/file`; the handler fires exactly once.
#[tokio::test]
async fn test_photo_upload_end_to_end() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("upload", handler, RouteOptions::file())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    let photo: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let published = tx
        .send_file("upload", "photo.bin", &photo, &SendOptions::default())
        .unwrap();
    assert_eq!(published, 2);
    assert_eq!(broker.published_on("upload").len(), 1);
    let raw = broker.published_on("upload/file");
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].as_ref(), photo.as_slice());

    let (topic, delivery) = next(&mut inbox).await;
    assert_eq!(topic, "upload");
    match delivery {
        Delivery::File(file) => {
            assert_eq!(file.filename, "photo.bin");
            assert_eq!(file.sender, tx.origin_id());
            assert_eq!(file.bytes.len(), 5000);
            assert_eq!(file.bytes.as_ref(), photo.as_slice());
        }
        other => panic!("expected a file, got {other:?}"),
    }
    assert_quiet(&mut inbox).await;

    for route in node.client.routes() {
        if let Some(files) = route.files() {
            assert!(files.in_progress().await.is_empty());
        }
    }
    node.stop().await;
}

/// Bytes that beat their metadata to the receiver are held until the
/// metadata shows up, then delivered once.
#[tokio::test]
async fn test_bytes_before_metadata() {
    // Capture a real file send on a private broker.
    let capture = MemoryBroker::new();
    let tx = sender(&capture, config(40_000), KeySource::none()).await;
    tx.send_file("upload", "late.txt", b"arrived early", &SendOptions::default())
        .unwrap();
    let frames = capture.published();
    assert_eq!(frames[1].0, file_topic("upload"));

    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("upload", handler, RouteOptions::file())
    })
    .await;

    let injector = broker.transport();
    injector.connect("localhost", 1883).unwrap();
    injector.publish(&frames[1].0, frames[1].1.clone()).unwrap();
    assert_quiet(&mut inbox).await;

    injector.publish(&frames[0].0, frames[0].1.clone()).unwrap();
    match next(&mut inbox).await.1 {
        Delivery::File(file) => {
            assert_eq!(file.filename, "late.txt");
            assert_eq!(file.bytes.as_ref(), b"arrived early");
        }
        other => panic!("expected a file, got {other:?}"),
    }
    assert_quiet(&mut inbox).await;
    node.stop().await;
}

/// Caller-supplied metadata fields travel with the file.
#[tokio::test]
async fn test_file_extra_metadata() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("docs", handler, RouteOptions::file())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    let mut options = SendOptions::default();
    options.extra.insert("album".into(), json!("summer"));
    options.extra.insert("rating".into(), json!(5));
    tx.send_file("docs", "notes.md", b"# notes", &options).unwrap();

    match next(&mut inbox).await.1 {
        Delivery::File(file) => {
            assert_eq!(file.extra["album"], json!("summer"));
            assert_eq!(file.extra["rating"], json!(5));
        }
        other => panic!("expected a file, got {other:?}"),
    }
    node.stop().await;
}

/// Sending from disk uses the file's own name.
#[tokio::test]
async fn test_send_file_from_path() {
    let dir = std::env::temp_dir().join(format!("courier-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("report.csv");
    std::fs::write(&path, "a,b\n1,2\n").unwrap();

    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("reports", handler, RouteOptions::file())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    tx.send_file_from_path("reports", &path, &SendOptions::default())
        .await
        .unwrap();

    match next(&mut inbox).await.1 {
        Delivery::File(file) => {
            assert_eq!(file.filename, "report.csv");
            assert_eq!(file.bytes.as_ref(), b"a,b\n1,2\n");
        }
        other => panic!("expected a file, got {other:?}"),
    }

    let missing = tx
        .send_file_from_path("reports", &dir.join("nope.bin"), &SendOptions::default())
        .await;
    assert!(matches!(missing, Err(ClientError::Io { .. })));

    std::fs::remove_dir_all(&dir).ok();
    node.stop().await;
}

/// A file over the configured limit is refused without publishing.
#[tokio::test]
async fn test_file_too_large() {
    let broker = MemoryBroker::new();
    let mut cfg = config(40_000);
    cfg.fragmentation.max_file_bytes = 1024;
    let tx = sender(&broker, cfg, KeySource::none()).await;

    let err = tx
        .send_file("upload", "big.bin", &[0u8; 1025], &SendOptions::default())
        .unwrap_err();
    assert!(err.is_oversize());
    assert!(broker.published().is_empty());
}
