use courier_core::{KeySource, Payload};
use courier_services::{Delivery, MemoryBroker, RouteOptions, SendOptions, Transport};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Recovery — broker restarts and abandoned transfers
// ══════════════════════════════════════════════════════════════════════════════

/// A broker restart wipes subscriptions; the dispatch loop renews them on
/// the next `Connected` event and traffic flows again.
#[tokio::test]
async fn test_resubscribe_after_broker_restart() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("upload", handler, RouteOptions::file())?;
        Ok(())
    })
    .await;
    let tx = sender(&broker, config(40_000), KeySource::none()).await;

    broker.drop_subscriptions();
    tx.send_text("upload", "lost", &SendOptions::default()).unwrap();
    assert_quiet(&mut inbox).await;

    broker.reconnect_all();
    assert!(
        eventually(|| broker.subscriptions().len() == 2).await,
        "routes were not re-subscribed: {:?}",
        broker.subscriptions()
    );

    tx.send_text("upload", "back", &SendOptions::default()).unwrap();
    match next(&mut inbox).await.1 {
        Delivery::Message(m) => assert_eq!(m.payload, Payload::Text("back".into())),
        other => panic!("expected text, got {other:?}"),
    }
    node.stop().await;
}

/// Orphaned file bytes are evicted once the TTL passes, so late metadata
/// does not complete a transfer.
#[tokio::test]
async fn test_orphaned_bytes_are_reaped() {
    let mut cfg = config(40_000);
    cfg.correlation.ttl_secs = 0;
    cfg.correlation.reap_interval_secs = 1;

    let capture = MemoryBroker::new();
    let tx = sender(&capture, cfg.clone(), KeySource::none()).await;
    tx.send_file("upload", "orphan.bin", b"nobody claims me", &SendOptions::default())
        .unwrap();
    let frames = capture.published();

    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, cfg, KeySource::none(), move |c| {
        c.register_route("upload", handler, RouteOptions::file())
    })
    .await;

    let injector = broker.transport();
    injector.connect("localhost", 1883).unwrap();
    injector.publish(&frames[1].0, frames[1].1.clone()).unwrap();

    let mut reaped = false;
    for _ in 0..30 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mut pending = 0;
        for route in node.client.routes() {
            if let Some(files) = route.files() {
                pending += files.in_progress().await.len();
            }
        }
        if pending == 0 {
            reaped = true;
            break;
        }
    }
    assert!(reaped, "orphaned bytes were never evicted");

    injector.publish(&frames[0].0, frames[0].1.clone()).unwrap();
    assert_quiet(&mut inbox).await;
    node.stop().await;
}

/// Stopping and restarting the dispatch loop keeps routes and the connection.
#[tokio::test]
async fn test_run_can_restart() {
    let broker = MemoryBroker::new();
    let (handler, mut inbox) = collector();
    let node = Node::spawn(&broker, config(40_000), KeySource::none(), move |c| {
        c.register_route("chat", handler, RouteOptions::default())
    })
    .await;
    let client = node.client.clone();
    node.stop().await;
    assert!(client.is_connected());

    let tx = sender(&broker, config(40_000), KeySource::none()).await;
    tx.send_text("chat", "queued while stopped", &SendOptions::default())
        .unwrap();

    let (stop, signal) = tokio::sync::oneshot::channel::<()>();
    let runner = client.clone();
    let task = tokio::spawn(async move {
        runner
            .run(async {
                let _ = signal.await;
            })
            .await
    });

    match next(&mut inbox).await.1 {
        Delivery::Message(m) => {
            assert_eq!(m.payload, Payload::Text("queued while stopped".into()))
        }
        other => panic!("expected text, got {other:?}"),
    }
    let _ = stop.send(());
    task.await.unwrap().unwrap();
}
