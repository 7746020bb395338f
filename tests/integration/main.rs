//! Courier integration test harness.
//!
//! Every test runs two or more clients against one in-process
//! `MemoryBroker`: a sender that publishes through the public API and a
//! receiver whose dispatch loop runs on a spawned task, exactly as an
//! embedding application would run it.
//!
//!   cargo test --test integration
//!
//! Each test owns its broker, so tests never observe each other's traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier_core::{CourierConfig, KeySource};
use courier_services::{Client, ClientError, Delivery, MemoryBroker, RouteHandler};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

mod files;
mod messaging;
mod recovery;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long to wait for a delivery before failing.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to watch for a delivery that must not happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

pub type Inbox = mpsc::UnboundedReceiver<(String, Delivery)>;

/// Default config with a given fragment budget.
pub fn config(max_message_length: usize) -> CourierConfig {
    let mut config = CourierConfig::default();
    config.fragmentation.max_message_length = max_message_length;
    config
}

/// A handler that forwards every delivery into an inbox.
pub fn collector() -> (impl RouteHandler + 'static, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |topic: &str, delivery: Delivery| -> Result<()> {
        tx.send((topic.to_string(), delivery))?;
        Ok(())
    };
    (handler, rx)
}

/// A connected client used only to publish.
pub async fn sender(broker: &MemoryBroker, config: CourierConfig, keys: KeySource) -> Client {
    let client = Client::new(config, Arc::new(broker.transport()), keys)
        .expect("sender config should be valid");
    client.connect().await.expect("sender should connect");
    client
}

/// A receiving client whose dispatch loop runs until `stop`.
pub struct Node {
    pub client: Arc<Client>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl Node {
    /// Build a client, let `setup` register routes, connect, then spawn `run`.
    pub async fn spawn(
        broker: &MemoryBroker,
        config: CourierConfig,
        keys: KeySource,
        setup: impl FnOnce(&mut Client) -> Result<(), ClientError>,
    ) -> Self {
        let mut client = Client::new(config, Arc::new(broker.transport()), keys)
            .expect("receiver config should be valid");
        setup(&mut client).expect("routes should register");
        client.connect().await.expect("receiver should connect");

        let client = Arc::new(client);
        let (shutdown, signal) = oneshot::channel::<()>();
        let runner = client.clone();
        let task = tokio::spawn(async move {
            runner
                .run(async {
                    let _ = signal.await;
                })
                .await
        });

        Self {
            client,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .expect("dispatch task panicked")
            .expect("dispatch loop failed");
    }
}

/// Wait for the next delivery.
pub async fn next(inbox: &mut Inbox) -> (String, Delivery) {
    tokio::time::timeout(DELIVERY_TIMEOUT, inbox.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler channel closed")
}

/// Assert nothing is delivered for a short while.
pub async fn assert_quiet(inbox: &mut Inbox) {
    if let Ok(Some((topic, delivery))) = tokio::time::timeout(QUIET_PERIOD, inbox.recv()).await {
        panic!("unexpected delivery on {topic}: {delivery:?}");
    }
}

/// Poll `check` until it holds or the delivery timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
