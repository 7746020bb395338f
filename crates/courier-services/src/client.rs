//! Client: route registry, send API, and the inbound dispatch loop.
//!
//! Outbound: payload → codec (fragment, seal) → one publish per envelope.
//! Files add a second publish carrying the raw bytes on `{topic}/file`.
//!
//! Inbound: `run` drains the transport's event channel sequentially. Each
//! message is matched to the first registered route whose pattern covers the
//! topic, then decoded, reassembled or correlated as its kind requires, and
//! handed to the route's handler.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use courier_core::config::{ConfigError, CourierConfig};
use courier_core::crypto::{KeySource, SecretKey};
use courier_core::envelope::{
    self, Codec, CodecError, EncodeOptions, Envelope, Outbound, Payload, PayloadKind,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::file_transfer::Correlation;
use crate::route::{Delivery, Message, Route, RouteHandler, RouteOptions, TopicRole};
use crate::topic;
use crate::transport::{EventReceiver, Transport, TransportError, TransportEvent};

/// Per-send flags.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Encrypt. Sends on a locally registered secure route are always encrypted.
    ///
    /// For files the raw bytes are encrypted too and carry no marker, so the
    /// receiving route must also be registered secure or the transfer never
    /// correlates.
    pub secure: bool,
    /// Base64-encode text before fragmenting (text only).
    pub encode_base64: bool,
    pub is_error: bool,
    /// Extra metadata fields for file sends.
    pub extra: Map<String, Value>,
}

impl SendOptions {
    pub fn secure() -> Self {
        Self {
            secure: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// A secure operation with no usable key. Raised before any publish.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plaintext envelope rejected on secure topic {topic}")]
    InsecureEnvelope { topic: String },

    #[error("dispatch loop is already running")]
    AlreadyRunning,
}

impl ClientError {
    /// True if the payload did not fit the configured limits.
    pub fn is_oversize(&self) -> bool {
        matches!(self, ClientError::Codec(e) if e.is_oversize())
    }
}

pub struct Client {
    config: CourierConfig,
    transport: Arc<dyn Transport>,
    keys: KeySource,
    codec: Codec,
    routes: Vec<Route>,
    events: Mutex<Option<EventReceiver>>,
    connected: AtomicBool,
}

impl Client {
    /// Build a client. The config's static key, if any, backs up `keys`.
    pub fn new(
        config: CourierConfig,
        transport: Arc<dyn Transport>,
        keys: KeySource,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let keys = match config.encryption.static_key()? {
            Some(key) => keys.or_static(key),
            None => keys,
        };
        let codec = Codec::with_random_origin(config.fragmentation.clone());
        tracing::debug!(origin_id = codec.origin_id(), keys = ?keys, "client created");

        Ok(Self {
            config,
            transport,
            keys,
            codec,
            routes: Vec::new(),
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn origin_id(&self) -> &str {
        self.codec.origin_id()
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Wire topic for a route name.
    pub fn topic_for(&self, route: &str) -> String {
        self.config.routing.topic(route)
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    /// Bind `handler` to the route `name` (a topic pattern, wildcards allowed).
    ///
    /// Registering a name twice replaces the earlier route. If the client is
    /// already connected the new patterns are subscribed immediately.
    pub fn register_route(
        &mut self,
        name: &str,
        handler: impl RouteHandler + 'static,
        options: RouteOptions,
    ) -> Result<(), ClientError> {
        if options.secure && !self.keys.is_configured() {
            return Err(ClientError::Configuration(format!(
                "route {name} is secure but no key source is configured"
            )));
        }

        let route = Route::new(
            name,
            self.topic_for(name),
            Arc::new(handler),
            options,
            self.config.correlation.ttl(),
            self.config.fragmentation.max_fragments(),
        );

        if self.is_connected() {
            for pattern in route.subscriptions() {
                self.transport.subscribe(pattern)?;
            }
        }

        tracing::info!(
            route = name,
            topic = route.pattern(),
            is_file = options.is_file,
            secure = options.secure,
            decode = options.decode_json,
            "route registered"
        );

        if let Some(existing) = self.routes.iter_mut().find(|r| r.name() == name) {
            tracing::warn!(route = name, "replacing existing route");
            *existing = route;
        } else {
            self.routes.push(route);
        }
        Ok(())
    }

    // ── Connection ────────────────────────────────────────────────────────────

    /// Connect the transport and subscribe every registered route.
    /// Calling it again while connected does nothing.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut events = self.events.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let host = self.config.transport.host.as_str();
        let port = self.config.transport.port;
        let rx = self.transport.connect(host, port)?;
        *events = Some(rx);
        self.connected.store(true, Ordering::Release);

        self.subscribe_all()?;
        tracing::info!(
            host,
            port,
            origin_id = self.origin_id(),
            routes = self.routes.len(),
            "connected"
        );
        Ok(())
    }

    fn subscribe_all(&self) -> Result<(), TransportError> {
        for route in &self.routes {
            for pattern in route.subscriptions() {
                self.transport.subscribe(pattern)?;
                tracing::debug!(route = route.name(), pattern, "subscribed");
            }
        }
        Ok(())
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Send a text message. Returns the number of publishes.
    pub fn send_text(
        &self,
        route: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<usize, ClientError> {
        self.send_envelopes(route, Outbound::Text(text), options)
    }

    /// Send a batch of JSON objects, packed into as few envelopes as fit.
    pub fn send_json_batch(
        &self,
        route: &str,
        objects: &[Value],
        options: &SendOptions,
    ) -> Result<usize, ClientError> {
        self.send_envelopes(route, Outbound::Json(objects), options)
    }

    /// Send a file: metadata on the route topic, raw bytes on its `/file`
    /// sibling. Returns the number of publishes (always 2).
    pub fn send_file(
        &self,
        route: &str,
        filename: &str,
        bytes: &[u8],
        options: &SendOptions,
    ) -> Result<usize, ClientError> {
        let topic = self.topic_for(route);
        let key = self.send_key(&topic, options)?;

        let envelopes = self.codec.serialize(
            Outbound::File {
                bytes,
                filename,
                extra: &options.extra,
            },
            encode_options(options),
            key.as_ref(),
        )?;
        let body = match &key {
            Some(key) => Bytes::from(envelope::seal_file_bytes(key, bytes)?),
            None => Bytes::copy_from_slice(bytes),
        };
        let frames = encode_all(&envelopes)?;

        let file_topic = topic::file_topic(&topic);
        let mut published = 0;
        for frame in frames {
            self.transport.publish(&topic, frame)?;
            published += 1;
        }
        self.transport.publish(&file_topic, body)?;
        published += 1;

        tracing::debug!(
            topic = %topic,
            filename,
            bytes = bytes.len(),
            encrypted = key.is_some(),
            "file sent"
        );
        Ok(published)
    }

    /// Read `path` and send it under its file name.
    pub async fn send_file_from_path(
        &self,
        route: &str,
        path: &Path,
        options: &SendOptions,
    ) -> Result<usize, ClientError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.send_file(route, &filename, &bytes, options)
    }

    fn send_envelopes(
        &self,
        route: &str,
        payload: Outbound<'_>,
        options: &SendOptions,
    ) -> Result<usize, ClientError> {
        let topic = self.topic_for(route);
        let key = self.send_key(&topic, options)?;
        let envelopes = self
            .codec
            .serialize(payload, encode_options(options), key.as_ref())?;
        let frames = encode_all(&envelopes)?;

        let count = frames.len();
        for frame in frames {
            self.transport.publish(&topic, frame)?;
        }
        tracing::debug!(
            topic = %topic,
            kind = ?payload.kind(),
            fragments = count,
            encrypted = key.is_some(),
            "message sent"
        );
        Ok(count)
    }

    /// Key for an outbound publish on `topic`, or `None` for plaintext.
    fn send_key(&self, topic: &str, options: &SendOptions) -> Result<Option<SecretKey>, ClientError> {
        let route_is_secure = self
            .route_for(topic)
            .is_some_and(|(route, _)| route.options().secure);
        if !(options.secure || route_is_secure) {
            return Ok(None);
        }
        self.keys
            .resolve(topic)
            .map(Some)
            .ok_or_else(|| ClientError::Configuration(format!("no key resolves for topic {topic}")))
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Process inbound traffic until `shutdown` resolves.
    ///
    /// Connects first if needed. Re-subscribes on every `Connected` event and
    /// reaps stale correlation state on the configured interval.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ClientError> {
        self.connect().await?;
        let mut events = self
            .events
            .lock()
            .await
            .take()
            .ok_or(ClientError::AlreadyRunning)?;

        let mut reaper = tokio::time::interval(self.config.correlation.reap_interval());
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reaper.tick().await;
        tokio::pin!(shutdown);

        let closed = loop {
            tokio::select! {
                _ = &mut shutdown => break false,
                _ = reaper.tick() => self.reap_expired().await,
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        if let Err(e) = self.subscribe_all() {
                            tracing::warn!(error = %e, "re-subscribe failed");
                        } else {
                            tracing::info!(routes = self.routes.len(), "re-subscribed after connect");
                        }
                    }
                    Some(TransportEvent::Message { topic, payload }) => {
                        self.dispatch(&topic, payload).await;
                    }
                    None => break true,
                },
            }
        };

        if closed {
            tracing::warn!("transport event channel closed");
            self.connected.store(false, Ordering::Release);
        } else {
            *self.events.lock().await = Some(events);
        }
        Ok(())
    }

    /// Evict stale partial transfers and text messages on every route.
    pub async fn reap_expired(&self) {
        let mut reaped = 0;
        for route in &self.routes {
            reaped += route.reap_expired().await;
        }
        if reaped > 0 {
            tracing::debug!(reaped, "reaper pass");
        }
    }

    fn route_for(&self, topic: &str) -> Option<(&Route, TopicRole)> {
        self.routes
            .iter()
            .find_map(|route| route.role_of(topic).map(|role| (route, role)))
    }

    /// Handle one inbound publish. Failures are logged and the message dropped.
    pub async fn dispatch(&self, topic: &str, payload: Bytes) {
        let Some((route, role)) = self.route_for(topic) else {
            tracing::debug!(topic, "no route for inbound topic");
            return;
        };

        let result = match role {
            TopicRole::FileBytes => self.on_file_bytes(route, topic, payload).await,
            TopicRole::Envelope if !route.options().decode_json => {
                route.deliver(topic, Delivery::Raw(payload));
                Ok(())
            }
            TopicRole::Envelope => self.on_envelope(route, topic, &payload).await,
        };

        if let Err(e) = result {
            tracing::warn!(route = route.name(), topic, error = %e, "dropping inbound message");
        }
    }

    async fn on_envelope(&self, route: &Route, topic: &str, raw: &[u8]) -> Result<(), ClientError> {
        let envelope = envelope::decode_envelope(raw)?;
        if route.options().secure && !envelope.is_encrypted {
            return Err(ClientError::InsecureEnvelope {
                topic: topic.to_string(),
            });
        }
        let key = if envelope.is_encrypted {
            Some(self.receive_key(topic)?)
        } else {
            None
        };
        let data = envelope::open_fragment(&envelope, key.as_ref())?;

        match envelope.payload_kind {
            PayloadKind::Text => {
                let Value::String(chunk) = data else {
                    return Err(CodecError::Protocol("text data must be a string".into()).into());
                };
                if let Some(text) = route.texts().push(&envelope, chunk).await? {
                    route.deliver(
                        topic,
                        Delivery::Message(Message {
                            payload: Payload::Text(text.text),
                            origin_id: text.origin_id,
                            seq: text.seq,
                            is_error: text.is_error,
                        }),
                    );
                }
            }
            PayloadKind::Json => {
                let payload = envelope::into_payload(PayloadKind::Json, data, false)?;
                route.deliver(topic, Delivery::Message(message_from(&envelope, payload)));
            }
            PayloadKind::File => {
                let Some(files) = route.files() else {
                    return Err(CodecError::Protocol(format!(
                        "file metadata on non-file route {}",
                        route.name()
                    ))
                    .into());
                };
                let Payload::File(metadata) =
                    envelope::into_payload(PayloadKind::File, data, false)?
                else {
                    return Err(CodecError::Protocol("expected file metadata".into()).into());
                };
                let content_hash = envelope.content_hash.as_deref().unwrap_or_default();
                if envelope.is_encrypted && !route.options().secure {
                    tracing::warn!(
                        route = route.name(),
                        topic,
                        hash = %crate::file_transfer::short(content_hash),
                        "encrypted file metadata on a non-secure route; \
                         its bytes will arrive sealed and never match"
                    );
                }
                if let Correlation::Complete { file, .. } =
                    files.on_metadata(content_hash, metadata).await
                {
                    route.deliver(topic, Delivery::File(file));
                }
            }
        }
        Ok(())
    }

    async fn on_file_bytes(&self, route: &Route, topic: &str, payload: Bytes) -> Result<(), ClientError> {
        let Some(files) = route.files() else {
            return Ok(());
        };
        let metadata_topic = topic::metadata_topic(topic).unwrap_or(topic);
        let bytes = if route.options().secure {
            let key = self.receive_key(metadata_topic)?;
            Bytes::from(envelope::open_file_bytes(&key, &payload)?)
        } else {
            payload
        };

        if let Correlation::Complete { file, .. } = files.on_payload(bytes).await {
            route.deliver(metadata_topic, Delivery::File(file));
        }
        Ok(())
    }

    fn receive_key(&self, topic: &str) -> Result<SecretKey, ClientError> {
        self.keys
            .resolve(topic)
            .ok_or_else(|| ClientError::Configuration(format!("no key resolves for topic {topic}")))
    }
}

fn encode_options(options: &SendOptions) -> EncodeOptions {
    EncodeOptions {
        encode_base64: options.encode_base64,
        is_error: options.is_error,
    }
}

/// Serialize every envelope before the first publish, so an encoding
/// failure never leaves a message half sent.
fn encode_all(envelopes: &[Envelope]) -> Result<Vec<Bytes>, CodecError> {
    envelopes
        .iter()
        .map(|e| e.to_bytes().map(Bytes::from))
        .collect()
}

fn message_from(envelope: &Envelope, payload: Payload) -> Message {
    Message {
        payload,
        origin_id: envelope.origin_id.clone(),
        seq: envelope.seq,
        is_error: envelope.is_error,
    }
}
