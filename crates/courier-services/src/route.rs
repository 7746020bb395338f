//! Routes: topic patterns bound to handlers.
//!
//! A route owns everything inbound traffic on its pattern needs: the handler,
//! the delivery options, the text assembler, and for file routes the
//! transfer coordinator. The client's dispatcher finds the route for an
//! inbound topic and hands it the decoded delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use courier_core::envelope::Payload;

use crate::assembly::TextAssembler;
use crate::file_transfer::{FileTransferCoordinator, ReceivedFile};
use crate::topic;

/// A decoded message handed to a route handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Payload,
    pub origin_id: String,
    pub seq: u64,
    pub is_error: bool,
}

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Undecoded payload bytes (routes with `decode_json = false`).
    Raw(Bytes),
    /// A text message or one JSON batch.
    Message(Message),
    /// A correlated file transfer.
    File(ReceivedFile),
}

/// Application callback for one route.
///
/// Errors are logged by the dispatcher and otherwise ignored. Closures of
/// the right shape implement this directly.
pub trait RouteHandler: Send + Sync {
    fn handle(&self, topic: &str, delivery: Delivery) -> Result<()>;
}

impl<F> RouteHandler for F
where
    F: Fn(&str, Delivery) -> Result<()> + Send + Sync,
{
    fn handle(&self, topic: &str, delivery: Delivery) -> Result<()> {
        self(topic, delivery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOptions {
    /// Decode envelopes before delivery. When false the handler gets raw bytes.
    pub decode_json: bool,
    /// Also subscribe to the `/file` sibling topic and correlate transfers.
    pub is_file: bool,
    /// Require encryption on this route, both directions.
    pub secure: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            decode_json: true,
            is_file: false,
            secure: false,
        }
    }
}

impl RouteOptions {
    pub fn file() -> Self {
        Self {
            is_file: true,
            ..Self::default()
        }
    }

    pub fn raw() -> Self {
        Self {
            decode_json: false,
            ..Self::default()
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

/// Which half of a route an inbound topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    Envelope,
    FileBytes,
}

pub struct Route {
    name: String,
    pattern: String,
    file_pattern: Option<String>,
    options: RouteOptions,
    handler: Arc<dyn RouteHandler>,
    files: Option<FileTransferCoordinator>,
    texts: TextAssembler,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        handler: Arc<dyn RouteHandler>,
        options: RouteOptions,
        ttl: Duration,
        max_fragments: u32,
    ) -> Self {
        let pattern = pattern.into();
        let (file_pattern, files) = if options.is_file {
            (
                topic::file_subscription(&pattern),
                Some(FileTransferCoordinator::new(ttl)),
            )
        } else {
            (None, None)
        };
        Self {
            name: name.into(),
            pattern,
            file_pattern,
            options,
            handler,
            files,
            texts: TextAssembler::new(ttl, max_fragments),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire topic pattern (prefix and suffix applied).
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> RouteOptions {
        self.options
    }

    /// Every pattern this route needs subscribed.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.pattern.as_str()).chain(self.file_pattern.as_deref())
    }

    /// Classify an inbound topic against this route.
    ///
    /// File bytes are checked first: under a `#` pattern the `/file` topic
    /// also matches the envelope pattern.
    pub fn role_of(&self, topic: &str) -> Option<TopicRole> {
        if self.carries_file_bytes(topic) {
            return Some(TopicRole::FileBytes);
        }
        topic::matches(&self.pattern, topic).then_some(TopicRole::Envelope)
    }

    fn carries_file_bytes(&self, topic: &str) -> bool {
        if !self.options.is_file {
            return false;
        }
        match &self.file_pattern {
            Some(p) => topic::matches(p, topic),
            None => topic::metadata_topic(topic)
                .is_some_and(|parent| topic::matches(&self.pattern, parent)),
        }
    }

    pub fn files(&self) -> Option<&FileTransferCoordinator> {
        self.files.as_ref()
    }

    pub fn texts(&self) -> &TextAssembler {
        &self.texts
    }

    /// Invoke the handler, logging failures.
    pub fn deliver(&self, topic: &str, delivery: Delivery) {
        if let Err(e) = self.handler.handle(topic, delivery) {
            tracing::warn!(route = %self.name, topic, error = %e, "route handler failed");
        }
    }

    /// Evict stale partial state. Returns the number of entries removed.
    pub async fn reap_expired(&self) -> usize {
        let mut reaped = self.texts.reap_expired().await;
        if let Some(files) = &self.files {
            reaped += files.reap_expired().await;
        }
        reaped
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
