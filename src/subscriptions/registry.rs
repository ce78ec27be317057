//! Per-connection subscription bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use crate::error::{BrokerError, Result};
use crate::types::Version;

use super::index::TagIndex;
use super::mailbox::Mailbox;
use super::types::ConnectionId;

/// The tags one connection is subscribed to.
///
/// Owned by the connection's session. Every change is mirrored into the
/// shared [`TagIndex`], and `close_all` removes whatever is left.
pub struct SubscriptionRegistry {
    connection: ConnectionId,
    mailbox: Weak<Mailbox>,
    index: Arc<TagIndex>,
    /// Held tags and the watermark each was registered at.
    tags: BTreeMap<String, Version>,
}

impl SubscriptionRegistry {
    pub fn new(connection: ConnectionId, mailbox: Weak<Mailbox>, index: Arc<TagIndex>) -> Self {
        Self {
            connection,
            mailbox,
            index,
            tags: BTreeMap::new(),
        }
    }

    /// Subscribe to every tag in `tags`, all or nothing.
    ///
    /// `capture` reads the store version while the index shards are locked;
    /// the result is the watermark for this call.
    pub fn subscribe<F>(&mut self, tags: &BTreeSet<String>, capture: F) -> Result<Version>
    where
        F: FnOnce() -> Version,
    {
        if tags.is_empty() {
            return Err(BrokerError::Validation(
                "subscribe requires at least one tag".into(),
            ));
        }

        let duplicates: Vec<String> = tags
            .iter()
            .filter(|t| self.tags.contains_key(*t))
            .cloned()
            .collect();
        if !duplicates.is_empty() {
            return Err(BrokerError::DuplicateSubscription(duplicates));
        }

        let watermark = self
            .index
            .register(tags, self.connection, &self.mailbox, capture);
        for tag in tags {
            self.tags.insert(tag.clone(), watermark);
        }

        tracing::debug!(
            connection = %self.connection,
            tags = ?tags,
            watermark = watermark.0,
            "subscribed"
        );

        Ok(watermark)
    }

    /// Unsubscribe from every tag in `tags`, all or nothing.
    pub fn unsubscribe(&mut self, tags: &BTreeSet<String>) -> Result<()> {
        if tags.is_empty() {
            return Err(BrokerError::Validation(
                "unsubscribe requires at least one tag".into(),
            ));
        }

        let missing: Vec<String> = tags
            .iter()
            .filter(|t| !self.tags.contains_key(*t))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BrokerError::NoSuchSubscription(missing));
        }

        for tag in tags {
            self.tags.remove(tag);
            self.index.remove_subscriber(tag, self.connection);
        }

        tracing::debug!(connection = %self.connection, tags = ?tags, "unsubscribed");

        Ok(())
    }

    /// Drop every subscription. Safe to call repeatedly.
    pub fn close_all(&mut self) -> usize {
        let count = self.tags.len();
        for tag in std::mem::take(&mut self.tags).into_keys() {
            self.index.remove_subscriber(&tag, self.connection);
        }
        count
    }

    pub fn is_subscribed(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// Held tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        self.tags.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
