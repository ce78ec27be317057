//! The broker: shared state behind every connection.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::fanout::{DispatchStats, FanOut, WriteEvent};
use crate::identity::IdentityVerifier;
use crate::protocol::{Outbound, Reply};
use crate::replay::{Replay, DEFAULT_PAGE_SIZE};
use crate::session::Session;
use crate::store::{ObjectStore, ReadRetry, DEFAULT_READ_RETRIES, DEFAULT_RETRY_BACKOFF};
use crate::subscriptions::{ConnectionId, Mailbox, Outbox, TagIndex, DEFAULT_SHARDS};
use crate::types::{ObjectInput, TaggedObject, Version, WriteOutcome};
use crate::visibility::is_visible;

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Outbound buffer per connection. A connection whose live deliveries
    /// overflow it is dropped.
    pub mailbox_capacity: usize,

    /// Number of lock shards in the tag index.
    pub tag_index_shards: usize,

    /// Extra attempts for failed store reads.
    pub read_retries: u32,

    /// Pause between read attempts.
    pub retry_backoff: Duration,

    /// Objects read from the store per replay page.
    pub replay_page_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            tag_index_shards: DEFAULT_SHARDS,
            read_retries: DEFAULT_READ_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            replay_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Tag-addressed pub/sub over an object store.
///
/// Owns the tag index and the fan-out path. Connections are opened with
/// [`Broker::connect`], which hands back a [`Session`] to drive and the
/// [`Outbox`] its transport writer drains.
pub struct Broker {
    config: BrokerConfig,
    store: Arc<dyn ObjectStore>,
    identity: Arc<dyn IdentityVerifier>,
    index: Arc<TagIndex>,
    fanout: FanOut,
    retry: ReadRetry,
    next_connection: AtomicU64,
}

impl Broker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        identity: Arc<dyn IdentityVerifier>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let index = Arc::new(TagIndex::new(config.tag_index_shards));
        let retry = ReadRetry::new(config.read_retries, config.retry_backoff);

        Arc::new(Self {
            fanout: FanOut::new(Arc::clone(&index)),
            index,
            store,
            identity,
            retry,
            config,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Open a connection.
    ///
    /// A rejected credential is reported on the outbox and the connection
    /// continues anonymously.
    pub fn connect(self: &Arc<Self>, credential: Option<&str>) -> (Session, Outbox) {
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));

        let (identity, rejected) = match credential {
            None => (None, None),
            Some(token) => match self.identity.verify(token) {
                Ok(owner) => (Some(owner), None),
                Err(e) => {
                    tracing::warn!(connection = %connection, error = %e, "credential rejected");
                    (None, Some(e))
                }
            },
        };

        let (mailbox, outbox) =
            Mailbox::new(connection, identity.clone(), self.config.mailbox_capacity);

        if let Some(error) = rejected {
            // Fresh mailbox; cannot be full.
            let _ = mailbox.send(Outbound::Reply(Reply::error(None, &error)));
        }

        tracing::info!(
            connection = %connection,
            identity = identity.as_deref().unwrap_or("<anonymous>"),
            "connection opened"
        );

        (Session::new(Arc::clone(self), mailbox), outbox)
    }

    /// Write an object owned by `owner` and fan it out.
    pub fn write(&self, owner: &str, input: ObjectInput) -> Result<WriteOutcome> {
        let outcome = self.store.write(owner, input)?;

        tracing::debug!(
            object = %outcome.object.object_ref(),
            version = outcome.object.version.0,
            created = outcome.created,
            "write"
        );

        self.fanout
            .dispatch(&WriteEvent::upsert(outcome.object.clone()));
        Ok(outcome)
    }

    /// Delete `(owner, key)` and fan out a tombstone.
    pub fn remove(&self, owner: &str, key: &str) -> Result<DispatchStats> {
        let removed = self
            .store
            .delete(owner, key)?
            .ok_or(BrokerError::NotFound)?;

        tracing::debug!(
            object = %removed.object_ref(),
            version = removed.version.0,
            "remove"
        );

        Ok(self.fanout.dispatch(&WriteEvent::delete(removed)))
    }

    /// Point read. Objects hidden from `viewer` are reported as missing.
    pub fn get(&self, viewer: Option<&str>, owner: &str, key: &str) -> Result<TaggedObject> {
        self.retry
            .run("get", || self.store.get(owner, key))?
            .filter(|object| is_visible(object, viewer))
            .ok_or(BrokerError::NotFound)
    }

    /// Tags carried by objects visible to `viewer`, sorted.
    pub fn tags_visible_to(&self, viewer: Option<&str>) -> Result<Vec<String>> {
        let tags = self
            .retry
            .run("tags_visible_to", || self.store.tags_visible_to(viewer))?;
        Ok(tags.into_iter().collect())
    }

    /// Historical replay for `tags` up to `watermark`.
    pub fn replay(
        &self,
        tags: &BTreeSet<String>,
        viewer: Option<&str>,
        watermark: Version,
    ) -> Result<Replay<'_>> {
        Replay::paged(
            self.store.as_ref(),
            tags,
            viewer,
            watermark,
            &self.retry,
            self.config.replay_page_size,
        )
    }

    pub fn current_version(&self) -> Version {
        self.store.current_version()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<TagIndex> {
        &self.index
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticTokens;
    use crate::store::MemoryStore;

    fn broker() -> Arc<Broker> {
        Broker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StaticTokens::new().with_token("tok-u", "u")),
            BrokerConfig::default(),
        )
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let broker = broker();
        let (a, _a_out) = broker.connect(None);
        let (b, _b_out) = broker.connect(None);
        assert_ne!(a.connection_id(), b.connection_id());
    }

    #[test]
    fn test_rejected_credential_reports_and_continues() {
        let broker = broker();
        let (session, outbox) = broker.connect(Some("bogus"));
        assert!(session.identity().is_none());

        let reply = outbox.try_recv().unwrap();
        let reply = reply.as_reply().unwrap();
        assert_eq!(reply.error.as_deref(), Some("authorization"));
        assert_eq!(reply.detail.as_deref(), Some("invalid token"));
    }

    #[test]
    fn test_get_hides_invisible_objects() {
        let broker = broker();
        broker
            .write("u", ObjectInput::new("k").recipients(["r"]))
            .unwrap();

        assert!(broker.get(Some("r"), "u", "k").is_ok());
        assert!(broker.get(Some("u"), "u", "k").is_ok());
        assert!(matches!(
            broker.get(Some("s"), "u", "k"),
            Err(BrokerError::NotFound)
        ));
        assert!(matches!(broker.get(None, "u", "k"), Err(BrokerError::NotFound)));
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let broker = broker();
        let before = broker.current_version();
        assert!(matches!(broker.remove("u", "nope"), Err(BrokerError::NotFound)));
        assert_eq!(broker.current_version(), before);
    }

    #[test]
    fn test_tags_visible_to_sorted() {
        let broker = broker();
        broker.write("u", ObjectInput::new("1").tags(["zeta", "alpha"])).unwrap();
        broker
            .write("u", ObjectInput::new("2").tag("hidden").recipients(["r"]))
            .unwrap();

        assert_eq!(broker.tags_visible_to(Some("s")).unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(
            broker.tags_visible_to(Some("r")).unwrap(),
            vec!["alpha", "hidden", "zeta"]
        );
    }
}
