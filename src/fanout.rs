//! Live delivery of committed writes to subscribed connections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::Delivery;
use crate::subscriptions::{ConnectionId, LiveStatus, Subscriber, TagIndex};
use crate::types::TaggedObject;
use crate::visibility::is_visible;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Upsert,
    Delete,
}

/// A committed store change.
///
/// For deletes `object` is the removed object stamped with the delete's
/// version.
#[derive(Clone, Debug)]
pub struct WriteEvent {
    pub object: Arc<TaggedObject>,
    pub kind: WriteKind,
}

impl WriteEvent {
    pub fn upsert(object: TaggedObject) -> Self {
        Self {
            object: Arc::new(object),
            kind: WriteKind::Upsert,
        }
    }

    pub fn delete(object: TaggedObject) -> Self {
        Self {
            object: Arc::new(object),
            kind: WriteKind::Delete,
        }
    }

    fn delivery(&self) -> Delivery {
        match self.kind {
            WriteKind::Upsert => Delivery::live(Arc::clone(&self.object)),
            WriteKind::Delete => Delivery::tombstone(self.object.object_ref()),
        }
    }
}

/// Counters from one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Connections the write went out to (sent or held).
    pub delivered: usize,
    /// Entries already covered by their watermark.
    pub covered: usize,
    /// Connections the object is not visible to.
    pub hidden: usize,
    /// Connections dropped because their buffer was full.
    pub overflowed: usize,
    /// Connections already gone.
    pub closed: usize,
}

/// Routes writes to the connections subscribed to the object's tags.
pub struct FanOut {
    index: Arc<TagIndex>,
}

impl FanOut {
    pub fn new(index: Arc<TagIndex>) -> Self {
        Self { index }
    }

    /// Deliver `event` to every qualifying connection exactly once.
    ///
    /// A connection qualifies when one of its entries for the object's tags
    /// has a watermark below the write's version and the object is visible
    /// to it. Sends never block.
    pub fn dispatch(&self, event: &WriteEvent) -> DispatchStats {
        let version = event.object.version;
        let mut stats = DispatchStats::default();

        let mut targets: HashMap<ConnectionId, Subscriber> = HashMap::new();
        for tag in &event.object.tags {
            for subscriber in self.index.subscribers_for(tag) {
                if !subscriber.is_live(version) {
                    stats.covered += 1;
                    continue;
                }
                targets.entry(subscriber.connection).or_insert(subscriber);
            }
        }

        if targets.is_empty() {
            return stats;
        }

        let delivery = event.delivery();
        for (connection, subscriber) in targets {
            let Some(mailbox) = subscriber.mailbox.upgrade() else {
                stats.closed += 1;
                continue;
            };

            if !is_visible(&event.object, mailbox.viewer()) {
                stats.hidden += 1;
                continue;
            }

            match mailbox.deliver_live(delivery.clone()) {
                LiveStatus::Delivered | LiveStatus::Held => stats.delivered += 1,
                LiveStatus::Overflowed => {
                    stats.overflowed += 1;
                    let released = self.index.remove_connection(connection);
                    tracing::warn!(
                        connection = %connection,
                        object = %event.object.object_ref(),
                        released,
                        "slow subscriber dropped"
                    );
                }
                LiveStatus::Closed => stats.closed += 1,
            }
        }

        tracing::debug!(
            object = %event.object.object_ref(),
            version = version.0,
            kind = ?event.kind,
            delivered = stats.delivered,
            "fan-out"
        );

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Outbound;
    use crate::subscriptions::{Mailbox, Outbox};
    use crate::types::{ObjectInput, Version};
    use std::collections::BTreeSet;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn connect(
        index: &TagIndex,
        id: u64,
        viewer: Option<&str>,
        subscribed: &[&str],
        watermark: u64,
    ) -> (Arc<Mailbox>, Outbox) {
        let (mailbox, outbox) = Mailbox::new(ConnectionId(id), viewer.map(String::from), 8);
        index.register(
            &tags(subscribed),
            ConnectionId(id),
            &Arc::downgrade(&mailbox),
            || Version(watermark),
        );
        (mailbox, outbox)
    }

    fn object(key: &str, tag_list: &[&str], version: u64) -> TaggedObject {
        ObjectInput::new(key)
            .tags(tag_list.iter().copied())
            .into_object("owner", Version(version))
    }

    #[test]
    fn test_delivers_once_per_connection() {
        let index = Arc::new(TagIndex::new(4));
        let (_mailbox, outbox) = connect(&index, 1, None, &["a", "b"], 0);
        let fanout = FanOut::new(Arc::clone(&index));

        let stats = fanout.dispatch(&WriteEvent::upsert(object("k", &["a", "b"], 1)));
        assert_eq!(stats.delivered, 1);
        assert!(matches!(
            outbox.try_recv(),
            Ok(Outbound::Delivery(Delivery::Update {
                historical: false,
                ..
            }))
        ));
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn test_skips_writes_covered_by_watermark() {
        let index = Arc::new(TagIndex::new(4));
        let (_mailbox, outbox) = connect(&index, 1, None, &["a"], 5);
        let fanout = FanOut::new(Arc::clone(&index));

        let stats = fanout.dispatch(&WriteEvent::upsert(object("k", &["a"], 5)));
        assert_eq!(stats.covered, 1);
        assert_eq!(stats.delivered, 0);
        assert!(outbox.try_recv().is_err());

        fanout.dispatch(&WriteEvent::upsert(object("k", &["a"], 6)));
        assert!(outbox.try_recv().is_ok());
    }

    #[test]
    fn test_respects_visibility() {
        let index = Arc::new(TagIndex::new(4));
        let (_r, r_out) = connect(&index, 1, Some("r"), &["t"], 0);
        let (_s, s_out) = connect(&index, 2, Some("s"), &["t"], 0);
        let fanout = FanOut::new(Arc::clone(&index));

        let mut restricted = object("k", &["t"], 1);
        restricted.recipients = Some(vec!["r".into()]);
        let stats = fanout.dispatch(&WriteEvent::upsert(restricted));

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.hidden, 1);
        assert!(r_out.try_recv().is_ok());
        assert!(s_out.try_recv().is_err());
    }

    #[test]
    fn test_delete_sends_tombstone() {
        let index = Arc::new(TagIndex::new(4));
        let (_mailbox, outbox) = connect(&index, 1, None, &["t"], 0);
        let fanout = FanOut::new(Arc::clone(&index));

        fanout.dispatch(&WriteEvent::delete(object("k", &["t"], 2)));
        match outbox.try_recv() {
            Ok(Outbound::Delivery(Delivery::Tombstone { tombstone, .. })) => {
                assert_eq!(tombstone.key, "k");
                assert_eq!(tombstone.owner, "owner");
            }
            other => panic!("Expected tombstone, got {:?}", other),
        }
    }

    #[test]
    fn test_dropped_mailbox_is_skipped() {
        let index = Arc::new(TagIndex::new(4));
        let (mailbox, outbox) = connect(&index, 1, None, &["t"], 0);
        drop(mailbox);
        drop(outbox);

        let stats = FanOut::new(Arc::clone(&index))
            .dispatch(&WriteEvent::upsert(object("k", &["t"], 1)));
        assert_eq!(stats.closed, 1);
    }

    #[test]
    fn test_overflow_is_reported() {
        let index = Arc::new(TagIndex::new(4));
        let (mailbox, _outbox) = connect(&index, 1, None, &["t"], 0);
        let fanout = FanOut::new(Arc::clone(&index));

        for v in 1..=8 {
            fanout.dispatch(&WriteEvent::upsert(object("k", &["t"], v)));
        }
        let stats = fanout.dispatch(&WriteEvent::upsert(object("k", &["t"], 9)));
        assert_eq!(stats.overflowed, 1);
        assert!(mailbox.is_overflowed());
        assert_eq!(index.entries_for(ConnectionId(1)), 0);

        // Later writes no longer consider the connection
        let stats = fanout.dispatch(&WriteEvent::upsert(object("k", &["t"], 10)));
        assert_eq!(stats, DispatchStats::default());
    }

    #[test]
    fn test_restricted_delete_tombstones_only_recipients() {
        let index = Arc::new(TagIndex::new(4));
        let (_r, r_out) = connect(&index, 1, Some("r"), &["t"], 0);
        let (_s, s_out) = connect(&index, 2, Some("s"), &["t"], 0);
        let fanout = FanOut::new(Arc::clone(&index));

        let mut restricted = object("k", &["t"], 3);
        restricted.recipients = Some(vec!["r".into()]);
        let stats = fanout.dispatch(&WriteEvent::delete(restricted));

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.hidden, 1);
        assert!(matches!(
            r_out.try_recv(),
            Ok(Outbound::Delivery(Delivery::Tombstone { .. }))
        ));
        assert!(s_out.try_recv().is_err());
    }
}
