//! Sharded tag → subscriber index.

use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Weak;

use crate::types::Version;

use super::mailbox::Mailbox;
use super::types::{ConnectionId, Subscriber};

/// Default number of independently locked shards.
pub const DEFAULT_SHARDS: usize = 64;

type Shard = HashMap<String, HashMap<ConnectionId, Subscriber>>;

/// Maps each tag to the connections subscribed to it.
///
/// Tags hash into shards with their own `RwLock`, so fan-out on one tag does
/// not wait on subscribe/unsubscribe traffic for tags in other shards.
pub struct TagIndex {
    shards: Vec<RwLock<Shard>>,
}

impl TagIndex {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, tag: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        tag.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Register `subscriber` for `tag`. Re-adding replaces the entry.
    pub fn add_subscriber(&self, tag: &str, subscriber: Subscriber) {
        self.shards[self.shard_for(tag)]
            .write()
            .entry(tag.to_string())
            .or_default()
            .insert(subscriber.connection, subscriber);
    }

    /// Deregister `connection` from `tag`. Returns whether it was present.
    pub fn remove_subscriber(&self, tag: &str, connection: ConnectionId) -> bool {
        let mut shard = self.shards[self.shard_for(tag)].write();
        let Some(subscribers) = shard.get_mut(tag) else {
            return false;
        };

        let removed = subscribers.remove(&connection).is_some();
        if subscribers.is_empty() {
            shard.remove(tag);
        }
        removed
    }

    /// Snapshot of the subscribers for `tag`.
    pub fn subscribers_for(&self, tag: &str) -> Vec<Subscriber> {
        self.shards[self.shard_for(tag)]
            .read()
            .get(tag)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `connection` for every tag in `tags` at a single watermark.
    ///
    /// Every shard touched is write-locked (in ascending order) while
    /// `capture` reads the store version, and stays locked until all entries
    /// are in. A fan-out that reads one of these shards either runs before
    /// the capture, so its write is at or below the watermark, or sees the
    /// entry and compares against it.
    pub fn register<F>(
        &self,
        tags: &BTreeSet<String>,
        connection: ConnectionId,
        mailbox: &Weak<Mailbox>,
        capture: F,
    ) -> Version
    where
        F: FnOnce() -> Version,
    {
        let shard_ids: BTreeSet<usize> = tags.iter().map(|t| self.shard_for(t)).collect();
        let mut guards: Vec<(usize, RwLockWriteGuard<'_, Shard>)> = shard_ids
            .into_iter()
            .map(|id| (id, self.shards[id].write()))
            .collect();

        let watermark = capture();

        for tag in tags {
            let id = self.shard_for(tag);
            if let Some((_, shard)) = guards.iter_mut().find(|(shard_id, _)| *shard_id == id) {
                shard.entry(tag.clone()).or_default().insert(
                    connection,
                    Subscriber {
                        connection,
                        mailbox: mailbox.clone(),
                        watermark,
                    },
                );
            }
        }

        watermark
    }

    pub fn is_subscribed(&self, tag: &str, connection: ConnectionId) -> bool {
        self.shards[self.shard_for(tag)]
            .read()
            .get(tag)
            .is_some_and(|subscribers| subscribers.contains_key(&connection))
    }

    /// Number of tags with at least one subscriber.
    pub fn tag_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Total (tag, connection) entries.
    pub fn subscription_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().map(HashMap::len).sum::<usize>())
            .sum()
    }

    /// Distinct connections holding at least one entry.
    pub fn connection_count(&self) -> usize {
        let mut connections = HashSet::new();
        for shard in &self.shards {
            for subscribers in shard.read().values() {
                connections.extend(subscribers.keys().copied());
            }
        }
        connections.len()
    }

    /// Drop every entry of `connection`. Returns how many were removed.
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.retain(|_, subscribers| {
                if subscribers.remove(&connection).is_some() {
                    removed += 1;
                }
                !subscribers.is_empty()
            });
        }
        removed
    }

    /// Entries held by one connection across all tags.
    pub fn entries_for(&self, connection: ConnectionId) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .values()
                    .filter(|subscribers| subscribers.contains_key(&connection))
                    .count()
            })
            .sum()
    }
}

impl Default for TagIndex {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
