use std::collections::BTreeSet;

use crate::error::Result;
use crate::types::{ObjectInput, ObjectRef, TaggedObject, Version, WriteOutcome};

/// Object storage consumed by the broker.
///
/// All implementations must satisfy these invariants:
/// - Every successful write or delete takes the next store-wide version.
/// - `current_version()` never reports a version whose write is not yet
///   visible to `get` and `query_by_tags`.
/// - `(owner, key)` identifies at most one live object; writing an existing
///   pair replaces it.
/// - Writes are not idempotent. Callers must not retry a write whose outcome
///   is unknown.
pub trait ObjectStore: Send + Sync {
    /// Insert or replace the object `(owner, input.key)`.
    fn write(&self, owner: &str, input: ObjectInput) -> Result<WriteOutcome>;

    /// Delete `(owner, key)`.
    ///
    /// Returns the removed object stamped with the delete's version, or
    /// `Ok(None)` when nothing was there (no version is consumed).
    fn delete(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>>;

    /// Point lookup.
    fn get(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>>;

    /// All live objects whose current tags intersect `tags` and whose version
    /// is at most `ceiling`. Each object appears once, in a stable order.
    fn query_by_tags(&self, tags: &BTreeSet<String>, ceiling: Version)
        -> Result<Vec<TaggedObject>>;

    /// One page of [`query_by_tags`](ObjectStore::query_by_tags) in ascending
    /// object-ref order: at most `limit` objects whose ref sorts after
    /// `after`.
    ///
    /// A page shorter than `limit` means nothing follows it. The default
    /// runs the full query for every page; stores with an ordered tag index
    /// should override it.
    fn query_page(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
        after: Option<&ObjectRef>,
        limit: usize,
    ) -> Result<Vec<TaggedObject>> {
        let mut objects: Vec<(ObjectRef, TaggedObject)> = self
            .query_by_tags(tags, ceiling)?
            .into_iter()
            .map(|object| (object.object_ref(), object))
            .filter(|(object_ref, _)| after.map_or(true, |after| object_ref > after))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(objects
            .into_iter()
            .take(limit)
            .map(|(_, object)| object)
            .collect())
    }

    /// The latest published version.
    fn current_version(&self) -> Version;

    /// Every tag carried by at least one object visible to `viewer`.
    fn tags_visible_to(&self, viewer: Option<&str>) -> Result<BTreeSet<String>>;
}
