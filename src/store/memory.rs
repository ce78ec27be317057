//! In-memory object store.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::store::ObjectStore;
use crate::types::{ObjectInput, ObjectRef, TaggedObject, Version, WriteOutcome};
use crate::visibility::is_visible;

/// Live objects plus a tag → object secondary index.
///
/// Not synchronized; owners wrap it in a lock.
#[derive(Default)]
pub(crate) struct ObjectTable {
    objects: HashMap<ObjectRef, TaggedObject>,
    by_tag: HashMap<String, BTreeSet<ObjectRef>>,
    head: Version,
}

impl ObjectTable {
    pub(crate) fn head(&self) -> Version {
        self.head
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Store `object`, replacing any prior object with the same ref.
    pub(crate) fn put(&mut self, object: TaggedObject) -> Option<TaggedObject> {
        let object_ref = object.object_ref();
        let previous = self.unindex(&object_ref);

        for tag in &object.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(object_ref.clone());
        }
        self.head = self.head.max(object.version);
        self.objects.insert(object_ref, object);

        previous
    }

    /// Remove `object_ref`, recording `version` as the new head.
    pub(crate) fn remove(&mut self, object_ref: &ObjectRef, version: Version) -> Option<TaggedObject> {
        let removed = self.unindex(object_ref);
        if removed.is_some() {
            self.head = self.head.max(version);
        }
        removed
    }

    fn unindex(&mut self, object_ref: &ObjectRef) -> Option<TaggedObject> {
        let previous = self.objects.remove(object_ref)?;
        for tag in &previous.tags {
            if let Some(refs) = self.by_tag.get_mut(tag) {
                refs.remove(object_ref);
                if refs.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(previous)
    }

    pub(crate) fn get(&self, object_ref: &ObjectRef) -> Option<&TaggedObject> {
        self.objects.get(object_ref)
    }

    pub(crate) fn contains(&self, object_ref: &ObjectRef) -> bool {
        self.objects.contains_key(object_ref)
    }

    pub(crate) fn query(&self, tags: &BTreeSet<String>, ceiling: Version) -> Vec<TaggedObject> {
        let mut refs = BTreeSet::new();
        for tag in tags {
            if let Some(tagged) = self.by_tag.get(tag) {
                refs.extend(tagged.iter());
            }
        }

        refs.into_iter()
            .filter_map(|r| self.objects.get(r))
            .filter(|o| o.version <= ceiling)
            .cloned()
            .collect()
    }

    /// Merge the per-tag ref sets from just past `after`, skipping objects
    /// above `ceiling`, until `limit` objects are collected.
    pub(crate) fn query_page(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
        after: Option<&ObjectRef>,
        limit: usize,
    ) -> Vec<TaggedObject> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut cursors: Vec<_> = tags
            .iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .map(|refs| refs.range::<ObjectRef, _>((lower, Bound::Unbounded)).peekable())
            .collect();

        let mut page = Vec::new();
        while page.len() < limit {
            let Some(next) = cursors.iter_mut().filter_map(|c| c.peek().copied()).min() else {
                break;
            };
            for cursor in &mut cursors {
                if cursor.peek() == Some(&next) {
                    cursor.next();
                }
            }
            if let Some(object) = self.objects.get(next).filter(|o| o.version <= ceiling) {
                page.push(object.clone());
            }
        }
        page
    }

    pub(crate) fn tags_visible_to(&self, viewer: Option<&str>) -> BTreeSet<String> {
        self.objects
            .values()
            .filter(|o| is_visible(o, viewer))
            .flat_map(|o| o.tags.iter().cloned())
            .collect()
    }
}

/// Object store held entirely in memory.
///
/// Useful for tests and for deployments that treat the feed as ephemeral.
pub struct MemoryStore {
    table: RwLock<ObjectTable>,
    /// Published head; only advanced after the table reflects the write.
    published: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ObjectTable::default()),
            published: AtomicU64::new(0),
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn write(&self, owner: &str, input: ObjectInput) -> Result<WriteOutcome> {
        let mut table = self.table.write();

        let version = table.head().next();
        let object = input.into_object(owner, version);
        let created = table.put(object.clone()).is_none();
        self.published.store(version.0, Ordering::SeqCst);

        Ok(WriteOutcome { object, created })
    }

    fn delete(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>> {
        let mut table = self.table.write();

        let object_ref = ObjectRef::new(owner, key);
        if !table.contains(&object_ref) {
            return Ok(None);
        }

        let version = table.head().next();
        let removed = table.remove(&object_ref, version).map(|mut object| {
            object.version = version;
            object
        });
        self.published.store(version.0, Ordering::SeqCst);

        Ok(removed)
    }

    fn get(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>> {
        Ok(self.table.read().get(&ObjectRef::new(owner, key)).cloned())
    }

    fn query_by_tags(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
    ) -> Result<Vec<TaggedObject>> {
        Ok(self.table.read().query(tags, ceiling))
    }

    fn query_page(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
        after: Option<&ObjectRef>,
        limit: usize,
    ) -> Result<Vec<TaggedObject>> {
        Ok(self.table.read().query_page(tags, ceiling, after, limit))
    }

    fn current_version(&self) -> Version {
        Version(self.published.load(Ordering::SeqCst))
    }

    fn tags_visible_to(&self, viewer: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(self.table.read().tags_visible_to(viewer))
    }
}
