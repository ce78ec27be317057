//! Historical replay for a new subscription.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{Delivery, Outbound};
use crate::store::{ObjectStore, ReadRetry};
use crate::subscriptions::Mailbox;
use crate::types::{ObjectRef, TaggedObject, Version};
use crate::visibility::is_visible;

/// Objects fetched from the store per page.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Objects a subscription must receive historically: current tags
/// intersecting the subscribed set, version at or below the watermark,
/// visible to the viewer.
///
/// The store is read one page at a time in object-ref order, and the next
/// page is only fetched once the current one is used up. An object that is
/// rewritten or deleted before its page is fetched no longer qualifies; its
/// newer version reaches the subscriber live.
pub struct Replay<'a> {
    store: &'a dyn ObjectStore,
    retry: ReadRetry,
    tags: BTreeSet<String>,
    viewer: Option<String>,
    watermark: Version,
    page_size: usize,
    page: std::vec::IntoIter<TaggedObject>,
    /// Last object ref of the most recent page.
    cursor: Option<ObjectRef>,
    exhausted: bool,
}

impl<'a> Replay<'a> {
    /// Start a replay of everything covered by `watermark`.
    pub fn new(
        store: &'a dyn ObjectStore,
        tags: &BTreeSet<String>,
        viewer: Option<&str>,
        watermark: Version,
        retry: &ReadRetry,
    ) -> Result<Self> {
        Self::paged(store, tags, viewer, watermark, retry, DEFAULT_PAGE_SIZE)
    }

    /// Like [`Replay::new`] with an explicit page size.
    ///
    /// The first page is fetched here so that an unreachable store fails
    /// the call.
    pub fn paged(
        store: &'a dyn ObjectStore,
        tags: &BTreeSet<String>,
        viewer: Option<&str>,
        watermark: Version,
        retry: &ReadRetry,
        page_size: usize,
    ) -> Result<Self> {
        let mut replay = Self {
            store,
            retry: *retry,
            tags: tags.clone(),
            viewer: viewer.map(str::to_string),
            watermark,
            page_size: page_size.max(1),
            page: Vec::new().into_iter(),
            cursor: None,
            exhausted: false,
        };
        replay.fetch_page()?;

        tracing::debug!(
            tags = ?replay.tags,
            watermark = watermark.0,
            first_page = replay.page.len(),
            "replay started"
        );

        Ok(replay)
    }

    pub fn watermark(&self) -> Version {
        self.watermark
    }

    /// Send every remaining delivery to `mailbox`.
    ///
    /// Stops early, without error, once the mailbox is closed. Returns the
    /// number of deliveries sent.
    pub fn stream_into(self, mailbox: &Mailbox) -> Result<usize> {
        let mut sent = 0;
        for delivery in self {
            if mailbox.is_closed() {
                tracing::debug!(connection = %mailbox.connection(), sent, "replay cancelled");
                break;
            }
            mailbox.send(Outbound::Delivery(delivery?))?;
            sent += 1;
        }
        Ok(sent)
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = self.retry.run("query_page", || {
            self.store.query_page(
                &self.tags,
                self.watermark,
                self.cursor.as_ref(),
                self.page_size,
            )
        })?;

        self.exhausted = page.len() < self.page_size;
        if let Some(last) = page.last() {
            self.cursor = Some(last.object_ref());
        }
        self.page = page.into_iter();
        Ok(())
    }
}

impl Iterator for Replay<'_> {
    type Item = Result<Delivery>;

    fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            let viewer = self.viewer.as_deref();
            let watermark = self.watermark;
            if let Some(object) = self
                .page
                .by_ref()
                .find(|object| object.version <= watermark && is_visible(object, viewer))
            {
                return Some(Ok(Delivery::historical(Arc::new(object))));
            }

            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
