//! Subscription state for live tag feeds.
//!
//! Two ownership domains:
//! - each session owns a [`SubscriptionRegistry`] holding its tags;
//! - the shared [`TagIndex`] maps tags back to connections through weak
//!   references to their [`Mailbox`].
//!
//! Subscribing registers the connection in the index and captures a
//! watermark in one step. Writes at or below the watermark reach the
//! subscriber through replay, later writes through fan-out.
//!
//! # Example
//!
//! ```ignore
//! let index = Arc::new(TagIndex::default());
//! let (mailbox, outbox) = Mailbox::new(ConnectionId(1), Some("alice".into()), 1000);
//! let mut registry = SubscriptionRegistry::new(ConnectionId(1), Arc::downgrade(&mailbox), index);
//!
//! let watermark = registry.subscribe(&tags, || store.current_version())?;
//! ```

mod index;
mod mailbox;
mod registry;
mod types;

pub use index::{TagIndex, DEFAULT_SHARDS};
pub use mailbox::{LiveStatus, Mailbox, Outbox};
pub use registry::SubscriptionRegistry;
pub use types::{ConnectionId, Subscriber};
