//! # Tagcast
//!
//! A tag-addressed publish/subscribe broker over a mutable object store.
//!
//! ## Core Concepts
//!
//! - **Objects**: JSON documents keyed by `(owner, key)`, carrying tags and an
//!   optional recipient list
//! - **Subscriptions**: A connection subscribes to tags and receives every
//!   visible matching object exactly once, first historically then live
//! - **Watermarks**: The store version captured at subscribe time, splitting
//!   replay from live fan-out
//! - **Visibility**: Objects with recipients are seen only by those
//!   recipients and their owner
//!
//! ## Example
//!
//! ```ignore
//! use tagcast::{Broker, BrokerConfig, MemoryStore, StaticTokens};
//!
//! let broker = Broker::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticTokens::new().with_token("secret", "alice")),
//!     BrokerConfig::default(),
//! );
//!
//! let (session, outbox) = broker.connect(Some("secret"));
//! std::thread::spawn(move || session.run(inbound));
//!
//! while let Ok(message) = outbox.recv() {
//!     send_to_client(message.to_json()?);
//! }
//! ```

pub mod broker;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod visibility;

// Re-exports
pub use broker::{Broker, BrokerConfig};
pub use error::{BrokerError, Result};
pub use fanout::{DispatchStats, FanOut, WriteEvent, WriteKind};
pub use identity::{HmacTokenVerifier, IdentityVerifier, OwnerClaims, StaticTokens};
pub use protocol::{Delivery, Operation, Outbound, Reply, ReplyResult, Request, Status};
pub use replay::Replay;
pub use session::{Session, SessionState, Transport};
pub use store::{DurableStore, DurableStoreConfig, MemoryStore, ObjectStore, ReadRetry};
pub use subscriptions::{
    ConnectionId, LiveStatus, Mailbox, Outbox, Subscriber, SubscriptionRegistry, TagIndex,
};
pub use types::*;
pub use visibility::is_visible;
