//! Core types for the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Store-wide write counter. Every insert, update and delete takes the next one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ver({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

/// Identifies one live object: the owner plus the owner-scoped key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub owner: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.key)
    }
}

/// A stored object as the broker sees it.
///
/// Everything except `key`, `owner`, `tags` and `recipients` lives in
/// `payload` and is passed through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedObject {
    pub key: String,

    /// Always the identity that wrote the object.
    pub owner: String,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// When present, only these identities and the owner may see the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,

    /// Assigned by the store. Internal to replay and fan-out.
    #[serde(skip)]
    pub version: Version,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TaggedObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.owner.clone(), self.key.clone())
    }

    /// Whether any of the object's current tags is in `tags`.
    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}

/// Client-supplied content of a write. The owner and version are never
/// taken from here.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectInput {
    pub key: String,
    pub tags: BTreeSet<String>,
    pub recipients: Option<Vec<String>>,
    pub payload: Map<String, Value>,
}

impl ObjectInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = Some(recipients.into_iter().map(Into::into).collect());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Materialize the stored object for `owner` at `version`.
    pub fn into_object(self, owner: &str, version: Version) -> TaggedObject {
        TaggedObject {
            key: self.key,
            owner: owner.to_string(),
            tags: self.tags,
            recipients: self.recipients,
            version,
            payload: self.payload,
        }
    }
}

/// Result of a store write.
#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub object: TaggedObject,
    /// False when an existing `(owner, key)` was replaced.
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_serializes_flat_without_version() {
        let object = ObjectInput::new("k1")
            .tag("a")
            .field("content", json!("hello"))
            .into_object("alice", Version(7));

        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(
            value,
            json!({"key": "k1", "owner": "alice", "tags": ["a"], "content": "hello"})
        );
    }

    #[test]
    fn test_recipients_serialized_when_present() {
        let object = ObjectInput::new("k1")
            .recipients(["bob"])
            .into_object("alice", Version(1));

        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(value["recipients"], json!(["bob"]));
    }

    #[test]
    fn test_has_any_tag() {
        let object = ObjectInput::new("k")
            .tags(["a", "b"])
            .into_object("o", Version(1));
        let wanted: BTreeSet<String> = ["b".to_string(), "z".to_string()].into();
        assert!(object.has_any_tag(&wanted));
        let other: BTreeSet<String> = ["z".to_string()].into();
        assert!(!object.has_any_tag(&other));
    }
}
