//! Client message formats.
//!
//! Inbound messages are JSON objects carrying at most one operation.
//! Outbound messages are either replies (echoing `messageID`) or
//! asynchronous deliveries.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::types::{ObjectInput, ObjectRef, TaggedObject};

/// Keys that select an operation. At most one may be present.
const INTENT_KEYS: [&str; 4] = ["update", "objectKey", "subscribe", "unsubscribe"];

/// Fields of `update` the broker assigns itself.
const ASSIGNED_FIELDS: [&str; 2] = ["owner", "version"];

/// A decoded inbound operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Write(ObjectInput),
    Get { owner: String, key: String },
    Remove { key: String },
    Subscribe(BTreeSet<String>),
    Unsubscribe(BTreeSet<String>),
    ListTags,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Write(_) => "write",
            Operation::Get { .. } => "get",
            Operation::Remove { .. } => "remove",
            Operation::Subscribe(_) => "subscribe",
            Operation::Unsubscribe(_) => "unsubscribe",
            Operation::ListTags => "list_tags",
        }
    }
}

/// An inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub message_id: Option<Value>,
    pub operation: Operation,
}

impl Request {
    /// Validate and decode an inbound message.
    pub fn from_json(message: &Value) -> Result<Self> {
        let fields = message
            .as_object()
            .ok_or_else(|| invalid("message must be an object"))?;

        let message_id = match fields.get("messageID") {
            None => None,
            Some(id @ (Value::String(_) | Value::Number(_))) => Some(id.clone()),
            Some(_) => return Err(invalid("'messageID' must be a string or number")),
        };

        let intents: Vec<&str> = INTENT_KEYS
            .iter()
            .copied()
            .filter(|k| fields.contains_key(*k))
            .collect();
        if intents.len() > 1 {
            return Err(invalid(format!(
                "message has more than one operation: {}",
                intents.join(", ")
            )));
        }
        if fields.contains_key("userID") && !fields.contains_key("objectKey") {
            return Err(invalid("'userID' requires 'objectKey'"));
        }

        let operation = match intents.first().copied() {
            Some("update") => Operation::Write(parse_update(&fields["update"])?),
            Some("objectKey") => {
                let key = non_empty_string(&fields["objectKey"], "objectKey")?;
                match fields.get("userID") {
                    Some(owner) => Operation::Get {
                        owner: non_empty_string(owner, "userID")?,
                        key,
                    },
                    None => Operation::Remove { key },
                }
            }
            Some("subscribe") => Operation::Subscribe(tag_list(&fields["subscribe"], "subscribe")?),
            Some("unsubscribe") => {
                Operation::Unsubscribe(tag_list(&fields["unsubscribe"], "unsubscribe")?)
            }
            _ => Operation::ListTags,
        };

        Ok(Self {
            message_id,
            operation,
        })
    }
}

/// The `messageID` to echo, if the message carries a usable one.
pub fn message_id(message: &Value) -> Option<Value> {
    match message.get("messageID") {
        Some(id @ (Value::String(_) | Value::Number(_))) => Some(id.clone()),
        _ => None,
    }
}

fn invalid(msg: impl Into<String>) -> BrokerError {
    BrokerError::Validation(msg.into())
}

fn non_empty_string(value: &Value, field: &str) -> Result<String> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(invalid(format!("'{}' must not be empty", field))),
        _ => Err(invalid(format!("'{}' must be a string", field))),
    }
}

fn string_list(value: &Value, field: &str) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(format!("'{}' must be an array of strings", field)))?;

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("'{}' must be an array of strings", field)))
        })
        .collect()
}

fn tag_list(value: &Value, field: &str) -> Result<BTreeSet<String>> {
    let tags: BTreeSet<String> = string_list(value, field)?.into_iter().collect();
    if tags.is_empty() {
        return Err(invalid(format!("'{}' requires at least one tag", field)));
    }
    Ok(tags)
}

fn parse_update(value: &Value) -> Result<ObjectInput> {
    let fields = value
        .as_object()
        .ok_or_else(|| invalid("'update' must be an object"))?;

    let key = match fields.get("key") {
        Some(key) => non_empty_string(key, "key")?,
        None => return Err(invalid("'key' is a required property")),
    };

    let tags = match fields.get("tags") {
        Some(tags) => string_list(tags, "tags")?.into_iter().collect(),
        None => BTreeSet::new(),
    };

    let recipients = match fields.get("recipients") {
        Some(Value::Null) | None => None,
        Some(recipients) => Some(string_list(recipients, "recipients")?),
    };

    let payload: Map<String, Value> = fields
        .iter()
        .filter(|(name, _)| {
            !matches!(name.as_str(), "key" | "tags" | "recipients")
                && !ASSIGNED_FIELDS.contains(&name.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(ObjectInput {
        key,
        tags,
        recipients,
        payload,
    })
}

// --- Outbound ---

/// Status words used in replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Inserted,
    Updated,
    Removed,
    Subscribed,
    Unsubscribed,
}

/// The `result` of a successful reply.
///
/// Every status-only outcome is an object carrying `reply`; writes add the
/// owner and key of the stored object.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyResult {
    Status {
        reply: Status,
    },
    Written {
        reply: Status,
        owner: String,
        key: String,
    },
    Object(TaggedObject),
    Tags(Vec<String>),
}

impl ReplyResult {
    pub fn status(reply: Status) -> Self {
        ReplyResult::Status { reply }
    }
}

/// Direct reply to one inbound message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reply {
    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplyResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Reply {
    pub fn ok(message_id: Option<Value>, result: ReplyResult) -> Self {
        Self {
            message_id,
            result: Some(result),
            error: None,
            detail: None,
        }
    }

    pub fn error(message_id: Option<Value>, error: &BrokerError) -> Self {
        Self {
            message_id,
            result: None,
            error: Some(error.code().to_string()),
            detail: Some(error.detail()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// An object pushed to a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Delivery {
    Update {
        update: Arc<TaggedObject>,
        historical: bool,
    },
    Tombstone {
        tombstone: ObjectRef,
        historical: bool,
    },
}

impl Delivery {
    pub fn historical(object: Arc<TaggedObject>) -> Self {
        Delivery::Update {
            update: object,
            historical: true,
        }
    }

    pub fn live(object: Arc<TaggedObject>) -> Self {
        Delivery::Update {
            update: object,
            historical: false,
        }
    }

    pub fn tombstone(target: ObjectRef) -> Self {
        Delivery::Tombstone {
            tombstone: target,
            historical: false,
        }
    }

    pub fn is_historical(&self) -> bool {
        match self {
            Delivery::Update { historical, .. } | Delivery::Tombstone { historical, .. } => {
                *historical
            }
        }
    }

    pub fn target(&self) -> ObjectRef {
        match self {
            Delivery::Update { update, .. } => update.object_ref(),
            Delivery::Tombstone { tombstone, .. } => tombstone.clone(),
        }
    }
}

/// Anything sent to a client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Reply(Reply),
    Delivery(Delivery),
}

impl Outbound {
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn as_reply(&self) -> Option<&Reply> {
        match self {
            Outbound::Reply(reply) => Some(reply),
            Outbound::Delivery(_) => None,
        }
    }

    pub fn as_delivery(&self) -> Option<&Delivery> {
        match self {
            Outbound::Delivery(delivery) => Some(delivery),
            Outbound::Reply(_) => None,
        }
    }
}
