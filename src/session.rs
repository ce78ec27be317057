//! Per-connection protocol handling.

use crossbeam_channel::Receiver;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::protocol::{self, Operation, Outbound, Reply, ReplyResult, Request, Status};
use crate::subscriptions::{ConnectionId, Mailbox, SubscriptionRegistry};
use crate::types::ObjectInput;

/// Source of inbound messages for one connection.
pub trait Transport {
    /// Next message, or `None` once the peer has closed.
    fn recv(&mut self) -> Result<Option<Value>>;

    /// Like [`recv`](Transport::recv), but gives up with `None` once
    /// `shutdown` disconnects.
    ///
    /// Transports that cannot wait on two sources keep the default, and
    /// then notice shutdown only after the next inbound message.
    fn recv_until(&mut self, shutdown: &Receiver<()>) -> Result<Option<Value>> {
        let _ = shutdown;
        self.recv()
    }
}

impl Transport for Receiver<Value> {
    fn recv(&mut self) -> Result<Option<Value>> {
        // A disconnected sender is an orderly close.
        Ok(Receiver::recv(self).ok())
    }

    fn recv_until(&mut self, shutdown: &Receiver<()>) -> Result<Option<Value>> {
        let inbound: &Receiver<Value> = self;
        crossbeam_channel::select! {
            recv(inbound) -> message => Ok(message.ok()),
            recv(shutdown) -> _ => Ok(None),
        }
    }
}

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Identity resolved, no message handled yet.
    Connecting,
    Active,
    Closed,
}

/// One client connection.
///
/// Owns the connection's subscriptions. Handles messages in order, and
/// every reply is queued before the next message is looked at.
pub struct Session {
    broker: Arc<Broker>,
    mailbox: Arc<Mailbox>,
    registry: SubscriptionRegistry,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(broker: Arc<Broker>, mailbox: Arc<Mailbox>) -> Self {
        let registry = SubscriptionRegistry::new(
            mailbox.connection(),
            Arc::downgrade(&mailbox),
            Arc::clone(broker.index()),
        );

        Self {
            broker,
            mailbox,
            registry,
            state: SessionState::Connecting,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.mailbox.connection()
    }

    /// The authenticated owner id, `None` for anonymous connections.
    pub fn identity(&self) -> Option<&str> {
        self.mailbox.viewer()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribed_tags(&self) -> Vec<String> {
        self.registry.tags()
    }

    pub fn is_overflowed(&self) -> bool {
        self.mailbox.is_overflowed()
    }

    /// Read messages from `transport` until it ends, then close.
    ///
    /// Returns an error when the transport fails or the connection was
    /// dropped for falling behind. An idle client is dropped as soon as its
    /// mailbox overflows, without waiting for its next message.
    pub fn run<T: Transport>(mut self, mut transport: T) -> Result<()> {
        let shutdown = self.mailbox.shutdown_signal();

        let result = loop {
            let received = transport.recv_until(&shutdown);
            if self.mailbox.is_overflowed() {
                break Err(BrokerError::Transport(
                    "outbound buffer overflowed".into(),
                ));
            }

            match received {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(&message) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            tracing::warn!(connection = %self.connection_id(), error = %e, "session ended");
        }
        self.close();
        result
    }

    /// Handle one inbound message.
    ///
    /// Operation failures become error replies. Only errors that end the
    /// session are returned.
    pub fn handle(&mut self, message: &Value) -> Result<()> {
        match self.state {
            SessionState::Closed => {
                return Err(BrokerError::Transport("session closed".into()));
            }
            SessionState::Connecting => self.state = SessionState::Active,
            SessionState::Active => {}
        }

        let request = match Request::from_json(message) {
            Ok(request) => request,
            Err(e) => return self.finish(protocol::message_id(message), Err(e)),
        };

        tracing::debug!(
            connection = %self.connection_id(),
            operation = request.operation.name(),
            "request"
        );

        let message_id = request.message_id;
        let outcome = match request.operation {
            Operation::Subscribe(tags) => return self.subscribe(message_id, &tags),
            Operation::Write(input) => self.write(input),
            Operation::Get { owner, key } => self
                .broker
                .get(self.identity(), &owner, &key)
                .map(ReplyResult::Object),
            Operation::Remove { key } => self.remove(&key),
            Operation::Unsubscribe(tags) => self
                .registry
                .unsubscribe(&tags)
                .map(|()| ReplyResult::status(Status::Unsubscribed)),
            Operation::ListTags => self
                .broker
                .tags_visible_to(self.identity())
                .map(ReplyResult::Tags),
        };

        self.finish(message_id, outcome)
    }

    fn require_identity(&self) -> Result<String> {
        self.identity()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Authorization("authentication required".into()))
    }

    fn write(&self, input: ObjectInput) -> Result<ReplyResult> {
        let owner = self.require_identity()?;
        let outcome = self.broker.write(&owner, input)?;

        Ok(ReplyResult::Written {
            reply: if outcome.created {
                Status::Inserted
            } else {
                Status::Updated
            },
            owner: outcome.object.owner,
            key: outcome.object.key,
        })
    }

    fn remove(&self, key: &str) -> Result<ReplyResult> {
        let owner = self.require_identity()?;
        self.broker.remove(&owner, key)?;
        Ok(ReplyResult::status(Status::Removed))
    }

    /// Register, reply, then stream history.
    ///
    /// Live deliveries arriving meanwhile are held by the mailbox and
    /// released after the last historical one.
    fn subscribe(&mut self, message_id: Option<Value>, tags: &BTreeSet<String>) -> Result<()> {
        self.mailbox.begin_replay();

        let store = Arc::clone(self.broker.store());
        let watermark = match self.registry.subscribe(tags, || store.current_version()) {
            Ok(watermark) => watermark,
            Err(e) => {
                self.mailbox.end_replay();
                return self.finish(message_id, Err(e));
            }
        };

        let streamed = self
            .send(Reply::ok(
                message_id.clone(),
                ReplyResult::status(Status::Subscribed),
            ))
            .and_then(|()| self.broker.replay(tags, self.identity(), watermark))
            .and_then(|replay| replay.stream_into(&self.mailbox));
        self.mailbox.end_replay();

        match streamed {
            Ok(sent) => {
                tracing::debug!(
                    connection = %self.connection_id(),
                    watermark = watermark.0,
                    sent,
                    "replay complete"
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // Replay failed after the subscription went in; undo it.
                if let Err(undo) = self.registry.unsubscribe(tags) {
                    tracing::warn!(
                        connection = %self.connection_id(),
                        error = %undo,
                        "rollback of failed subscription"
                    );
                }
                self.finish(message_id, Err(e))
            }
        }
    }

    fn finish(&self, message_id: Option<Value>, outcome: Result<ReplyResult>) -> Result<()> {
        match outcome {
            Ok(result) => self.send(Reply::ok(message_id, result)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(connection = %self.connection_id(), error = %e, "request failed");
                self.send(Reply::error(message_id, &e))
            }
        }
    }

    fn send(&self, reply: Reply) -> Result<()> {
        self.mailbox.send(Outbound::Reply(reply))
    }

    /// Tear down the connection's subscriptions. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.mailbox.close();
        let released = self.registry.close_all();

        tracing::info!(
            connection = %self.connection_id(),
            released,
            "connection closed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::identity::StaticTokens;
    use crate::store::MemoryStore;
    use crate::subscriptions::Outbox;
    use serde_json::json;

    fn broker() -> Arc<Broker> {
        Broker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(
                StaticTokens::new()
                    .with_token("tok-u", "u")
                    .with_token("tok-v", "v"),
            ),
            BrokerConfig::default(),
        )
    }

    fn next_json(outbox: &Outbox) -> Value {
        outbox.try_recv().unwrap().to_json().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let broker = broker();
        let (mut session, _outbox) = broker.connect(Some("tok-u"));
        assert_eq!(session.state(), SessionState::Connecting);

        session.handle(&json!({})).unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.handle(&json!({})).is_err());
    }

    #[test]
    fn test_write_insert_then_update() {
        let broker = broker();
        let (mut session, outbox) = broker.connect(Some("tok-u"));

        session
            .handle(&json!({"messageID": 1, "update": {"key": "k", "owner": "spoof"}}))
            .unwrap();
        assert_eq!(
            next_json(&outbox),
            json!({"messageID": 1, "result": {"reply": "inserted", "owner": "u", "key": "k"}})
        );

        session
            .handle(&json!({"messageID": 2, "update": {"key": "k"}}))
            .unwrap();
        assert_eq!(next_json(&outbox)["result"]["reply"], json!("updated"));
    }

    #[test]
    fn test_anonymous_write_rejected() {
        let broker = broker();
        let (mut session, outbox) = broker.connect(None);

        session
            .handle(&json!({"messageID": "w", "update": {"key": "k"}}))
            .unwrap();
        let reply = next_json(&outbox);
        assert_eq!(reply["messageID"], json!("w"));
        assert_eq!(reply["error"], json!("authorization"));
        assert_eq!(broker.current_version().0, 0);
    }

    #[test]
    fn test_validation_error_echoes_message_id() {
        let broker = broker();
        let (mut session, outbox) = broker.connect(Some("tok-u"));

        session
            .handle(&json!({"messageID": "x", "update": {"tags": ["a"]}}))
            .unwrap();
        assert_eq!(
            next_json(&outbox),
            json!({"messageID": "x", "error": "validation", "detail": "'key' is a required property"})
        );
    }

    #[test]
    fn test_remove_only_own_objects() {
        let broker = broker();
        let (mut u, u_out) = broker.connect(Some("tok-u"));
        let (mut v, v_out) = broker.connect(Some("tok-v"));

        u.handle(&json!({"update": {"key": "k"}})).unwrap();
        u_out.try_recv().unwrap();

        v.handle(&json!({"objectKey": "k"})).unwrap();
        assert_eq!(next_json(&v_out)["error"], json!("unknown"));

        u.handle(&json!({"objectKey": "k"})).unwrap();
        assert_eq!(next_json(&u_out)["result"]["reply"], json!("removed"));
    }

    #[test]
    fn test_point_read() {
        let broker = broker();
        let (mut u, u_out) = broker.connect(Some("tok-u"));

        u.handle(&json!({"update": {"key": "k", "content": "hi"}}))
            .unwrap();
        u_out.try_recv().unwrap();

        u.handle(&json!({"messageID": 5, "userID": "u", "objectKey": "k"}))
            .unwrap();
        let reply = next_json(&u_out);
        assert_eq!(reply["result"]["content"], json!("hi"));
        assert_eq!(reply["result"]["owner"], json!("u"));
    }

    #[test]
    fn test_subscribe_replies_before_history() {
        let broker = broker();
        broker.write("u", ObjectInput::new("old").tag("t")).unwrap();
        let (mut session, outbox) = broker.connect(Some("tok-v"));

        session
            .handle(&json!({"messageID": "s", "subscribe": ["t"]}))
            .unwrap();
        assert_eq!(
            next_json(&outbox),
            json!({"messageID": "s", "result": {"reply": "subscribed"}})
        );
        assert_eq!(next_json(&outbox)["historical"], json!(true));
        assert_eq!(session.subscribed_tags(), vec!["t"]);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_index() {
        let broker = broker();
        let (mut session, _outbox) = broker.connect(Some("tok-u"));
        session.handle(&json!({"subscribe": ["a", "b"]})).unwrap();
        assert_eq!(broker.index().entries_for(session.connection_id()), 2);

        session.close();
        session.close();
        assert_eq!(broker.index().subscription_count(), 0);
    }

    #[test]
    fn test_run_until_transport_closes() {
        let broker = broker();
        let (session, outbox) = broker.connect(Some("tok-u"));
        let (tx, rx) = crossbeam_channel::unbounded();

        tx.send(json!({"messageID": 1, "subscribe": ["t"]})).unwrap();
        tx.send(json!({"messageID": 2})).unwrap();
        drop(tx);

        session.run(rx).unwrap();
        assert_eq!(next_json(&outbox)["result"]["reply"], json!("subscribed"));
        assert_eq!(next_json(&outbox)["messageID"], json!(2));
        assert_eq!(broker.index().subscription_count(), 0);
    }
}
