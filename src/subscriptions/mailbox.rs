//! Per-connection outbound path.
//!
//! Replies, historical deliveries and live deliveries all go through one
//! bounded channel. While a replay runs, live deliveries are parked in a
//! holdback queue so that every historical delivery of that replay reaches
//! the client first.

use crossbeam_channel::{
    bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::protocol::{Delivery, Outbound};

use super::types::ConnectionId;

/// Outcome of a live delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveStatus {
    Delivered,
    /// Parked until the running replay finishes.
    Held,
    /// The buffer is full; the connection is being dropped.
    Overflowed,
    /// The connection is closed or its receiver is gone.
    Closed,
}

#[derive(Default)]
struct Gate {
    replaying: bool,
    holdback: VecDeque<Outbound>,
}

/// The sending half of a connection, shared with the tag index through
/// weak references.
pub struct Mailbox {
    connection: ConnectionId,
    viewer: Option<String>,
    sender: Sender<Outbound>,
    capacity: usize,
    gate: Mutex<Gate>,
    overflowed: AtomicBool,
    closed: AtomicBool,
    /// Dropped on overflow or close, which disconnects `shutdown_rx`.
    shutdown: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Mailbox {
    /// Create a mailbox and the handle its transport writer drains.
    pub fn new(
        connection: ConnectionId,
        viewer: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, Outbox) {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (shutdown, shutdown_rx) = bounded(0);

        let mailbox = Arc::new(Self {
            connection,
            viewer,
            sender,
            capacity,
            gate: Mutex::new(Gate::default()),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Mutex::new(Some(shutdown)),
            shutdown_rx,
        });

        (mailbox, Outbox { connection, receiver })
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Identity used for visibility checks on this connection.
    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    /// Blocking send for replies and historical deliveries.
    pub fn send(&self, message: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Transport("connection closed".into()));
        }
        if self.is_overflowed() {
            return Err(BrokerError::Transport("outbound buffer overflowed".into()));
        }
        self.sender
            .send(message)
            .map_err(|_| BrokerError::Transport("outbound channel disconnected".into()))
    }

    /// Non-blocking send used by fan-out.
    pub fn deliver_live(&self, delivery: Delivery) -> LiveStatus {
        if self.is_closed() {
            return LiveStatus::Closed;
        }
        if self.is_overflowed() {
            return LiveStatus::Overflowed;
        }

        let mut gate = self.gate.lock();
        if gate.replaying {
            if gate.holdback.len() >= self.capacity {
                self.mark_overflowed();
                return LiveStatus::Overflowed;
            }
            gate.holdback.push_back(Outbound::Delivery(delivery));
            return LiveStatus::Held;
        }

        self.try_push(Outbound::Delivery(delivery))
    }

    /// Start holding back live deliveries.
    pub fn begin_replay(&self) {
        self.gate.lock().replaying = true;
    }

    /// Release held live deliveries in arrival order and go live again.
    pub fn end_replay(&self) -> LiveStatus {
        let mut gate = self.gate.lock();
        gate.replaying = false;

        while let Some(message) = gate.holdback.pop_front() {
            match self.try_push(message) {
                LiveStatus::Delivered => {}
                other => {
                    gate.holdback.clear();
                    return other;
                }
            }
        }

        LiveStatus::Delivered
    }

    fn try_push(&self, message: Outbound) -> LiveStatus {
        match self.sender.try_send(message) {
            Ok(()) => LiveStatus::Delivered,
            Err(TrySendError::Full(_)) => {
                self.mark_overflowed();
                LiveStatus::Overflowed
            }
            Err(TrySendError::Disconnected(_)) => LiveStatus::Closed,
        }
    }

    fn mark_overflowed(&self) {
        if !self.overflowed.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                connection = %self.connection,
                "outbound buffer overflowed, dropping connection"
            );
            self.signal_shutdown();
        }
    }

    /// Channel that disconnects once this mailbox overflows or closes.
    ///
    /// A session blocked on client input selects on it to notice that it
    /// has to tear down.
    pub fn shutdown_signal(&self) -> Receiver<()> {
        self.shutdown_rx.clone()
    }

    fn signal_shutdown(&self) {
        self.shutdown.lock().take();
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    /// Stop accepting messages. In-flight replays observe this and stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.gate.lock().holdback.clear();
        self.signal_shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receiving half of a connection's outbound path.
pub struct Outbox {
    pub connection: ConnectionId,
    pub receiver: Receiver<Outbound>,
}

impl Outbox {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<Outbound, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Outbound, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Outbound, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
