//! Per-client session state and the manager that indexes it.
//!
//! A [`Session`] owns the producer side of a bounded outbound channel; the
//! connection's writer task owns the [`Outbox`]. State transitions follow
//! `Connecting -> Open -> Closing -> Closed`, with `Connecting -> Closed`
//! reserved for refused handshakes.
//!
//! Lock order inside a session is outbound, then state. Holding the
//! outbound lock across the state check is what keeps an enqueue from
//! slipping in after the session has left `Open`.

pub mod journal;
pub mod manager;

use std::collections::BTreeSet;

use blum_core::{ConnectionId, Message, Outgoing, SessionError, SessionId};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use journal::{JournalEntry, JournalState, SessionJournal};
pub use manager::{SessionLimits, SessionManager};

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Allocated, handshake not yet confirmed.
    Connecting,
    /// Accepting inbound and outbound traffic.
    Open,
    /// Flushing queued messages; no new enqueues.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a session ended. Carries the WebSocket close code sent to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client sent a Close frame.
    ClientClosed,
    /// The service is shutting down.
    ServerShutdown,
    /// No traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// Repeated malformed frames or a transport protocol violation.
    ProtocolError,
    /// The outbound queue exceeded its bound.
    SlowConsumer,
    /// The socket failed or ended without a Close frame.
    TransportError,
    /// Not admitted (capacity or shutdown).
    Refused,
}

impl CloseReason {
    /// WebSocket close code.
    pub fn code(self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::ServerShutdown | Self::HeartbeatTimeout => 1001,
            Self::ProtocolError => 1002,
            Self::SlowConsumer => 1008,
            Self::TransportError => 1011,
            Self::Refused => 1013,
        }
    }

    /// Whether the session ended the normal way, by either side's choice.
    pub fn is_clean(self) -> bool {
        matches!(self, Self::ClientClosed | Self::ServerShutdown)
    }

    /// Short human-readable reason, also used as the close frame text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::ServerShutdown => "server shutdown",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::ProtocolError => "protocol error",
            Self::SlowConsumer => "slow consumer",
            Self::TransportError => "transport error",
            Self::Refused => "refused",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct OutboundSlot {
    tx: mpsc::Sender<Message>,
    next_seq: u64,
}

/// One connected client.
pub struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    opened_at: DateTime<Utc>,
    bound: usize,
    outbound: Mutex<OutboundSlot>,
    state: Mutex<SessionState>,
    topics: Mutex<BTreeSet<String>>,
    last_inbound_seq: Mutex<Option<u64>>,
    close_reason: Mutex<Option<CloseReason>>,
    closing: CancellationToken,
    closed: CancellationToken,
}

impl Session {
    /// New session in `Connecting` with an outbound queue of `bound` slots.
    pub fn new(id: SessionId, connection_id: ConnectionId, bound: usize) -> (Self, Outbox) {
        let bound = bound.max(1);
        let (tx, rx) = mpsc::channel(bound);
        let session = Self {
            id,
            connection_id,
            opened_at: Utc::now(),
            bound,
            outbound: Mutex::new(OutboundSlot { tx, next_seq: 1 }),
            state: Mutex::new(SessionState::Connecting),
            topics: Mutex::new(BTreeSet::new()),
            last_inbound_seq: Mutex::new(None),
            close_reason: Mutex::new(None),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
        };
        (session, Outbox { rx })
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Transport connection this session is bound to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// When the session was allocated.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Reason recorded by the first close request, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Highest inbound sequence number accepted so far.
    pub fn last_inbound_seq(&self) -> Option<u64> {
        *self.last_inbound_seq.lock()
    }

    /// Messages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.bound - self.outbound.lock().tx.capacity()
    }

    /// Token cancelled when the session leaves `Open`.
    pub fn closing_signal(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Token cancelled when the session reaches `Closed`.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// `Connecting -> Open`. Returns `false` from any other state.
    pub fn mark_open(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Open;
            true
        } else {
            false
        }
    }

    /// `Connecting -> Closed` for a handshake that is not admitted.
    pub fn refuse(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Connecting {
            return false;
        }
        *state = SessionState::Closed;
        *self.close_reason.lock() = Some(CloseReason::Refused);
        drop(state);
        self.closing.cancel();
        self.closed.cancel();
        true
    }

    /// Accept `seq` if it is strictly greater than the last one seen.
    pub fn accept_inbound(&self, seq: u64) -> Result<(), SessionError> {
        let mut last = self.last_inbound_seq.lock();
        if let Some(last_seen) = *last {
            if seq <= last_seen {
                return Err(SessionError::OutOfOrder {
                    session_id: self.id.clone(),
                    seq,
                    last_seen,
                });
            }
        }
        *last = Some(seq);
        Ok(())
    }

    /// Add a topic. Idempotent: returns `false` when already subscribed.
    pub fn subscribe(&self, topic: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.topics.lock().insert(topic.to_owned()))
    }

    /// Remove a topic. Returns `false` when it was not subscribed.
    pub fn unsubscribe(&self, topic: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.topics.lock().remove(topic))
    }

    /// Whether the session is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    /// Subscribed topics, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    /// Append a message to the outbound queue and return its sequence number.
    ///
    /// Fails with `SessionGone` unless the session is `Open`. A full queue
    /// starts a `SlowConsumer` close and fails the enqueue.
    pub fn enqueue(&self, out: Outgoing) -> Result<u64, SessionError> {
        let mut slot = self.outbound.lock();
        if *self.state.lock() != SessionState::Open {
            return Err(SessionError::SessionGone(self.id.clone()));
        }

        let seq = slot.next_seq;
        let msg = Message::new(self.id.clone(), out.topic, out.payload, seq);
        match slot.tx.try_send(msg) {
            Ok(()) => {
                slot.next_seq += 1;
                Ok(seq)
            }
            Err(TrySendError::Full(_)) => {
                drop(slot);
                warn!(session_id = %self.id, bound = self.bound, "outbound queue full");
                counter!("slow_consumer_closes_total").increment(1);
                let _ = self.begin_close(CloseReason::SlowConsumer);
                Err(SessionError::SlowConsumer(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::SessionGone(self.id.clone())),
        }
    }

    /// `Open -> Closing`, recording `reason`. Returns `false` when the session
    /// had already left `Open`; the first reason wins.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let _slot = self.outbound.lock();
        let mut state = self.state.lock();
        if *state != SessionState::Open {
            return false;
        }
        *state = SessionState::Closing;
        *self.close_reason.lock() = Some(reason);
        drop(state);
        self.closing.cancel();
        true
    }

    /// Move to `Closed`. A session still `Open` passes through `Closing`
    /// with reason `TransportError`. Returns `false` if already closed.
    pub fn finish_close(&self) -> bool {
        let _slot = self.outbound.lock();
        let mut state = self.state.lock();
        match *state {
            SessionState::Closed => return false,
            SessionState::Open => {
                let _ = self
                    .close_reason
                    .lock()
                    .get_or_insert(CloseReason::TransportError);
            }
            SessionState::Connecting | SessionState::Closing => {}
        }
        *state = SessionState::Closed;
        drop(state);
        self.closing.cancel();
        self.closed.cancel();
        true
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Open {
            Ok(())
        } else {
            Err(SessionError::SessionGone(self.id.clone()))
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Consumer side of a session's outbound queue. Owned by the writer task.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Message>,
}

impl Outbox {
    /// Next message, waiting if the queue is empty.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn open_session(bound: usize) -> (Session, Outbox) {
        let (session, outbox) = Session::new(SessionId::new(), ConnectionId::new(), bound);
        assert!(session.mark_open());
        (session, outbox)
    }

    #[test]
    fn starts_connecting() {
        let (session, _outbox) = Session::new(SessionId::new(), ConnectionId::new(), 4);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.close_reason().is_none());
    }

    #[test]
    fn refuse_goes_straight_to_closed() {
        let (session, _outbox) = Session::new(SessionId::new(), ConnectionId::new(), 4);
        assert!(session.refuse());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Refused));
        assert!(session.closed_signal().is_cancelled());
    }

    #[test]
    fn refuse_only_from_connecting() {
        let (session, _outbox) = open_session(4);
        assert!(!session.refuse());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn enqueue_assigns_increasing_seq_in_fifo_order() {
        let (session, mut outbox) = open_session(8);
        for i in 0..5 {
            let seq = session.enqueue(Outgoing::new("t", json!(i))).unwrap();
            assert_eq!(seq, i + 1);
        }
        for i in 0..5u64 {
            let msg = outbox.try_recv().unwrap();
            assert_eq!(msg.seq(), i + 1);
            assert_eq!(msg.payload(), &json!(i));
            assert_eq!(msg.session_id(), session.id());
        }
        assert!(outbox.is_empty());
    }

    #[test]
    fn enqueue_before_open_is_gone() {
        let (session, _outbox) = Session::new(SessionId::new(), ConnectionId::new(), 4);
        let err = session.enqueue(Outgoing::new("t", json!(null))).unwrap_err();
        assert_matches!(err, SessionError::SessionGone(_));
    }

    #[test]
    fn full_queue_closes_as_slow_consumer() {
        let (session, outbox) = open_session(2);
        let _ = session.enqueue(Outgoing::new("t", json!(1))).unwrap();
        let _ = session.enqueue(Outgoing::new("t", json!(2))).unwrap();
        assert_eq!(session.queued(), 2);

        let err = session.enqueue(Outgoing::new("t", json!(3))).unwrap_err();
        assert_matches!(err, SessionError::SlowConsumer(_));
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(session.closing_signal().is_cancelled());

        // No further enqueue succeeds, even once there is room again.
        drop(outbox);
        let err = session.enqueue(Outgoing::new("t", json!(4))).unwrap_err();
        assert_matches!(err, SessionError::SessionGone(_));
    }

    #[test]
    fn enqueue_after_consumer_dropped_is_gone() {
        let (session, outbox) = open_session(2);
        drop(outbox);
        let err = session.enqueue(Outgoing::new("t", json!(1))).unwrap_err();
        assert_matches!(err, SessionError::SessionGone(_));
    }

    #[test]
    fn queued_messages_survive_begin_close() {
        let (session, mut outbox) = open_session(4);
        let _ = session.enqueue(Outgoing::new("a", json!(1))).unwrap();
        assert!(session.begin_close(CloseReason::ServerShutdown));
        assert!(session.enqueue(Outgoing::new("b", json!(2))).is_err());
        assert_eq!(outbox.try_recv().unwrap().topic(), "a");
        assert!(outbox.try_recv().is_none());
    }

    #[test]
    fn first_close_reason_wins() {
        let (session, _outbox) = open_session(4);
        assert!(session.begin_close(CloseReason::HeartbeatTimeout));
        assert!(!session.begin_close(CloseReason::ClientClosed));
        assert!(session.finish_close());
        assert!(!session.finish_close());
        assert_eq!(session.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn finish_close_from_open_records_transport_error() {
        let (session, _outbox) = open_session(4);
        assert!(session.finish_close());
        assert_eq!(session.close_reason(), Some(CloseReason::TransportError));
        assert!(session.closing_signal().is_cancelled());
        assert!(session.closed_signal().is_cancelled());
    }

    #[test]
    fn out_of_order_rejected() {
        let (session, _outbox) = open_session(4);
        session.accept_inbound(1).unwrap();
        session.accept_inbound(5).unwrap();
        assert_matches!(
            session.accept_inbound(5),
            Err(SessionError::OutOfOrder { seq: 5, last_seen: 5, .. })
        );
        assert_matches!(
            session.accept_inbound(2),
            Err(SessionError::OutOfOrder { seq: 2, last_seen: 5, .. })
        );
        assert_eq!(session.last_inbound_seq(), Some(5));
    }

    #[test]
    fn subscribe_is_idempotent() {
        let (session, _outbox) = open_session(4);
        assert!(session.subscribe("news").unwrap());
        assert!(!session.subscribe("news").unwrap());
        assert!(session.subscribe("alerts").unwrap());
        assert_eq!(session.subscriptions(), vec!["alerts", "news"]);
        assert!(session.unsubscribe("news").unwrap());
        assert!(!session.unsubscribe("news").unwrap());
        assert!(!session.is_subscribed("news"));
    }

    #[test]
    fn subscribe_after_close_is_gone() {
        let (session, _outbox) = open_session(4);
        let _ = session.begin_close(CloseReason::ClientClosed);
        assert_matches!(session.subscribe("x"), Err(SessionError::SessionGone(_)));
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::ClientClosed.code(), 1000);
        assert_eq!(CloseReason::ServerShutdown.code(), 1001);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 1001);
        assert_eq!(CloseReason::ProtocolError.code(), 1002);
        assert_eq!(CloseReason::SlowConsumer.code(), 1008);
        assert_eq!(CloseReason::Refused.code(), 1013);
    }

    #[test]
    fn only_client_and_shutdown_closes_are_clean() {
        assert!(CloseReason::ClientClosed.is_clean());
        assert!(CloseReason::ServerShutdown.is_clean());
        assert!(!CloseReason::HeartbeatTimeout.is_clean());
        assert!(!CloseReason::SlowConsumer.is_clean());
        assert!(!CloseReason::TransportError.is_clean());
    }

    #[test]
    fn outbox_debug_is_printable() {
        let (_session, outbox) = open_session(2);
        assert!(format!("{outbox:?}").starts_with("Outbox"));
    }

    #[test]
    fn close_reason_serializes_snake_case() {
        let json = serde_json::to_value(CloseReason::SlowConsumer).unwrap();
        assert_eq!(json, "slow_consumer");
    }
}
