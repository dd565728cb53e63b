//! Active-session index and routing between the wire and the plugins.
//!
//! The index is a sharded [`DashMap`]; lookups clone the session `Arc` and
//! release the shard before any dispatch or await, so a slow plugin never
//! holds up unrelated sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use blum_core::{
    ConnectionId, ErrorCode, Message, Outgoing, SESSION_OPENED_TOPIC, SessionControl,
    SessionError, SessionId,
};
use blum_plugins::{Dispatch, PluginContext, PluginError, PluginRegistry};
use blum_store::{RecordStore, StoreError};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::journal::{DEFAULT_RETENTION, SessionJournal};
use super::{CloseReason, Outbox, Session, SessionState};

/// Admission and queueing limits.
#[derive(Clone, Debug)]
pub struct SessionLimits {
    /// Maximum concurrently open sessions.
    pub max_sessions: usize,
    /// Outbound queue bound per session.
    pub outbound_queue_bound: usize,
    /// How long `close_session` waits for the writer to flush.
    pub flush_timeout: Duration,
    /// Abnormally closed sessions kept in the journal.
    pub journal_retention: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            outbound_queue_bound: 1024,
            flush_timeout: Duration::from_secs(2),
            journal_retention: DEFAULT_RETENTION,
        }
    }
}

struct Inner {
    sessions: DashMap<SessionId, Arc<Session>>,
    registry: Arc<PluginRegistry>,
    store: RecordStore,
    journal: SessionJournal,
    limits: SessionLimits,
    accepting: AtomicBool,
    admitted: AtomicUsize,
}

/// Tracks every connected session and mediates between the WebSocket layer
/// and the plugin registry. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Manager routing to `registry`, journaling into `store`.
    pub fn new(registry: Arc<PluginRegistry>, store: RecordStore, limits: SessionLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                registry,
                journal: SessionJournal::with_retention(store.clone(), limits.journal_retention),
                store,
                limits,
                accepting: AtomicBool::new(true),
                admitted: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate and open a session for `connection_id`.
    ///
    /// Refused sessions go `Connecting -> Closed` and are never indexed.
    /// The first outbound message is `session.opened` carrying the id.
    #[instrument(skip(self), fields(session_id))]
    pub async fn open_session(
        &self,
        connection_id: ConnectionId,
    ) -> Result<(Arc<Session>, Outbox), SessionError> {
        let (session, outbox) = Session::new(
            SessionId::new(),
            connection_id,
            self.inner.limits.outbound_queue_bound,
        );
        let session = Arc::new(session);
        let _ = tracing::Span::current().record("session_id", session.id().as_str());

        if !self.inner.accepting.load(Ordering::SeqCst) {
            let _ = session.refuse();
            counter!("sessions_refused_total").increment(1);
            return Err(SessionError::Refused("service is shutting down".into()));
        }
        let max = self.inner.limits.max_sessions;
        if self.inner.admitted.fetch_add(1, Ordering::SeqCst) >= max {
            let _ = self.inner.admitted.fetch_sub(1, Ordering::SeqCst);
            let _ = session.refuse();
            counter!("sessions_refused_total").increment(1);
            return Err(SessionError::Refused(format!("at capacity ({max} sessions)")));
        }

        // Journal before indexing so a close can never be written first.
        let journaled = Arc::clone(&session);
        self.journal_write("open", move |journal| journal.record_open(&journaled))
            .await;
        let _ = self
            .inner
            .sessions
            .insert(session.id().clone(), Arc::clone(&session));
        let _ = session.mark_open();
        gauge!("sessions_active").increment(1.0);
        if let Err(err) = session.enqueue(Outgoing::new(
            SESSION_OPENED_TOPIC,
            json!({ "sessionId": session.id() }),
        )) {
            warn!(error = %err, "failed to enqueue session.opened");
        }
        info!(connection_id = %session.connection_id(), "session opened");
        Ok((session, outbox))
    }

    /// Validate the sequence number of `msg`, dispatch it, and enqueue the
    /// replies (or an error message) on the originating session.
    ///
    /// Returns whether some plugin claimed the topic. Out-of-order messages
    /// are rejected before dispatch and produce no outbound message.
    #[instrument(skip_all, fields(session_id = %msg.session_id(), topic = msg.topic(), seq = msg.seq()))]
    pub async fn route(&self, msg: Message) -> Result<bool, SessionError> {
        let session = self
            .get(msg.session_id())
            .ok_or_else(|| SessionError::SessionGone(msg.session_id().clone()))?;
        if session.state() != SessionState::Open {
            return Err(SessionError::SessionGone(session.id().clone()));
        }
        session.accept_inbound(msg.seq())?;

        let ctx = PluginContext {
            session_id: session.id().clone(),
            store: self.inner.store.clone(),
            sessions: Arc::new(self.clone()),
        };
        let outcome = self.inner.registry.dispatch(&ctx, &msg).await;
        let handled = outcome.handled();
        let topic = msg.topic();
        let replies = match outcome {
            Dispatch::Handled { replies, .. } => replies,
            Dispatch::Unhandled => vec![Outgoing::error(
                ErrorCode::UnknownTopic,
                format!("no plugin handles topic {topic:?}"),
                Some(topic),
            )],
            Dispatch::Failed { plugin, error } => vec![failure_reply(&plugin, &error, topic)],
            Dispatch::TimedOut { plugin } => vec![Outgoing::error(
                ErrorCode::DispatchTimeout,
                format!("plugin {plugin} did not finish in time"),
                Some(topic),
            )],
        };

        for reply in replies {
            let _ = session.enqueue(reply)?;
        }
        Ok(handled)
    }

    /// Append `out` to a session's outbound queue. Best effort: a failure
    /// means the message was dropped.
    pub fn enqueue(&self, id: &SessionId, out: Outgoing) -> Result<u64, SessionError> {
        let result = match self.get(id) {
            Some(session) => session.enqueue(out),
            None => Err(SessionError::SessionGone(id.clone())),
        };
        if let Err(err) = &result {
            debug!(session_id = %id, error = %err, "outbound message dropped");
        }
        result
    }

    /// Close a session: `Closing`, wait for the writer to flush (bounded by
    /// the flush timeout), then `Closed` and out of the index.
    ///
    /// Returns `false` if the session was not indexed.
    #[instrument(skip_all, fields(session_id = %id, %reason))]
    pub async fn close_session(&self, id: &SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        let _ = session.begin_close(reason);

        let closed = session.closed_signal();
        let flush = self.inner.limits.flush_timeout;
        if tokio::time::timeout(flush, closed.cancelled()).await.is_err() {
            warn!(
                queued = session.queued(),
                "flush deadline of {flush:?} passed, discarding queue"
            );
        }
        let _ = session.finish_close();
        self.finalize(&session).await;
        true
    }

    /// Close every indexed session concurrently.
    pub async fn close_all(&self, reason: CloseReason) {
        let ids: Vec<SessionId> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), %reason, "closing all sessions");
        let closes = ids.iter().map(|id| self.close_session(id, reason));
        let _ = futures::future::join_all(closes).await;
    }

    /// Stop admitting new sessions.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether new sessions are admitted.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Indexed session by id.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Number of indexed sessions (open or closing).
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no session is indexed.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Registry used for dispatch.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    /// Session journal.
    pub fn journal(&self) -> &SessionJournal {
        &self.inner.journal
    }

    fn require(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.get(id)
            .ok_or_else(|| SessionError::SessionGone(id.clone()))
    }

    async fn finalize(&self, session: &Arc<Session>) {
        if self.inner.sessions.remove(session.id()).is_none() {
            return;
        }
        let _ = self.inner.admitted.fetch_sub(1, Ordering::SeqCst);
        gauge!("sessions_active").decrement(1.0);

        let reason = session.close_reason().unwrap_or(CloseReason::TransportError);
        let journaled = Arc::clone(session);
        self.journal_write("close", move |journal| {
            journal.record_close(&journaled, reason)
        })
        .await;
        info!(session_id = %session.id(), %reason, "session closed");
    }

    /// Run a journal write on the blocking pool. Failures are logged,
    /// never surfaced.
    async fn journal_write<F>(&self, op: &'static str, write: F)
    where
        F: FnOnce(&SessionJournal) -> Result<(), StoreError> + Send + 'static,
    {
        let journal = self.inner.journal.clone();
        match tokio::task::spawn_blocking(move || write(&journal)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(op, error = %err, "session journal write failed"),
            Err(err) => warn!(op, error = %err, "session journal task panicked"),
        }
    }
}

impl SessionControl for SessionManager {
    fn subscribe(&self, session_id: &SessionId, topic: &str) -> Result<bool, SessionError> {
        self.require(session_id)?.subscribe(topic)
    }

    fn unsubscribe(&self, session_id: &SessionId, topic: &str) -> Result<bool, SessionError> {
        self.require(session_id)?.unsubscribe(topic)
    }

    fn subscriptions(&self, session_id: &SessionId) -> Result<Vec<String>, SessionError> {
        Ok(self.require(session_id)?.subscriptions())
    }

    fn publish(&self, topic: &str, payload: &Value) -> usize {
        let targets: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .filter(|e| e.value().is_subscribed(topic))
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut delivered = 0;
        for session in targets {
            match session.enqueue(Outgoing::new(topic, payload.clone())) {
                Ok(_) => delivered += 1,
                Err(err) => debug!(session_id = %session.id(), error = %err, "publish skipped"),
            }
        }
        delivered
    }
}

fn failure_reply(plugin: &str, error: &PluginError, topic: &str) -> Outgoing {
    match error {
        PluginError::Store(StoreError::VersionConflict {
            key,
            expected,
            actual,
        }) => Outgoing::error_with(
            ErrorCode::VersionConflict,
            error.to_string(),
            Some(topic),
            json!({ "key": key, "expected": expected, "actual": actual }),
        ),
        _ => Outgoing::error_with(
            ErrorCode::PluginError,
            error.to_string(),
            Some(topic),
            json!({ "plugin": plugin }),
        ),
    }
}
