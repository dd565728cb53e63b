//! Durable session lifecycle records in the `sessions` store namespace.
//!
//! Each session gets one record keyed by its id, written on open. A clean
//! close (client close or shutdown) purges the record; any other close
//! rewrites it as `closed` through the store's version check and keeps it
//! for diagnosis, up to a retention count. Records still `open` at startup
//! belong to a process that died; [`SessionJournal::recover`] closes them
//! with reason `abandoned`.

use blum_core::SessionId;
use blum_store::{RecordStore, StoreError, StoreOp, TransactionOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{CloseReason, Session};

/// Store namespace for session records.
pub const NAMESPACE: &str = "sessions";

/// Close reason written for sessions found open at startup.
pub const ABANDONED: &str = "abandoned";

/// Closed records kept when no retention is configured.
pub const DEFAULT_RETENTION: usize = 256;

/// Journal view of a session's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    /// The session was open when last written.
    Open,
    /// The session ended.
    Closed,
}

/// One journal record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Lifecycle state.
    pub state: JournalState,
    /// When the session opened.
    pub opened_at: DateTime<Utc>,
    /// When the session closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Why it closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    /// Highest inbound sequence number accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_inbound_seq: Option<u64>,
}

/// Session lifecycle persistence.
///
/// Calls are synchronous SQLite work; async callers run them on the
/// blocking pool.
#[derive(Clone)]
pub struct SessionJournal {
    store: RecordStore,
    retention: usize,
}

impl SessionJournal {
    /// Journal backed by `store`, keeping [`DEFAULT_RETENTION`] closed records.
    pub fn new(store: RecordStore) -> Self {
        Self::with_retention(store, DEFAULT_RETENTION)
    }

    /// Journal keeping at most `retention` closed records.
    pub fn with_retention(store: RecordStore, retention: usize) -> Self {
        Self { store, retention }
    }

    /// Record a newly opened session.
    #[instrument(skip_all, fields(session_id = %session.id()))]
    pub fn record_open(&self, session: &Session) -> Result<(), StoreError> {
        let entry = JournalEntry {
            state: JournalState::Open,
            opened_at: session.opened_at(),
            closed_at: None,
            close_reason: None,
            last_inbound_seq: None,
        };
        let _ = self
            .store
            .put(NAMESPACE, session.id().as_str(), &encode(&entry)?, 0)?;
        Ok(())
    }

    /// Record that `session` closed for `reason`.
    ///
    /// Clean closes drop the record. Other closes keep it and prune the
    /// oldest closed records beyond the retention count.
    #[instrument(skip_all, fields(session_id = %session.id(), %reason))]
    pub fn record_close(&self, session: &Session, reason: CloseReason) -> Result<(), StoreError> {
        let key = session.id().as_str();
        let current = self.store.get(NAMESPACE, key)?;

        if reason.is_clean() {
            if let Some(rec) = current {
                let _ = self.store.purge(NAMESPACE, key, rec.version)?;
            }
            return Ok(());
        }

        let expected = current.as_ref().map_or(0, |r| r.version);
        let opened_at = current
            .as_ref()
            .and_then(|rec| decode(&rec.value).ok())
            .map_or_else(|| session.opened_at(), |entry| entry.opened_at);
        let entry = JournalEntry {
            state: JournalState::Closed,
            opened_at,
            closed_at: Some(Utc::now()),
            close_reason: Some(reason.as_str().to_owned()),
            last_inbound_seq: session.last_inbound_seq(),
        };
        let _ = self.store.put(NAMESPACE, key, &encode(&entry)?, expected)?;
        let _ = self.prune()?;
        Ok(())
    }

    /// Stored entry for `id`.
    pub fn entry(&self, id: &SessionId) -> Result<Option<JournalEntry>, StoreError> {
        self.store
            .get(NAMESPACE, id.as_str())?
            .map(|rec| decode(&rec.value))
            .transpose()
    }

    /// Purge the oldest closed records until at most the retention count
    /// remain. Returns how many were purged.
    pub fn prune(&self) -> Result<usize, StoreError> {
        let mut closed = Vec::new();
        for key in self.store.keys(NAMESPACE)? {
            let Some(rec) = self.store.get(NAMESPACE, &key)? else {
                continue;
            };
            let Ok(entry) = decode(&rec.value) else {
                continue;
            };
            if entry.state == JournalState::Closed {
                closed.push((entry.closed_at, key, rec.version));
            }
        }
        if closed.len() <= self.retention {
            return Ok(0);
        }

        closed.sort();
        let excess = closed.len() - self.retention;
        let mut purged = 0;
        for (_, key, version) in closed.into_iter().take(excess) {
            match self.store.purge(NAMESPACE, &key, version) {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(session_id = %key, "journal record changed while pruning");
                }
                Err(err) => return Err(err),
            }
        }
        debug!(purged, retention = self.retention, "journal pruned");
        Ok(purged)
    }

    /// Close every entry left `open` by a previous process, atomically, then
    /// prune. Returns how many were rewritten.
    ///
    /// Undecodable records carry nothing worth keeping; they are purged with
    /// a warning instead of failing startup.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut ops = Vec::new();
        for key in self.store.keys(NAMESPACE)? {
            let Some(rec) = self.store.get(NAMESPACE, &key)? else {
                continue;
            };
            let mut entry = match decode(&rec.value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(session_id = %key, error = %err, "discarding unreadable journal record");
                    let _ = self.store.purge(NAMESPACE, &key, rec.version)?;
                    continue;
                }
            };
            if entry.state != JournalState::Open {
                continue;
            }
            entry.state = JournalState::Closed;
            entry.closed_at = Some(now);
            entry.close_reason = Some(ABANDONED.to_owned());
            ops.push(StoreOp::Put {
                namespace: NAMESPACE.to_owned(),
                key,
                value: encode(&entry)?,
                expected_version: rec.version,
            });
        }

        let abandoned = if ops.is_empty() {
            0
        } else {
            match self.store.transaction(&ops)? {
                TransactionOutcome::Committed { versions } => {
                    info!(count = versions.len(), "abandoned sessions closed");
                    versions.len()
                }
                TransactionOutcome::RolledBack { conflict } => {
                    return Err(StoreError::VersionConflict {
                        key: conflict.key,
                        expected: conflict.expected,
                        actual: conflict.actual,
                    });
                }
            }
        };
        let _ = self.prune()?;
        Ok(abandoned)
    }
}

fn encode(entry: &JournalEntry) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(entry)?)
}

fn decode(bytes: &[u8]) -> Result<JournalEntry, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
