//! Fixtures shared by the plugin unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use blum_core::{SessionControl, SessionError, SessionId};
use blum_store::{Database, RecordStore};
use parking_lot::Mutex;
use serde_json::Value;

use crate::plugin::{HostContext, PluginContext};

pub(crate) const SESSION: &str = "sess_test";

pub(crate) fn test_context(sessions: Arc<dyn SessionControl>) -> PluginContext {
    PluginContext {
        session_id: SessionId::from(SESSION),
        store: RecordStore::new(Database::in_memory().unwrap()),
        sessions,
    }
}

pub(crate) fn test_host(sessions: Arc<dyn SessionControl>) -> HostContext {
    HostContext {
        store: RecordStore::new(Database::in_memory().unwrap()),
        sessions,
    }
}

/// Session layer that knows no sessions.
pub(crate) struct NullSessions;

impl SessionControl for NullSessions {
    fn subscribe(&self, id: &SessionId, _topic: &str) -> Result<bool, SessionError> {
        Err(SessionError::SessionGone(id.clone()))
    }
    fn unsubscribe(&self, id: &SessionId, _topic: &str) -> Result<bool, SessionError> {
        Err(SessionError::SessionGone(id.clone()))
    }
    fn subscriptions(&self, id: &SessionId) -> Result<Vec<String>, SessionError> {
        Err(SessionError::SessionGone(id.clone()))
    }
    fn publish(&self, _topic: &str, _payload: &Value) -> usize {
        0
    }
}

/// In-memory session layer that records publishes.
#[derive(Default)]
pub(crate) struct RecordingSessions {
    pub topics: Mutex<BTreeMap<SessionId, BTreeSet<String>>>,
    pub published: Mutex<Vec<(String, Value)>>,
}

impl SessionControl for RecordingSessions {
    fn subscribe(&self, id: &SessionId, topic: &str) -> Result<bool, SessionError> {
        Ok(self
            .topics
            .lock()
            .entry(id.clone())
            .or_default()
            .insert(topic.to_owned()))
    }
    fn unsubscribe(&self, id: &SessionId, topic: &str) -> Result<bool, SessionError> {
        Ok(self
            .topics
            .lock()
            .get_mut(id)
            .is_some_and(|t| t.remove(topic)))
    }
    fn subscriptions(&self, id: &SessionId) -> Result<Vec<String>, SessionError> {
        Ok(self
            .topics
            .lock()
            .get(id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }
    fn publish(&self, topic: &str, payload: &Value) -> usize {
        self.published
            .lock()
            .push((topic.to_owned(), payload.clone()));
        self.topics
            .lock()
            .values()
            .filter(|t| t.contains(topic))
            .count()
    }
}
