//! Persistent conversation store.
//!
//! The controller treats every store error as a PersistenceFailure: logged,
//! never allowed to hold up a turn. [`MemoryStore`] doubles as the memory-only
//! fallback when the sled database cannot be opened.

use crate::error::CoreResult;
use crate::memory::{ConversationTurn, Role};
use crate::session::SessionHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

const AGENT_KEY: &[u8] = b"default";

/// Persona data the prompts are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub personality: String,
    pub history: String,
    /// Durable learnings distilled from past sessions
    pub learnings: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            personality: "Warm, curious and concise. Speaks in short, natural sentences \
                          and asks one question at a time."
                .to_string(),
            history: "A voice companion that has just been set up and is getting to know \
                      the person it talks with."
                .to_string(),
            learnings: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// First and last message of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGist {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub first: Option<StoredMessage>,
    pub last: Option<StoredMessage>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn start_session(&self, session: &SessionHandle) -> CoreResult<()>;

    async fn end_session(&self, session: &SessionHandle) -> CoreResult<()>;

    async fn log_message(&self, session_id: Uuid, turn: &ConversationTurn) -> CoreResult<()>;

    async fn agent_config(&self) -> CoreResult<AgentConfig>;

    async fn update_learnings(&self, learnings: &str) -> CoreResult<()>;

    /// Most recent finished sessions first.
    async fn recent_session_gists(&self, limit: usize) -> CoreResult<Vec<SessionGist>>;

    async fn last_session_ended_at(&self) -> CoreResult<Option<DateTime<Utc>>>;

    async fn total_sessions(&self) -> CoreResult<u64>;
}

fn message_of(session_id: Uuid, turn: &ConversationTurn) -> StoredMessage {
    StoredMessage {
        session_id,
        role: turn.role,
        content: turn.content.clone(),
        timestamp: turn.timestamp,
    }
}

/// Sled-backed store: trees `sessions`, `messages` and `agent_config`.
pub struct SledStore {
    db: Db,
    sessions: Tree,
    messages: Tree,
    agent: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self {
            sessions: db.open_tree("sessions")?,
            messages: db.open_tree("messages")?,
            agent: db.open_tree("agent_config")?,
            db,
        };
        if store.agent.get(AGENT_KEY)?.is_none() {
            info!(target: "companion::store", "Seeding default agent config");
            store
                .agent
                .insert(AGENT_KEY, serde_json::to_vec(&AgentConfig::default())?)?;
        }
        info!(target: "companion::store", "📚 Conversation store at {}", path.as_ref().display());
        Ok(store)
    }

    fn session_records(&self) -> CoreResult<Vec<SessionHandle>> {
        self.sessions
            .iter()
            .values()
            .map(|v| Ok(serde_json::from_slice::<SessionHandle>(&v?)?))
            .collect()
    }

    fn session_messages(&self, session_id: Uuid) -> CoreResult<Vec<StoredMessage>> {
        self.messages
            .scan_prefix(session_id.as_bytes())
            .values()
            .map(|v| Ok(serde_json::from_slice::<StoredMessage>(&v?)?))
            .collect()
    }
}

#[async_trait]
impl ConversationStore for SledStore {
    async fn start_session(&self, session: &SessionHandle) -> CoreResult<()> {
        self.sessions
            .insert(session.id.as_bytes(), serde_json::to_vec(session)?)?;
        Ok(())
    }

    async fn end_session(&self, session: &SessionHandle) -> CoreResult<()> {
        let mut record = session.clone();
        record.close();
        self.sessions
            .insert(session.id.as_bytes(), serde_json::to_vec(&record)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn log_message(&self, session_id: Uuid, turn: &ConversationTurn) -> CoreResult<()> {
        // session id prefix + monotonic id keeps one session's messages ordered and contiguous
        let mut key = session_id.as_bytes().to_vec();
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        self.messages
            .insert(key, serde_json::to_vec(&message_of(session_id, turn))?)?;
        Ok(())
    }

    async fn agent_config(&self) -> CoreResult<AgentConfig> {
        match self.agent.get(AGENT_KEY)? {
            Some(v) => Ok(serde_json::from_slice(&v)?),
            None => Ok(AgentConfig::default()),
        }
    }

    async fn update_learnings(&self, learnings: &str) -> CoreResult<()> {
        let mut agent = self.agent_config().await?;
        agent.learnings = learnings.to_string();
        self.agent.insert(AGENT_KEY, serde_json::to_vec(&agent)?)?;
        Ok(())
    }

    async fn recent_session_gists(&self, limit: usize) -> CoreResult<Vec<SessionGist>> {
        let mut finished: Vec<SessionHandle> = self
            .session_records()?
            .into_iter()
            .filter(|s| s.ended_at.is_some())
            .collect();
        finished.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        finished
            .into_iter()
            .take(limit)
            .map(|s| {
                let messages = self.session_messages(s.id)?;
                Ok(SessionGist {
                    session_id: s.id,
                    started_at: s.started_at,
                    first: messages.first().cloned(),
                    last: messages.last().cloned(),
                })
            })
            .collect()
    }

    async fn last_session_ended_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .session_records()?
            .into_iter()
            .filter_map(|s| s.ended_at)
            .max())
    }

    async fn total_sessions(&self) -> CoreResult<u64> {
        Ok(self.sessions.len() as u64)
    }
}

#[derive(Default)]
struct MemoryInner {
    sessions: Vec<SessionHandle>,
    messages: Vec<StoredMessage>,
    agent: AgentConfig,
}

/// Volatile store for debug runs and as the fallback when sled is unavailable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().await.messages.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn start_session(&self, session: &SessionHandle) -> CoreResult<()> {
        self.inner.lock().await.sessions.push(session.clone());
        Ok(())
    }

    async fn end_session(&self, session: &SessionHandle) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.sessions.iter_mut().find(|s| s.id == session.id) {
            record.close();
        }
        Ok(())
    }

    async fn log_message(&self, session_id: Uuid, turn: &ConversationTurn) -> CoreResult<()> {
        self.inner
            .lock()
            .await
            .messages
            .push(message_of(session_id, turn));
        Ok(())
    }

    async fn agent_config(&self) -> CoreResult<AgentConfig> {
        Ok(self.inner.lock().await.agent.clone())
    }

    async fn update_learnings(&self, learnings: &str) -> CoreResult<()> {
        self.inner.lock().await.agent.learnings = learnings.to_string();
        Ok(())
    }

    async fn recent_session_gists(&self, limit: usize) -> CoreResult<Vec<SessionGist>> {
        let inner = self.inner.lock().await;
        let mut finished: Vec<&SessionHandle> =
            inner.sessions.iter().filter(|s| s.ended_at.is_some()).collect();
        finished.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(finished
            .into_iter()
            .take(limit)
            .map(|s| {
                let mut own = inner.messages.iter().filter(|m| m.session_id == s.id);
                let first = own.next().cloned();
                let last = own.last().cloned().or_else(|| first.clone());
                SessionGist {
                    session_id: s.id,
                    started_at: s.started_at,
                    first,
                    last,
                }
            })
            .collect())
    }

    async fn last_session_ended_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .iter()
            .filter_map(|s| s.ended_at)
            .max())
    }

    async fn total_sessions(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().await.sessions.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ConversationStore) {
        let mut session = SessionHandle::start();
        store.start_session(&session).await.unwrap();
        store
            .log_message(session.id, &ConversationTurn::user("Hello"))
            .await
            .unwrap();
        store
            .log_message(session.id, &ConversationTurn::assistant("Hi! How are you?"))
            .await
            .unwrap();
        store
            .log_message(session.id, &ConversationTurn::user("bye"))
            .await
            .unwrap();
        assert!(store.recent_session_gists(3).await.unwrap().is_empty());

        session.close();
        store.end_session(&session).await.unwrap();

        let gists = store.recent_session_gists(3).await.unwrap();
        assert_eq!(gists.len(), 1);
        assert_eq!(gists[0].first.as_ref().unwrap().content, "Hello");
        assert_eq!(gists[0].last.as_ref().unwrap().content, "bye");
        assert_eq!(store.total_sessions().await.unwrap(), 1);
        assert!(store.last_session_ended_at().await.unwrap().is_some());

        store.update_learnings("Prefers short answers.").await.unwrap();
        let agent = store.agent_config().await.unwrap();
        assert_eq!(agent.learnings, "Prefers short answers.");
        assert!(!agent.personality.is_empty());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&SledStore::open(dir.path().join("db")).unwrap()).await;
    }

    #[tokio::test]
    async fn sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = SledStore::open(&path).unwrap();
            store.update_learnings("Likes jazz.").await.unwrap();
            store.db.flush_async().await.unwrap();
        }
        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.agent_config().await.unwrap().learnings, "Likes jazz.");
    }
}
