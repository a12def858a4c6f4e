//! Session handle and the per-session context loaded at wake time.

use crate::store::{AgentConfig, SessionGist};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One conversation, from wake to session end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionHandle {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn close(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Everything the prompts need about the companion and its past, read once per session.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub personality: String,
    pub history: String,
    pub learnings: String,
    pub recent_sessions: Vec<SessionGist>,
    pub last_session_ended_at: Option<DateTime<Utc>>,
    pub total_sessions: u64,
}

impl SessionContext {
    pub fn from_agent(agent: AgentConfig) -> Self {
        Self {
            personality: agent.personality,
            history: agent.history,
            learnings: agent.learnings,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let mut s = SessionHandle::start();
        assert!(s.is_open());
        s.close();
        let first = s.ended_at;
        s.close();
        assert_eq!(s.ended_at, first);
        assert!(!s.is_open());
    }
}
