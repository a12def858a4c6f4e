//! Write-behind persistence.
//!
//! Store writes are queued and applied in order by one background task, so a
//! slow or failing store never holds up the event loop. Failures are logged
//! and dropped.

use crate::memory::ConversationTurn;
use crate::session::SessionHandle;
use crate::store::ConversationStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum JournalOp {
    StartSession(SessionHandle),
    Message(Uuid, ConversationTurn),
    EndSession(SessionHandle),
    Learnings(String),
}

impl JournalOp {
    fn name(&self) -> &'static str {
        match self {
            JournalOp::StartSession(_) => "start_session",
            JournalOp::Message(..) => "log_message",
            JournalOp::EndSession(_) => "end_session",
            JournalOp::Learnings(_) => "update_learnings",
        }
    }
}

#[derive(Clone)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalOp>,
}

impl Journal {
    /// Start the writer task. It exits once every `Journal` clone is dropped
    /// and the queue has drained.
    pub fn spawn(store: Arc<dyn ConversationStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    pub fn record(&self, op: JournalOp) {
        if let Err(e) = self.tx.send(op) {
            warn!(target: "companion::store", "Journal writer gone, dropping {}", e.0.name());
        }
    }
}

async fn run_writer(store: Arc<dyn ConversationStore>, mut rx: mpsc::UnboundedReceiver<JournalOp>) {
    while let Some(op) = rx.recv().await {
        let name = op.name();
        let result = match &op {
            JournalOp::StartSession(session) => store.start_session(session).await,
            JournalOp::Message(id, turn) => store.log_message(*id, turn).await,
            JournalOp::EndSession(session) => store.end_session(session).await,
            JournalOp::Learnings(text) => store.update_learnings(text).await,
        };
        match result {
            Ok(()) => debug!(target: "companion::store", "{} ok", name),
            Err(e) => warn!(target: "companion::store", "Persistence failure in {}: {}", name, e),
        }
    }
    debug!(target: "companion::store", "Journal drained");
}
