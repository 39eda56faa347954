//! In-memory conversation and checkpoint stores.

use chrono::Utc;
use dashmap::DashMap;

use capgraph_core::{
    traits::{Checkpoint, CheckpointStore, ConversationStore},
    types::{ExecutionRecord, SessionInfo},
    Result,
};

/// In-memory conversation history.
pub struct InMemoryConversationStore {
    records: DashMap<String, Vec<ExecutionRecord>>,
    sessions: DashMap<String, SessionInfo>,
}

impl InMemoryConversationStore {
    /// Create a new in-memory conversation store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Get the number of known sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append_message(&self, record: ExecutionRecord) -> Result<()> {
        tracing::debug!(session_id = %record.session_id, role = %record.role, "Record appended");
        self.records
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn get_or_create_session(&self, session_id: &str) -> Result<SessionInfo> {
        Ok(self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo::new(session_id))
            .clone())
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .records
            .get(session_id)
            .map(|records| {
                let skip = records.len().saturating_sub(limit);
                records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn complete_turn(&self, session_id: &str) -> Result<()> {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo::new(session_id));
        session.turn_count += 1;
        session.updated_at = Utc::now();
        Ok(())
    }
}

/// In-memory approval checkpoints.
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, session_id: &str, checkpoint: Checkpoint) -> Result<()> {
        self.checkpoints.insert(session_id.to_string(), checkpoint);
        tracing::debug!(session_id = %session_id, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(session_id).map(|r| r.clone()))
    }

    async fn take(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let taken = self.checkpoints.remove(session_id).map(|(_, checkpoint)| checkpoint);
        if taken.is_some() {
            tracing::debug!(session_id = %session_id, "Checkpoint taken");
        }
        Ok(taken)
    }
}
