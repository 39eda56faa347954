//! Persistence traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConversationState, ExecutionRecord, SessionInfo};

/// Cross-turn conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append one record to the session's history.
    async fn append_message(&self, record: ExecutionRecord) -> Result<()>;

    /// Fetch a session, creating it when absent.
    async fn get_or_create_session(&self, session_id: &str) -> Result<SessionInfo>;

    /// The last `limit` records of a session, oldest first.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;

    /// Mark the current turn finished.
    async fn complete_turn(&self, session_id: &str) -> Result<()>;
}

/// A suspended graph run waiting for human input.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    /// Node to continue from on resume.
    pub resume_node: String,
    pub state: ConversationState,
}

/// Storage for HumanApproval checkpoints, keyed by session id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, session_id: &str, checkpoint: Checkpoint) -> Result<()>;

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>>;

    /// Remove and return the checkpoint in one step, so a checkpoint is
    /// resumed at most once.
    async fn take(&self, session_id: &str) -> Result<Option<Checkpoint>>;
}
