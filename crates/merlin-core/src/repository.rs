use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RepositoryError;
use crate::ids::{SessionKey, SessionId};
use crate::prompt::Role;
use crate::stream::Usage;

/// A persisted conversation entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Session facts used to assemble a prompt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub title: String,
    pub character_name: Option<String>,
    pub story_brief: Option<String>,
    pub status_summary: Option<String>,
    pub location: Option<String>,
    pub in_combat: bool,
    pub character_sheet: Option<String>,
}

/// Everything the coordinator reads before prompting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnContext {
    pub session: SessionSnapshot,
    /// Most recent committed messages, oldest first.
    pub history: Vec<StoredMessage>,
}

/// Ids assigned when a unit of work commits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommittedTurn {
    pub user_message_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
}

/// Staged writes for one turn. Nothing is visible to readers until `commit`.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn append_user_turn(
        &mut self,
        content: &str,
        client_message_id: Option<&str>,
    ) -> Result<(), RepositoryError>;

    async fn append_assistant_turn(
        &mut self,
        content: &str,
        usage: &Usage,
    ) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<CommittedTurn, RepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Persistence collaborator of the turn coordinator.
#[async_trait]
pub trait TurnRepository: Send + Sync {
    /// Session facts plus up to `history_limit` of the latest messages.
    async fn load_context(
        &self,
        key: &SessionKey,
        history_limit: usize,
    ) -> Result<TurnContext, RepositoryError>;

    /// Open a unit of work for a session owned by `key.user_id`.
    async fn begin(&self, key: &SessionKey) -> Result<Box<dyn UnitOfWork>, RepositoryError>;
}
