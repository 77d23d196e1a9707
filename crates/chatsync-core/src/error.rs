use thiserror::Error;

use crate::models::SessionPhase;
use crate::repositories::RepositoryError;

/// Failures surfaced by the sync engine.
///
/// Most of these never reach a caller: remote and stream failures are logged and
/// the engine degrades to "local state is stale". The variants still exist so the
/// log lines carry a consistent shape.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(#[source] RepositoryError),

    #[error("Malformed stream record: {message}")]
    StreamParse { message: String },

    #[error("Local persistence failed: {0}")]
    LocalPersistence(#[source] RepositoryError),

    #[error("Failed to revoke public share of conversation {conversation_id}: {source}")]
    ShareRevocation {
        conversation_id: String,
        #[source]
        source: RepositoryError,
    },

    #[error("Remote write failed: {0}")]
    RemoteWrite(#[source] RepositoryError),

    #[error("Conversation {conversation_id} already has an active generation")]
    SessionBusy { conversation_id: String },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message {message_id} cannot be regenerated: {reason}")]
    InvalidTarget { message_id: String, reason: String },

    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },
}

pub type SyncResult<T> = Result<T, SyncError>;
