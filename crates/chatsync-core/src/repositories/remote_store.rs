use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use super::local_store::BoxFuture;
use crate::models::{Conversation, ConversationPatch, Message, MessagePatch};

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The remote source of truth.
pub trait RemoteStore: Send + Sync + 'static {
    fn list_conversations(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Conversation>>>;

    fn get_conversation(&self, id: &str)
    -> BoxFuture<'static, RepositoryResult<Option<Conversation>>>;

    fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>>;

    fn patch_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>>;

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Message>>>;

    /// Create a message. The returned record is canonical and may carry a
    /// server-assigned id; the original `client_id` is echoed back.
    fn create_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<Message>>;

    fn patch_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> BoxFuture<'static, RepositoryResult<Message>>;

    fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>>;
}
