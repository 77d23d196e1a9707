use std::future::Future;
use std::pin::Pin;

use super::error::RepositoryResult;
use crate::models::{Conversation, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Local persistent store: two collections, each keyed by `id`.
///
/// `put_*` is an upsert. Message listings are ordered by `created_at`, ties
/// broken by first insertion.
pub trait LocalStore: Send + Sync + 'static {
    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>>;

    fn get_conversation(&self, id: &str)
    -> BoxFuture<'static, RepositoryResult<Option<Conversation>>>;

    fn put_conversation(&self, conversation: Conversation)
    -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete a conversation together with its messages
    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>>;

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>>;

    fn put_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Replace every message of a conversation with `messages`
    fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> BoxFuture<'static, RepositoryResult<()>>;
}
