use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::local_store::BoxFuture;
use super::remote_store::{Page, RemoteStore};
use crate::models::{Conversation, ConversationPatch, Message, MessagePatch};

#[derive(Default)]
struct ServerState {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_id: u64,
}

/// In-process stand-in for the remote endpoints.
/// Useful for testing and offline development
///
/// By default it behaves like a server that assigns its own canonical message
/// ids and echoes the client's `client_id` back.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    state: Arc<Mutex<ServerState>>,
    offline: Arc<AtomicBool>,
    assign_ids: bool,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            offline: Arc::new(AtomicBool::new(false)),
            assign_ids: true,
        }
    }

    /// A server that keeps the ids clients send instead of assigning its own.
    pub fn adopting_client_ids() -> Self {
        Self {
            assign_ids: false,
            ..Self::new()
        }
    }

    /// Simulate a network outage: every call fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seed server-side state directly.
    pub fn insert_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock();
        state.conversations.retain(|c| c.id != conversation.id);
        state.conversations.push(conversation);
    }

    /// Seed server-side state directly.
    pub fn insert_message(&self, message: Message) {
        let mut state = self.state.lock();
        state.messages.retain(|m| m.id != message.id);
        state.messages.push(message);
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }

    fn check_online(offline: &AtomicBool) -> RepositoryResult<()> {
        if offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable {
                message: "remote offline".to_string(),
            });
        }
        Ok(())
    }

    fn not_found(what: &str) -> RepositoryError {
        RepositoryError::StatusError {
            status: 404,
            url: what.to_string(),
        }
    }

    fn paginate<T: Clone>(items: &[T], cursor: Option<String>, limit: usize) -> Page<T> {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + limit.max(1)).min(items.len());
        let page = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        Page {
            items: page,
            next_cursor: (end < items.len()).then(|| end.to_string()),
        }
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn list_conversations(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Conversation>>> {
        let state = self.state.clone();
        let offline = self.offline.clone();

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut conversations = state.lock().conversations.clone();
            conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
            Ok(Self::paginate(&conversations, cursor, limit))
        })
    }

    fn get_conversation(
        &self,
        id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let id = id.to_string();

        Box::pin(async move {
            Self::check_online(&offline)?;
            Ok(state
                .lock()
                .conversations
                .iter()
                .find(|c| c.id == id)
                .cloned())
        })
    }

    fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>> {
        let state = self.state.clone();
        let offline = self.offline.clone();

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut stored = conversation.for_remote();
            stored.revision += 1;
            let mut state = state.lock();
            state.conversations.retain(|c| c.id != stored.id);
            state.conversations.push(stored.clone());
            Ok(stored)
        })
    }

    fn patch_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let id = id.to_string();

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut state = state.lock();
            let conversation = state
                .conversations
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| Self::not_found(&id))?;
            patch.for_remote().apply(conversation, Utc::now());
            conversation.revision += 1;
            Ok(conversation.clone())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let id = id.to_string();

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut state = state.lock();
            state.conversations.retain(|c| c.id != id);
            state.messages.retain(|m| m.conversation_id != id);
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Message>>> {
        let store = self.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            Self::check_online(&store.offline)?;
            let messages = store.messages(&conversation_id);
            Ok(Self::paginate(&messages, cursor, limit))
        })
    }

    fn create_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<Message>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let assign_ids = self.assign_ids;

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut state = state.lock();
            let mut stored = message;
            if assign_ids {
                state.next_id += 1;
                stored.id = format!("srv-{}", state.next_id);
            }
            stored.revision += 1;

            let conversation_id = stored.conversation_id.clone();
            let created_at = stored.created_at;
            state.messages.retain(|m| m.id != stored.id);
            state.messages.push(stored.clone());
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.touch(created_at);
                conversation.revision += 1;
            }
            Ok(stored)
        })
    }

    fn patch_message(
        &self,
        _conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let message_id = message_id.to_string();

        Box::pin(async move {
            Self::check_online(&offline)?;
            let mut state = state.lock();
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| Self::not_found(&message_id))?;
            patch.apply(message);
            message.revision += 1;
            Ok(message.clone())
        })
    }

    fn delete_message(
        &self,
        _conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let offline = self.offline.clone();
        let message_id = message_id.to_string();

        Box::pin(async move {
            Self::check_online(&offline)?;
            state.lock().messages.retain(|m| m.id != message_id);
            Ok(())
        })
    }
}
