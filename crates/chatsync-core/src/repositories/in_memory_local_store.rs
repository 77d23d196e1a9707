use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::local_store::{BoxFuture, LocalStore};
use crate::models::{Conversation, Message};

#[derive(Default)]
struct Collections {
    conversations: HashMap<String, Conversation>,
    /// Message plus its first-insertion sequence number
    messages: HashMap<String, (u64, Message)>,
    next_seq: u64,
}

impl Collections {
    fn upsert_message(&mut self, message: Message) {
        let seq = match self.messages.get(&message.id) {
            Some((seq, _)) => *seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.messages.insert(message.id.clone(), (seq, message));
    }

    fn messages_of(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<&(u64, Message)> = self
            .messages
            .values()
            .filter(|(_, m)| m.conversation_id == conversation_id)
            .collect();
        messages.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        messages.into_iter().map(|(_, m)| m.clone()).collect()
    }
}

/// In-memory local store.
/// Useful for testing and development
#[derive(Clone, Default)]
pub struct InMemoryLocalStore {
    collections: Arc<Mutex<Collections>>,
    failing_writes: Arc<AtomicUsize>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail, to exercise retry paths.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(failing: &AtomicUsize) -> RepositoryResult<()> {
        let injected = failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepositoryError::Unavailable {
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

impl LocalStore for InMemoryLocalStore {
    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let collections = self.collections.clone();

        Box::pin(async move {
            let store = collections.lock();
            let mut result: Vec<Conversation> = store.conversations.values().cloned().collect();

            // Most recent activity first
            result.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

            Ok(result)
        })
    }

    fn get_conversation(
        &self,
        id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let collections = self.collections.clone();
        let id = id.to_string();

        Box::pin(async move { Ok(collections.lock().conversations.get(&id).cloned()) })
    }

    fn put_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let collections = self.collections.clone();
        let failing = self.failing_writes.clone();

        Box::pin(async move {
            Self::check_write(&failing)?;
            collections
                .lock()
                .conversations
                .insert(conversation.id.clone(), conversation);
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let collections = self.collections.clone();
        let failing = self.failing_writes.clone();
        let id = id.to_string();

        Box::pin(async move {
            Self::check_write(&failing)?;
            let mut store = collections.lock();
            store.conversations.remove(&id);
            store.messages.retain(|_, (_, m)| m.conversation_id != id);
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let collections = self.collections.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move { Ok(collections.lock().messages_of(&conversation_id)) })
    }

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>> {
        let collections = self.collections.clone();
        let id = id.to_string();

        Box::pin(async move {
            Ok(collections
                .lock()
                .messages
                .get(&id)
                .map(|(_, m)| m.clone()))
        })
    }

    fn put_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let collections = self.collections.clone();
        let failing = self.failing_writes.clone();

        Box::pin(async move {
            Self::check_write(&failing)?;
            collections.lock().upsert_message(message);
            Ok(())
        })
    }

    fn delete_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let collections = self.collections.clone();
        let failing = self.failing_writes.clone();
        let id = id.to_string();

        Box::pin(async move {
            Self::check_write(&failing)?;
            collections.lock().messages.remove(&id);
            Ok(())
        })
    }

    fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let collections = self.collections.clone();
        let failing = self.failing_writes.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            Self::check_write(&failing)?;
            let mut store = collections.lock();
            let keep: std::collections::HashSet<&str> =
                messages.iter().map(|m| m.id.as_str()).collect();
            store
                .messages
                .retain(|id, (_, m)| m.conversation_id != conversation_id || keep.contains(id.as_str()));
            for message in messages {
                store.upsert_message(message);
            }
            Ok(())
        })
    }
}
