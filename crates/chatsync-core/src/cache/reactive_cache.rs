use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::models::{Conversation, Message};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Conversations,
    Messages(String),
}

/// Change notifications for observers of the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ConversationsChanged,
    MessagesChanged { conversation_id: String },
    Invalidated { key: CacheKey },
}

#[derive(Default)]
struct CacheState {
    conversations: HashMap<String, Conversation>,
    conversations_loaded: bool,
    messages: HashMap<String, Vec<Message>>,
}

/// Reactive in-memory cache observed by the rendering layer.
///
/// Writes are synchronous and each emits a [`CacheEvent`]. Message lists are
/// kept sorted by `created_at`; entries with equal timestamps keep insertion order.
pub struct ReactiveCache {
    state: RwLock<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for ReactiveCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `last_message_at` descending, conversations without messages last.
pub(crate) fn by_recent_activity(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_message_at, b.last_message_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl ReactiveCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Whether the conversation list has been populated since the last invalidation.
    pub fn has_conversations(&self) -> bool {
        self.state.read().conversations_loaded
    }

    /// All conversations, most recently active first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.state.read().conversations.values().cloned().collect();
        conversations.sort_by(by_recent_activity);
        conversations
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state.read().conversations.get(id).cloned()
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        {
            let mut state = self.state.write();
            state.conversations = conversations
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();
            state.conversations_loaded = true;
        }
        self.emit(CacheEvent::ConversationsChanged);
    }

    pub fn upsert_conversation(&self, conversation: Conversation) {
        self.state
            .write()
            .conversations
            .insert(conversation.id.clone(), conversation);
        self.emit(CacheEvent::ConversationsChanged);
    }

    /// Remove a conversation and its cached messages.
    pub fn remove_conversation(&self, id: &str) -> Option<Conversation> {
        let removed = {
            let mut state = self.state.write();
            state.messages.remove(id);
            state.conversations.remove(id)
        };
        if removed.is_some() {
            self.emit(CacheEvent::ConversationsChanged);
        }
        removed
    }

    /// Bump `last_message_at`/`updated_at`. Returns the updated conversation.
    pub fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Option<Conversation> {
        let touched = {
            let mut state = self.state.write();
            state.conversations.get_mut(id).map(|conversation| {
                conversation.touch(at);
                conversation.clone()
            })
        };
        if touched.is_some() {
            self.emit(CacheEvent::ConversationsChanged);
        }
        touched
    }

    pub fn has_messages(&self, conversation_id: &str) -> bool {
        self.state.read().messages.contains_key(conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.state.read().messages.get(conversation_id).cloned()
    }

    /// Find a message in any cached conversation.
    pub fn message(&self, id: &str) -> Option<Message> {
        self.state
            .read()
            .messages
            .values()
            .flat_map(|messages| messages.iter())
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn set_messages(&self, conversation_id: &str, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.state
            .write()
            .messages
            .insert(conversation_id.to_string(), messages);
        self.emit(CacheEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Replace a message in place, or insert it in `created_at` order.
    pub fn upsert_message(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        {
            let mut state = self.state.write();
            let messages = state.messages.entry(conversation_id.clone()).or_default();
            if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
                *existing = message;
            } else {
                let position = messages.partition_point(|m| m.created_at <= message.created_at);
                messages.insert(position, message);
            }
        }
        self.emit(CacheEvent::MessagesChanged { conversation_id });
    }

    pub fn remove_message(&self, id: &str) -> Option<Message> {
        let removed = {
            let mut state = self.state.write();
            state.messages.values_mut().find_map(|messages| {
                let index = messages.iter().position(|m| m.id == id)?;
                Some(messages.remove(index))
            })
        };
        if let Some(message) = &removed {
            self.emit(CacheEvent::MessagesChanged {
                conversation_id: message.conversation_id.clone(),
            });
        }
        removed
    }

    /// Drop a cached entry so the next read goes back to storage.
    pub fn invalidate(&self, key: CacheKey) {
        {
            let mut state = self.state.write();
            match &key {
                CacheKey::Conversations => {
                    state.conversations.clear();
                    state.conversations_loaded = false;
                }
                CacheKey::Messages(conversation_id) => {
                    state.messages.remove(conversation_id);
                }
            }
        }
        self.emit(CacheEvent::Invalidated { key });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageContent, Role};
    use chrono::Duration;

    fn message(id: &str, at: DateTime<Utc>) -> Message {
        let mut m = Message::new("c1", Role::User, id);
        m.id = id.to_string();
        m.created_at = at;
        m
    }

    #[test]
    fn test_conversations_sorted_with_empty_last() {
        let cache = ReactiveCache::new();
        let now = Utc::now();
        let mut older = Conversation::new("older", "");
        older.touch(now);
        let mut newer = Conversation::new("newer", "");
        newer.touch(now + Duration::seconds(1));
        cache.set_conversations(vec![Conversation::new("empty", ""), older, newer]);

        let ids: Vec<String> = cache.conversations().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["newer", "older", "empty"]);
    }

    #[test]
    fn test_upsert_message_keeps_order_and_replaces() {
        let cache = ReactiveCache::new();
        let now = Utc::now();
        cache.upsert_message(message("b", now + Duration::seconds(2)));
        cache.upsert_message(message("a", now));
        cache.upsert_message(message("tie", now));

        let mut edited = message("a", now);
        edited.content = MessageContent::text("edited");
        cache.upsert_message(edited);

        let messages = cache.messages("c1").unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "tie", "b"]);
        assert_eq!(messages[0].visible_text(), "edited");
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let cache = ReactiveCache::new();
        let mut events = cache.subscribe();

        cache.upsert_message(message("a", Utc::now()));
        cache.invalidate(CacheKey::Messages("c1".to_string()));

        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::MessagesChanged {
                conversation_id: "c1".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Invalidated {
                key: CacheKey::Messages("c1".to_string())
            }
        );
        assert!(!cache.has_messages("c1"));
    }

    #[test]
    fn test_touch_and_remove() {
        let cache = ReactiveCache::new();
        cache.upsert_conversation(Conversation::new("c1", ""));
        cache.upsert_message(message("m1", Utc::now()));

        let at = Utc::now() + Duration::seconds(3);
        let touched = cache.touch_conversation("c1", at).unwrap();
        assert_eq!(touched.last_message_at, Some(at));

        assert!(cache.remove_message("m1").is_some());
        assert!(cache.remove_message("m1").is_none());
        assert!(cache.remove_conversation("c1").is_some());
        assert!(cache.touch_conversation("c1", at).is_none());
    }
}
