use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation as seen by the sync engine.
///
/// `model_id` is a client-local preference. It is never sent to the remote
/// unless a patch explicitly asks for it to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Create an empty conversation. An empty `id` is filled in by the write pipeline.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            starred: false,
            archived: false,
            is_public: false,
            revision: 0,
            forked_from_conversation_id: None,
            forked_from_message_id: None,
            forked_at: None,
            model_id: None,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        }
    }

    /// Record that a message was written at `at`.
    ///
    /// Both timestamps only ever move forward.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_message_at = Some(match self.last_message_at {
            Some(existing) => existing.max(at),
            None => at,
        });
        self.updated_at = self.updated_at.max(at);
    }

    /// Copy of this conversation stripped of client-only fields, for remote writes.
    pub fn for_remote(&self) -> Self {
        Self {
            model_id: None,
            ..self.clone()
        }
    }
}

/// Partial update of a conversation's user-editable fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Whether `model_id` should also be written to the remote.
    #[serde(skip)]
    pub persist_model_id: bool,
}

impl ConversationPatch {
    pub fn apply(&self, conversation: &mut Conversation, at: DateTime<Utc>) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(starred) = self.starred {
            conversation.starred = starred;
        }
        if let Some(archived) = self.archived {
            conversation.archived = archived;
        }
        if let Some(is_public) = self.is_public {
            conversation.is_public = is_public;
        }
        if let Some(model_id) = &self.model_id {
            conversation.model_id = Some(model_id.clone());
        }
        conversation.updated_at = conversation.updated_at.max(at);
    }

    /// The patch as it should travel to the remote store.
    pub fn for_remote(&self) -> Self {
        Self {
            model_id: if self.persist_model_id {
                self.model_id.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.starred.is_none()
            && self.archived.is_none()
            && self.is_public.is_none()
            && self.model_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_touch_is_monotonic() {
        let mut conv = Conversation::new("c1", "Test");
        let later = conv.created_at + Duration::seconds(10);
        let earlier = conv.created_at + Duration::seconds(5);

        conv.touch(later);
        conv.touch(earlier);

        assert_eq!(conv.last_message_at, Some(later));
        assert_eq!(conv.updated_at, later);
    }

    #[test]
    fn test_remote_copy_drops_model_id() {
        let mut conv = Conversation::new("c1", "Test");
        conv.model_id = Some("gpt-x".to_string());

        let json = serde_json::to_value(conv.for_remote()).unwrap();
        assert!(json.get("modelId").is_none());
        assert_eq!(json["isPublic"], false);
    }

    #[test]
    fn test_patch_keeps_model_id_local_unless_persisted() {
        let patch = ConversationPatch {
            model_id: Some("gpt-x".to_string()),
            ..Default::default()
        };
        assert_eq!(patch.for_remote().model_id, None);

        let persisted = ConversationPatch {
            persist_model_id: true,
            ..patch
        };
        assert_eq!(persisted.for_remote().model_id.as_deref(), Some("gpt-x"));
    }

    #[test]
    fn test_patch_apply() {
        let mut conv = Conversation::new("c1", "Old");
        let patch = ConversationPatch {
            title: Some("New".to_string()),
            starred: Some(true),
            ..Default::default()
        };
        patch.apply(&mut conv, Utc::now());

        assert_eq!(conv.title, "New");
        assert!(conv.starred);
        assert!(!conv.archived);
    }
}
