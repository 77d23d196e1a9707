use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::token_usage::{FinishMetadata, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentSegment {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    /// Parts this client does not render (images, tool payloads, ...).
    #[serde(other)]
    Other,
}

/// Message body. The remote sends either a plain string or a list of parts;
/// both land here and are read through [`MessageContent::visible_text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireContent", into = "WireContent")]
pub enum MessageContent {
    Flat { text: String },
    Parts { segments: Vec<ContentSegment> },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Flat(String),
    Parts(Vec<ContentSegment>),
}

impl From<WireContent> for MessageContent {
    fn from(wire: WireContent) -> Self {
        match wire {
            WireContent::Flat(text) => MessageContent::Flat { text },
            WireContent::Parts(segments) => MessageContent::Parts { segments },
        }
    }
}

impl From<MessageContent> for WireContent {
    fn from(content: MessageContent) -> Self {
        match content {
            MessageContent::Flat { text } => WireContent::Flat(text),
            MessageContent::Parts { segments } => WireContent::Parts(segments),
        }
    }
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Flat { text: text.into() }
    }

    /// The text a reader sees. Reasoning and non-text parts are skipped.
    pub fn visible_text(&self) -> String {
        match self {
            MessageContent::Flat { text } => text.clone(),
            MessageContent::Parts { segments } => segments
                .iter()
                .filter_map(|segment| match segment {
                    ContentSegment::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.visible_text().is_empty()
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::text("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningState {
    Streaming,
    Done,
}

/// A span of model deliberation, kept apart from the visible answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningSegment {
    pub text: String,
    pub state: ReasoningState,
}

impl ReasoningSegment {
    pub fn streaming(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: ReasoningState::Streaming,
        }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: ReasoningState::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_json: Option<Value>,
    #[serde(default)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an unsaved message. The write pipeline assigns `id` and `client_id`.
    pub fn new(conversation_id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            conversation_id: conversation_id.into(),
            role,
            content: MessageContent::text(text),
            client_id: None,
            meta_json: None,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    pub fn visible_text(&self) -> String {
        self.content.visible_text()
    }

    pub fn meta(&self) -> MessageMeta {
        self.meta_json
            .as_ref()
            .map(MessageMeta::from_value)
            .unwrap_or_default()
    }
}

/// Partial update of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_json: Option<Value>,
}

impl MessagePatch {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(MessageContent::text(text)),
            meta_json: None,
        }
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(meta) = &self.meta_json {
            message.meta_json = Some(meta.clone());
        }
    }
}

/// Typed view over the keys this engine owns inside `metaJson`.
///
/// `metaJson` is opaque: keys written by other clients are preserved by
/// [`MessageMeta::merge_into`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<ReasoningSegment>,
}

impl MessageMeta {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn from_finish(finish: &FinishMetadata) -> Self {
        Self {
            usage: finish.usage.clone(),
            model_id: finish.model_id.clone(),
            gateway_cost: finish.gateway_cost,
            reasoning: Vec::new(),
        }
    }

    /// Write the populated fields over `existing`, keeping unrelated keys.
    pub fn merge_into(&self, existing: Option<&Value>) -> Value {
        let mut object = match existing {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Ok(Value::Object(ours)) = serde_json::to_value(self) {
            for (key, value) in ours {
                object.insert(key, value);
            }
        }
        if self.reasoning.is_empty() {
            object.remove("reasoning");
        }
        Value::Object(object)
    }

    /// `existing` with every key this engine writes removed.
    pub fn without_owned(existing: Option<&Value>) -> Option<Value> {
        let Some(Value::Object(map)) = existing else {
            return None;
        };
        let mut object = map.clone();
        for key in Self::OWNED_KEYS {
            object.remove(key);
        }
        Some(Value::Object(object))
    }

    const OWNED_KEYS: [&'static str; 4] = ["usage", "modelId", "gatewayCost", "reasoning"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_accepts_string_or_parts() {
        let flat: MessageContent = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(flat, MessageContent::text("hello"));

        let parts: MessageContent = serde_json::from_value(json!([
            {"type": "reasoning", "text": "hmm"},
            {"type": "text", "text": "hel"},
            {"type": "image", "url": "x.png"},
            {"type": "text", "text": "lo"}
        ]))
        .unwrap();
        assert_eq!(parts.visible_text(), "hello");
    }

    #[test]
    fn test_content_serializes_back_to_wire_shape() {
        let flat = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(flat, json!("hi"));
    }

    #[test]
    fn test_message_wire_names() {
        let value = json!({
            "id": "m1",
            "conversationId": "c1",
            "role": "assistant",
            "content": "answer",
            "clientId": "k1",
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let message: Message = serde_json::from_value(value).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.client_id.as_deref(), Some("k1"));
        assert_eq!(message.revision, 0);
        assert!(message.meta_json.is_none());
    }

    #[test]
    fn test_meta_merge_preserves_foreign_keys() {
        let existing = json!({"pinned": true, "modelId": "old"});
        let meta = MessageMeta {
            model_id: Some("new".to_string()),
            gateway_cost: Some(0.5),
            ..Default::default()
        };

        let merged = meta.merge_into(Some(&existing));
        assert_eq!(merged["pinned"], true);
        assert_eq!(merged["modelId"], "new");
        assert_eq!(merged["gatewayCost"], 0.5);
    }

    #[test]
    fn test_without_owned_keeps_foreign_keys() {
        let existing = json!({
            "pinned": true,
            "modelId": "old",
            "gatewayCost": 9.99,
            "usage": {"inputTokens": 1, "outputTokens": 2},
            "reasoning": [{"text": "r", "state": "done"}]
        });
        let stripped = MessageMeta::without_owned(Some(&existing)).unwrap();
        assert_eq!(stripped, json!({"pinned": true}));
        assert!(MessageMeta::without_owned(None).is_none());
    }

    #[test]
    fn test_meta_merge_drops_stale_reasoning() {
        let existing = json!({"reasoning": [{"text": "old", "state": "done"}]});
        let merged = MessageMeta::default().merge_into(Some(&existing));
        assert!(merged.get("reasoning").is_none());
    }
}
