use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{MessageMeta, ReasoningSegment, ReasoningState};
use super::token_usage::FinishMetadata;
use crate::error::{SyncError, SyncResult};
use crate::services::reasoning_extractor::{extract_reasoning, extract_streaming_reasoning};
use crate::services::stream_decoder::DecodedFrame;

/// Lifecycle of a generation.
///
/// Normal send: `Idle -> Submitted -> Streaming -> Done`.
/// Regeneration: `Idle -> Truncating -> Regenerating -> Done`.
/// Any active phase may end in `Error` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Submitted,
    Truncating,
    Streaming,
    Regenerating,
    Done,
    Error,
    Aborted,
}

impl SessionPhase {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionPhase::Submitted
                | SessionPhase::Truncating
                | SessionPhase::Streaming
                | SessionPhase::Regenerating
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Done | SessionPhase::Error | SessionPhase::Aborted
        )
    }

    fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Idle, Submitted) | (Idle, Truncating) => true,
            (Submitted, Streaming) | (Truncating, Regenerating) => true,
            (Streaming, Done) | (Regenerating, Done) => true,
            (from, Error) | (from, Aborted) => from.is_active(),
            _ => false,
        }
    }
}

/// Ephemeral state of one generation, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSession {
    pub conversation_id: String,
    pub target_message_id: String,
    /// Raw visible text as delivered, inline reasoning markers included.
    pub buffer: String,
    /// All structured reasoning received so far.
    pub reasoning_buffer: String,
    pub phase: SessionPhase,
    pub finish: Option<FinishMetadata>,
    pub error: Option<String>,
    structured_reasoning: Vec<ReasoningSegment>,
}

impl StreamingSession {
    pub fn new(conversation_id: impl Into<String>, target_message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            target_message_id: target_message_id.into(),
            buffer: String::new(),
            reasoning_buffer: String::new(),
            phase: SessionPhase::Idle,
            finish: None,
            error: None,
            structured_reasoning: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: SessionPhase) -> SyncResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        if next.is_terminal() {
            for segment in &mut self.structured_reasoning {
                segment.state = ReasoningState::Done;
            }
        }
        self.phase = next;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    /// Fold one decoded frame into the session. Returns whether anything visible changed.
    pub fn apply(&mut self, frame: &DecodedFrame) -> bool {
        let mut changed = false;

        if frame.reasoning_started {
            self.structured_reasoning
                .push(ReasoningSegment::streaming(String::new()));
        }
        if let Some(delta) = &frame.reasoning_delta {
            self.reasoning_buffer.push_str(delta);
            match self.structured_reasoning.last_mut() {
                Some(segment) if segment.state == ReasoningState::Streaming => {
                    segment.text.push_str(delta)
                }
                _ => self
                    .structured_reasoning
                    .push(ReasoningSegment::streaming(delta.clone())),
            }
            changed = true;
        }
        if frame.reasoning_ended
            && let Some(segment) = self.structured_reasoning.last_mut()
        {
            segment.state = ReasoningState::Done;
            changed = true;
        }
        if let Some(delta) = &frame.text_delta {
            self.buffer.push_str(delta);
            changed = true;
        }
        // Only the first finish record of a session counts.
        if self.finish.is_none()
            && let Some(finish) = &frame.finish
        {
            self.finish = Some(finish.clone());
        }
        if let Some(error) = &frame.error {
            self.error = Some(error.clone());
        }

        changed
    }

    pub fn has_structured_reasoning(&self) -> bool {
        !self.structured_reasoning.is_empty()
    }

    /// Visible answer with any inline reasoning markers removed.
    pub fn visible_text(&self) -> String {
        extract_reasoning(&self.buffer).visible
    }

    /// Visible answer for display while deltas are still arriving. Only ever
    /// grows as text is appended, even when a marker is split across deltas.
    pub fn live_visible_text(&self) -> String {
        extract_streaming_reasoning(&self.buffer).visible
    }

    /// Reasoning for the message. Structured reasoning wins over inline markers
    /// so a span delivered both ways is only counted once.
    pub fn reasoning_segments(&self) -> Vec<ReasoningSegment> {
        if self.has_structured_reasoning() {
            self.structured_reasoning
                .iter()
                .filter(|segment| !segment.text.is_empty())
                .cloned()
                .collect()
        } else {
            extract_reasoning(&self.buffer).segments
        }
    }

    /// `metaJson` for the target message with finish metadata and reasoning merged in.
    pub fn merged_meta(&self, existing: Option<&Value>) -> Value {
        let mut meta = self
            .finish
            .as_ref()
            .map(MessageMeta::from_finish)
            .unwrap_or_else(|| {
                let mut previous = existing.map(MessageMeta::from_value).unwrap_or_default();
                previous.reasoning.clear();
                previous
            });
        meta.reasoning = self.reasoning_segments();
        meta.merge_into(existing)
    }
}

/// Sessions keyed by conversation id. At most one active session per conversation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, StreamingSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, rejecting it if the conversation already has an active one.
    pub fn begin(&self, session: StreamingSession) -> SyncResult<()> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&session.conversation_id)
            && existing.is_active()
        {
            return Err(SyncError::SessionBusy {
                conversation_id: session.conversation_id,
            });
        }
        sessions.insert(session.conversation_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, conversation_id: &str) -> Option<StreamingSession> {
        self.sessions.lock().get(conversation_id).cloned()
    }

    pub fn update<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut StreamingSession) -> R,
    ) -> Option<R> {
        self.sessions.lock().get_mut(conversation_id).map(f)
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.sessions
            .lock()
            .get(conversation_id)
            .is_some_and(StreamingSession::is_active)
    }

    /// Id of the message currently being written by an active session.
    pub fn streaming_target(&self, conversation_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(conversation_id)
            .filter(|session| session.is_active())
            .map(|session| session.target_message_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenUsage;

    fn text(delta: &str) -> DecodedFrame {
        DecodedFrame {
            text_delta: Some(delta.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_send_lifecycle() {
        let mut session = StreamingSession::new("c1", "m1");
        session.transition(SessionPhase::Submitted).unwrap();
        session.transition(SessionPhase::Streaming).unwrap();
        session.transition(SessionPhase::Done).unwrap();
        assert!(session.phase.is_terminal());
    }

    #[test]
    fn test_regenerate_lifecycle() {
        let mut session = StreamingSession::new("c1", "m1");
        session.transition(SessionPhase::Truncating).unwrap();
        session.transition(SessionPhase::Regenerating).unwrap();
        session.transition(SessionPhase::Done).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut session = StreamingSession::new("c1", "m1");
        assert!(session.transition(SessionPhase::Streaming).is_err());
        assert!(session.transition(SessionPhase::Aborted).is_err());

        session.transition(SessionPhase::Submitted).unwrap();
        assert!(session.transition(SessionPhase::Regenerating).is_err());
        session.transition(SessionPhase::Aborted).unwrap();
        assert!(session.transition(SessionPhase::Done).is_err());
    }

    #[test]
    fn test_finish_recorded_once() {
        let mut session = StreamingSession::new("c1", "m1");
        let first = DecodedFrame {
            finish: Some(FinishMetadata {
                usage: Some(TokenUsage::new(1, 2)),
                model_id: Some("first".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let second = DecodedFrame {
            finish: Some(FinishMetadata {
                model_id: Some("second".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        session.apply(&first);
        session.apply(&second);

        let meta = session.merged_meta(None);
        assert_eq!(meta["modelId"], "first");
        assert_eq!(meta["usage"]["outputTokens"], 2);
    }

    #[test]
    fn test_inline_reasoning_when_no_structured() {
        let mut session = StreamingSession::new("c1", "m1");
        session.apply(&text("<think>plan"));
        session.apply(&text("</think>answer"));

        assert_eq!(session.visible_text(), "answer");
        assert_eq!(
            session.reasoning_segments(),
            vec![ReasoningSegment::done("plan")]
        );
    }

    #[test]
    fn test_live_text_waits_for_split_marker() {
        let mut session = StreamingSession::new("c1", "m1");
        session.apply(&text("Hi <thi"));
        assert_eq!(session.live_visible_text(), "Hi ");
        assert_eq!(session.visible_text(), "Hi <thi");

        session.apply(&text("nk>r</think>ok"));
        assert_eq!(session.live_visible_text(), "Hi ok");
        assert_eq!(session.visible_text(), "Hi ok");
    }

    #[test]
    fn test_structured_reasoning_takes_precedence() {
        let mut session = StreamingSession::new("c1", "m1");
        session.apply(&DecodedFrame {
            reasoning_delta: Some("plan".to_string()),
            ..Default::default()
        });
        session.apply(&text("<think>plan</think>answer"));

        assert_eq!(session.visible_text(), "answer");
        let segments = session.reasoning_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "plan");
        assert_eq!(segments[0].state, ReasoningState::Streaming);

        session.transition(SessionPhase::Submitted).unwrap();
        session.transition(SessionPhase::Streaming).unwrap();
        session.transition(SessionPhase::Done).unwrap();
        assert_eq!(session.reasoning_segments()[0].state, ReasoningState::Done);
    }

    #[test]
    fn test_registry_rejects_second_active_session() {
        let registry = SessionRegistry::new();
        let mut first = StreamingSession::new("c1", "m1");
        first.transition(SessionPhase::Submitted).unwrap();
        registry.begin(first).unwrap();

        let mut second = StreamingSession::new("c1", "m2");
        second.transition(SessionPhase::Truncating).unwrap();
        assert!(matches!(
            registry.begin(second.clone()),
            Err(SyncError::SessionBusy { .. })
        ));
        assert_eq!(registry.streaming_target("c1").as_deref(), Some("m1"));

        registry.update("c1", |s| s.transition(SessionPhase::Aborted));
        assert!(registry.streaming_target("c1").is_none());
        registry.begin(second).unwrap();
    }
}
