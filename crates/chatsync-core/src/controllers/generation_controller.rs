use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ReactiveCache;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Conversation, ConversationPatch, Message, MessageContent, MessageMeta, MessagePatch, Role,
    SessionPhase, SessionRegistry, StreamingSession, TokenUsage,
};
use crate::repositories::RemoteStore;
use crate::services::generation_gateway::{
    GenerationGateway, GenerationRequest, PromptMessage, RegenerationDirective, RegenerationMode,
};
use crate::services::stream_decoder::decode_stream;
use crate::services::write_pipeline::OptimisticWritePipeline;

const EVENT_CAPACITY: usize = 256;

/// Identifies the message a started generation writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegenerateOptions {
    pub mode: RegenerationMode,
    /// Free-form rewrite instruction, used with [`RegenerationMode::Custom`].
    pub instruction: Option<String>,
    /// Overrides the conversation's model for this generation.
    pub model_id: Option<String>,
}

/// Events emitted while generations run.
/// Each variant is tagged with `conversation_id` so subscribers can filter.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    StreamStarted {
        conversation_id: String,
        message_id: String,
    },
    TextDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    ReasoningDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    StreamEnded {
        conversation_id: String,
        message_id: String,
        phase: SessionPhase,
        usage: Option<TokenUsage>,
    },
}

struct ActiveStream {
    task: JoinHandle<()>,
    cancel_flag: Arc<AtomicBool>,
}

struct ControllerInner {
    pipeline: Arc<OptimisticWritePipeline>,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<ReactiveCache>,
    gateway: Arc<dyn GenerationGateway>,
    sessions: Arc<SessionRegistry>,
    streams: Mutex<HashMap<String, ActiveStream>>,
    events: broadcast::Sender<GenerationEvent>,
}

/// Drives sends, regenerations and branches.
///
/// At most one generation runs per conversation; starting a second one while
/// the first is active fails with [`SyncError::SessionBusy`]. Streamed output
/// is written into a single message id through the write pipeline.
#[derive(Clone)]
pub struct GenerationController {
    inner: Arc<ControllerInner>,
}

impl GenerationController {
    pub fn new(
        pipeline: Arc<OptimisticWritePipeline>,
        remote: Arc<dyn RemoteStore>,
        gateway: Arc<dyn GenerationGateway>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = pipeline.cache().clone();
        Self {
            inner: Arc::new(ControllerInner {
                pipeline,
                remote,
                cache,
                gateway,
                sessions,
                streams: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self, conversation_id: &str) -> Option<StreamingSession> {
        self.inner.sessions.get(conversation_id)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.inner.sessions.is_active(conversation_id)
    }

    /// Append a user message and stream the answer into a new assistant message.
    pub async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        model_id: Option<String>,
    ) -> SyncResult<SessionTicket> {
        let inner = &self.inner;
        let conversation = inner.find_conversation(conversation_id).await?;
        let history = inner.load_messages(conversation_id).await?;

        let assistant_id = Uuid::new_v4().to_string();
        let mut session = StreamingSession::new(conversation_id, &assistant_id);
        session.transition(SessionPhase::Submitted)?;
        inner.sessions.begin(session)?;

        let mut user = Message::new(conversation_id, Role::User, text);
        user.created_at = next_timestamp(&history);
        let mut assistant = Message::new(conversation_id, Role::Assistant, "");
        assistant.id = assistant_id.clone();
        assistant.created_at = user.created_at + Duration::milliseconds(1);

        for message in [user, assistant] {
            if let Err(e) = inner.pipeline.create_message(message).await {
                inner.fail(conversation_id, &assistant_id, &e);
                return Err(e);
            }
        }

        let mut messages: Vec<PromptMessage> = history.iter().filter_map(prompt_message).collect();
        messages.push(PromptMessage::new(Role::User, text));

        let request = GenerationRequest {
            conversation_id: conversation_id.to_string(),
            messages,
            model_id: model_id.or(conversation.model_id),
            regeneration: None,
        };
        inner.advance(conversation_id, SessionPhase::Streaming)?;
        info!(conversation_id = %conversation_id, message_id = %assistant_id, "Generation started");
        self.spawn_generation(conversation_id, &assistant_id, request);

        Ok(SessionTicket {
            conversation_id: conversation_id.to_string(),
            message_id: assistant_id,
        })
    }

    /// Re-run generation for an assistant message, keeping its id.
    ///
    /// Every message after the target is deleted first. A public share of the
    /// conversation is revoked before the new request goes out.
    pub async fn regenerate(
        &self,
        assistant_message_id: &str,
        options: RegenerateOptions,
    ) -> SyncResult<SessionTicket> {
        let inner = &self.inner;
        let target = inner
            .find_message(assistant_message_id)
            .await?
            .ok_or_else(|| SyncError::MessageNotFound(assistant_message_id.to_string()))?;
        if target.role != Role::Assistant {
            return Err(SyncError::InvalidTarget {
                message_id: target.id,
                reason: format!("role is {:?}, expected assistant", target.role),
            });
        }
        let conversation_id = target.conversation_id.clone();
        let conversation = inner.find_conversation(&conversation_id).await?;

        let messages = inner.load_messages(&conversation_id).await?;
        let position = messages
            .iter()
            .position(|m| m.id == target.id)
            .ok_or_else(|| SyncError::MessageNotFound(target.id.clone()))?;
        let last_user = messages[..position]
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or_else(|| SyncError::InvalidTarget {
                message_id: target.id.clone(),
                reason: "no user message precedes it".to_string(),
            })?;

        let mut session = StreamingSession::new(&conversation_id, &target.id);
        session.transition(SessionPhase::Truncating)?;
        inner.sessions.begin(session)?;

        let tail: Vec<String> = messages[position + 1..]
            .iter()
            .map(|m| m.id.clone())
            .collect();
        if !tail.is_empty() {
            debug!(conversation_id = %conversation_id, count = tail.len(), "Truncating tail");
        }
        if let Err(e) = inner.pipeline.delete_messages(&tail).await {
            inner.fail(&conversation_id, &target.id, &e);
            return Err(e);
        }

        let conversation_model = conversation.model_id.clone();
        if conversation.is_public {
            inner.revoke_share(conversation).await;
        }

        let reset = MessagePatch {
            meta_json: MessageMeta::without_owned(target.meta_json.as_ref()),
            ..MessagePatch::content("")
        };
        if let Err(e) = inner.pipeline.update_message(&target.id, reset).await {
            inner.fail(&conversation_id, &target.id, &e);
            return Err(e);
        }

        let directive = RegenerationDirective {
            mode: options.mode,
            instruction: options.instruction,
            assistant_text: target.visible_text(),
        };
        let mut prompt: Vec<PromptMessage> = Vec::new();
        if let Some(system) = directive.system_prompt() {
            prompt.push(PromptMessage::new(Role::System, system));
        }
        prompt.extend(messages[..=last_user].iter().filter_map(prompt_message));

        let request = GenerationRequest {
            conversation_id: conversation_id.clone(),
            messages: prompt,
            model_id: options.model_id.or(conversation_model),
            regeneration: Some(directive),
        };
        inner.advance(&conversation_id, SessionPhase::Regenerating)?;
        info!(conversation_id = %conversation_id, message_id = %target.id, "Regeneration started");
        self.spawn_generation(&conversation_id, &target.id, request);

        Ok(SessionTicket {
            conversation_id,
            message_id: target.id,
        })
    }

    /// Copy the conversation up to and including `message_id` into a new conversation.
    ///
    /// Every copied message gets a fresh id. Relative order is kept with
    /// synthetic timestamps one millisecond apart.
    pub async fn branch_from(&self, message_id: &str) -> SyncResult<Conversation> {
        let inner = &self.inner;
        let target = inner
            .find_message(message_id)
            .await?
            .ok_or_else(|| SyncError::MessageNotFound(message_id.to_string()))?;
        let source = inner.find_conversation(&target.conversation_id).await?;
        let messages = inner.load_messages(&source.id).await?;
        let position = messages
            .iter()
            .position(|m| m.id == target.id)
            .ok_or_else(|| SyncError::MessageNotFound(target.id.clone()))?;

        let now = Utc::now();
        let mut branch = Conversation::new(Uuid::new_v4().to_string(), source.title.clone());
        branch.forked_from_conversation_id = Some(source.id.clone());
        branch.forked_from_message_id = Some(target.id.clone());
        branch.forked_at = Some(now);
        branch.model_id = source.model_id.clone();
        let branch = inner.pipeline.create_conversation(branch).await?;

        for (index, original) in messages[..=position].iter().enumerate() {
            let copy = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: branch.id.clone(),
                client_id: None,
                revision: 0,
                created_at: now + Duration::milliseconds(index as i64),
                ..original.clone()
            };
            inner.pipeline.create_message(copy).await?;
        }

        info!(source = %source.id, branch = %branch.id, copied = position + 1, "Conversation branched");
        Ok(inner.cache.conversation(&branch.id).unwrap_or(branch))
    }

    /// Wait for the conversation's generation to finish and return its final state.
    pub async fn wait(&self, conversation_id: &str) -> Option<StreamingSession> {
        let active = self.inner.streams.lock().remove(conversation_id);
        if let Some(active) = active
            && let Err(e) = active.task.await
            && !e.is_cancelled()
        {
            warn!(conversation_id = %conversation_id, error = ?e, "Generation task failed");
        }
        self.inner.sessions.get(conversation_id)
    }

    /// Stop the active generation. Text streamed so far is kept and persisted.
    pub async fn abort(&self, conversation_id: &str) -> SyncResult<()> {
        let active = self.inner.streams.lock().remove(conversation_id);
        let Some(active) = active else {
            debug!(conversation_id = %conversation_id, "No active stream to abort");
            return Ok(());
        };
        active.cancel_flag.store(true, Ordering::Relaxed);
        active.task.abort();
        let _ = active.task.await;

        let Some(session) = self.inner.sessions.get(conversation_id) else {
            return Ok(());
        };
        if !session.is_active() {
            return Ok(());
        }
        self.inner.persist(&session).await;
        self.inner.advance(conversation_id, SessionPhase::Aborted)?;
        info!(conversation_id = %conversation_id, "Generation aborted");
        self.inner.emit_ended(&session, SessionPhase::Aborted);
        Ok(())
    }

    fn spawn_generation(&self, conversation_id: &str, message_id: &str, request: GenerationRequest) {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_generation(
            self.inner.clone(),
            conversation_id.to_string(),
            message_id.to_string(),
            request,
            cancel_flag.clone(),
        ));
        self.inner
            .streams
            .lock()
            .insert(conversation_id.to_string(), ActiveStream { task, cancel_flag });
    }
}

impl ControllerInner {
    async fn find_message(&self, id: &str) -> SyncResult<Option<Message>> {
        if let Some(message) = self.cache.message(id) {
            return Ok(Some(message));
        }
        self.pipeline
            .local()
            .get_message(id)
            .await
            .map_err(SyncError::LocalPersistence)
    }

    async fn find_conversation(&self, id: &str) -> SyncResult<Conversation> {
        if let Some(conversation) = self.cache.conversation(id) {
            return Ok(conversation);
        }
        let conversation = self
            .pipeline
            .local()
            .get_conversation(id)
            .await
            .map_err(SyncError::LocalPersistence)?
            .ok_or_else(|| SyncError::ConversationNotFound(id.to_string()))?;
        self.cache.upsert_conversation(conversation.clone());
        Ok(conversation)
    }

    /// Messages of a conversation: the local store overlaid with the cache.
    async fn load_messages(&self, conversation_id: &str) -> SyncResult<Vec<Message>> {
        let mut messages = self
            .pipeline
            .local()
            .list_messages(conversation_id)
            .await
            .map_err(SyncError::LocalPersistence)?;
        for cached in self.cache.messages(conversation_id).unwrap_or_default() {
            match messages.iter_mut().find(|m| m.id == cached.id) {
                Some(stored) => *stored = cached,
                None => messages.push(cached),
            }
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.cache.set_messages(conversation_id, messages.clone());
        Ok(messages)
    }

    async fn revoke_share(&self, mut conversation: Conversation) {
        let patch = ConversationPatch {
            is_public: Some(false),
            ..ConversationPatch::default()
        };
        if let Err(e) = self.remote.patch_conversation(&conversation.id, patch).await {
            let err = SyncError::ShareRevocation {
                conversation_id: conversation.id.clone(),
                source: e,
            };
            warn!(error = %err, "Regenerating anyway");
        } else {
            debug!(conversation_id = %conversation.id, "Public share revoked");
        }
        conversation.is_public = false;
        self.pipeline.store_conversation_locally(conversation).await;
    }

    fn advance(&self, conversation_id: &str, phase: SessionPhase) -> SyncResult<()> {
        self.sessions
            .update(conversation_id, |session| session.transition(phase))
            .unwrap_or(Ok(()))
    }

    /// End a session that failed before streaming started.
    fn fail(&self, conversation_id: &str, message_id: &str, error: &SyncError) {
        warn!(conversation_id = %conversation_id, message_id = %message_id, error = %error, "Generation could not start");
        let _ = self.sessions.update(conversation_id, |session| {
            session.error = Some(error.to_string());
            session.transition(SessionPhase::Error)
        });
    }

    /// Live copy of the target message while it streams. Cache only.
    fn publish_progress(&self, session: &StreamingSession) {
        if let Some(mut message) = self.cache.message(&session.target_message_id) {
            message.content = MessageContent::text(session.live_visible_text());
            message.meta_json = Some(session.merged_meta(message.meta_json.as_ref()));
            self.cache.upsert_message(message);
        }
    }

    /// Write the session's text and metadata through the pipeline's update path.
    async fn persist(&self, session: &StreamingSession) {
        let existing = self
            .cache
            .message(&session.target_message_id)
            .and_then(|m| m.meta_json);
        let patch = MessagePatch {
            content: Some(MessageContent::text(session.visible_text())),
            meta_json: Some(session.merged_meta(existing.as_ref())),
        };
        if let Err(e) = self
            .pipeline
            .update_message(&session.target_message_id, patch)
            .await
        {
            warn!(message_id = %session.target_message_id, error = %e, "Failed to persist generated message");
        }
    }

    fn emit(&self, event: GenerationEvent) {
        let _ = self.events.send(event);
    }

    fn emit_ended(&self, session: &StreamingSession, phase: SessionPhase) {
        self.emit(GenerationEvent::StreamEnded {
            conversation_id: session.conversation_id.clone(),
            message_id: session.target_message_id.clone(),
            phase,
            usage: session.finish.as_ref().and_then(|f| f.usage.clone()),
        });
    }
}

async fn run_generation(
    inner: Arc<ControllerInner>,
    conversation_id: String,
    message_id: String,
    request: GenerationRequest,
    cancel_flag: Arc<AtomicBool>,
) {
    inner.emit(GenerationEvent::StreamStarted {
        conversation_id: conversation_id.clone(),
        message_id: message_id.clone(),
    });

    match inner.gateway.stream(request).await {
        Ok(bytes) => {
            let mut frames = decode_stream(bytes);
            while let Some(frame) = frames.next().await {
                if cancel_flag.load(Ordering::Relaxed) {
                    debug!(conversation_id = %conversation_id, "Stream cancelled");
                    return;
                }
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        let err = SyncError::Network(e);
                        warn!(conversation_id = %conversation_id, error = %err, "Stream interrupted");
                        inner.sessions.update(&conversation_id, |session| {
                            session.error = Some(err.to_string());
                        });
                        break;
                    }
                };

                let Some(session) = inner.sessions.update(&conversation_id, |session| {
                    session.apply(&frame);
                    session.clone()
                }) else {
                    return;
                };
                inner.publish_progress(&session);

                if let Some(delta) = frame.text_delta {
                    inner.emit(GenerationEvent::TextDelta {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                        delta,
                    });
                }
                if let Some(delta) = frame.reasoning_delta {
                    inner.emit(GenerationEvent::ReasoningDelta {
                        conversation_id: conversation_id.clone(),
                        message_id: message_id.clone(),
                        delta,
                    });
                }
                if let Some(error) = frame.error {
                    warn!(conversation_id = %conversation_id, error = %error, "Generation reported an error");
                    break;
                }
            }
        }
        Err(e) => {
            let err = SyncError::Network(e);
            warn!(conversation_id = %conversation_id, error = %err, "Failed to open generation stream");
            inner.sessions.update(&conversation_id, |session| {
                session.error = Some(err.to_string());
            });
        }
    }

    if cancel_flag.load(Ordering::Relaxed) {
        return;
    }
    let Some(session) = inner.sessions.get(&conversation_id) else {
        return;
    };
    inner.persist(&session).await;

    let phase = if session.error.is_some() {
        SessionPhase::Error
    } else {
        SessionPhase::Done
    };
    if let Err(e) = inner.advance(&conversation_id, phase) {
        warn!(conversation_id = %conversation_id, error = %e, "Could not finish session");
        return;
    }
    info!(conversation_id = %conversation_id, message_id = %message_id, phase = ?phase, "Generation finished");
    inner.emit_ended(&session, phase);
}

/// History entries sent to the model. Empty messages carry nothing.
fn prompt_message(message: &Message) -> Option<PromptMessage> {
    let text = message.visible_text();
    (!text.is_empty()).then(|| PromptMessage::new(message.role, text))
}

/// A timestamp strictly after every message in `messages`.
fn next_timestamp(messages: &[Message]) -> DateTime<Utc> {
    let now = Utc::now();
    match messages.iter().map(|m| m.created_at).max() {
        Some(latest) if latest >= now => latest + Duration::milliseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{InMemoryLocalStore, InMemoryRemoteStore, LocalStore};
    use crate::services::generation_gateway::ScriptedGateway;
    use serde_json::json;

    struct Fixture {
        local: InMemoryLocalStore,
        remote: InMemoryRemoteStore,
        pipeline: Arc<OptimisticWritePipeline>,
        controller: GenerationController,
    }

    fn fixture(gateway: ScriptedGateway) -> Fixture {
        let local = InMemoryLocalStore::new();
        let remote = InMemoryRemoteStore::adopting_client_ids();
        let cache = Arc::new(ReactiveCache::new());
        let pipeline = Arc::new(OptimisticWritePipeline::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            cache,
        ));
        let controller = GenerationController::new(
            pipeline.clone(),
            Arc::new(remote.clone()),
            Arc::new(gateway),
            Arc::new(SessionRegistry::new()),
        );
        Fixture {
            local,
            remote,
            pipeline,
            controller,
        }
    }

    async fn seed(f: &Fixture, conversation: Conversation, roles: &[Role]) -> Vec<Message> {
        let conversation = f.pipeline.create_conversation(conversation).await.unwrap();
        let base = Utc::now();
        let mut created = Vec::new();
        for (i, role) in roles.iter().enumerate() {
            let mut message = Message::new(&conversation.id, *role, format!("m{i}"));
            message.created_at = base + Duration::milliseconds(i as i64);
            created.push(f.pipeline.create_message(message).await.unwrap());
        }
        f.pipeline.flush().await;
        created
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let f = fixture(ScriptedGateway::new(["{\"type\":\"text-delta\",\"delta\":\"hi\"}\n"]).hold_open());
        f.pipeline
            .create_conversation(Conversation::new("c1", "Chat"))
            .await
            .unwrap();

        f.controller.send("c1", "first", None).await.unwrap();
        let second = f.controller.send("c1", "second", None).await;
        assert!(matches!(second, Err(SyncError::SessionBusy { .. })));

        f.controller.abort("c1").await.unwrap();
        assert_eq!(f.controller.session("c1").unwrap().phase, SessionPhase::Aborted);
    }

    #[tokio::test]
    async fn test_regenerate_rejects_user_message() {
        let f = fixture(ScriptedGateway::new(Vec::<Vec<u8>>::new()));
        let messages = seed(&f, Conversation::new("c1", "Chat"), &[Role::User, Role::Assistant]).await;

        let result = f
            .controller
            .regenerate(&messages[0].id, RegenerateOptions::default())
            .await;
        assert!(matches!(result, Err(SyncError::InvalidTarget { .. })));
        assert!(!f.controller.is_streaming("c1"));
    }

    #[tokio::test]
    async fn test_regenerate_revokes_public_share_and_sends_directive() {
        let gateway = ScriptedGateway::new(["{\"type\":\"text-delta\",\"delta\":\"short\"}\n"]);
        let f = fixture(gateway.clone());
        let mut conversation = Conversation::new("c1", "Chat");
        conversation.is_public = true;
        let messages = seed(&f, conversation, &[Role::User, Role::Assistant]).await;
        assert!(f.remote.conversation("c1").unwrap().is_public);

        let options = RegenerateOptions {
            mode: RegenerationMode::Concise,
            ..RegenerateOptions::default()
        };
        f.controller.regenerate(&messages[1].id, options).await.unwrap();
        let session = f.controller.wait("c1").await.unwrap();
        assert_eq!(session.phase, SessionPhase::Done);

        assert!(!f.remote.conversation("c1").unwrap().is_public);
        assert!(!f.local.get_conversation("c1").await.unwrap().unwrap().is_public);

        let request = gateway.requests().pop().unwrap();
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages.last().unwrap().content, "m0");
        assert_eq!(
            request.regeneration.unwrap().assistant_text,
            "m1".to_string()
        );
    }

    #[tokio::test]
    async fn test_failed_share_revocation_does_not_block_regeneration() {
        let f = fixture(ScriptedGateway::new(["{\"type\":\"text-delta\",\"delta\":\"new\"}\n"]));
        let mut conversation = Conversation::new("c1", "Chat");
        conversation.is_public = true;
        let messages = seed(&f, conversation, &[Role::User, Role::Assistant]).await;
        f.remote.set_offline(true);

        f.controller
            .regenerate(&messages[1].id, RegenerateOptions::default())
            .await
            .unwrap();
        let session = f.controller.wait("c1").await.unwrap();
        assert_eq!(session.phase, SessionPhase::Done);

        let regenerated = f.local.get_message(&messages[1].id).await.unwrap().unwrap();
        assert_eq!(regenerated.visible_text(), "new");
        assert!(!f.local.get_conversation("c1").await.unwrap().unwrap().is_public);
    }

    #[tokio::test]
    async fn test_regenerate_replaces_previous_usage_metadata() {
        let f = fixture(ScriptedGateway::new([
            "{\"type\":\"text-delta\",\"delta\":\"new\"}\n",
            "{\"type\":\"finish\",\"modelId\":\"new-model\"}\n",
        ]));
        let messages = seed(&f, Conversation::new("c1", "Chat"), &[Role::User, Role::Assistant]).await;
        let previous = MessagePatch {
            meta_json: Some(json!({
                "pinned": true,
                "modelId": "old-model",
                "gatewayCost": 9.99,
                "usage": {"inputTokens": 100, "outputTokens": 200}
            })),
            ..MessagePatch::default()
        };
        f.pipeline.update_message(&messages[1].id, previous).await.unwrap();

        f.controller
            .regenerate(&messages[1].id, RegenerateOptions::default())
            .await
            .unwrap();
        f.controller.wait("c1").await.unwrap();

        let stored = f.local.get_message(&messages[1].id).await.unwrap().unwrap();
        let meta_json = stored.meta_json.unwrap();
        let meta = MessageMeta::from_value(&meta_json);
        assert_eq!(meta.model_id.as_deref(), Some("new-model"));
        assert_eq!(meta.gateway_cost, None);
        assert_eq!(meta.usage, None);
        assert_eq!(meta_json["pinned"], true);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_ends_in_error() {
        let f = fixture(ScriptedGateway::unavailable());
        f.pipeline
            .create_conversation(Conversation::new("c1", "Chat"))
            .await
            .unwrap();

        let ticket = f.controller.send("c1", "hello", None).await.unwrap();
        let session = f.controller.wait("c1").await.unwrap();
        assert_eq!(session.phase, SessionPhase::Error);
        assert!(session.error.is_some());

        // The placeholder stays, empty
        let placeholder = f.local.get_message(&ticket.message_id).await.unwrap().unwrap();
        assert_eq!(placeholder.visible_text(), "");
    }

    #[test]
    fn test_next_timestamp_is_strictly_after_history() {
        let future = Utc::now() + Duration::seconds(60);
        let mut message = Message::new("c1", Role::User, "x");
        message.created_at = future;
        assert!(next_timestamp(&[message]) > future);
        assert!(next_timestamp(&[]) <= Utc::now());
    }
}
