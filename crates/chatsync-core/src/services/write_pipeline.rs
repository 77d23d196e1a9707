use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::ReactiveCache;
use crate::error::{SyncError, SyncResult};
use crate::models::{Conversation, ConversationPatch, Message, MessagePatch};
use crate::repositories::{BoxFuture, LocalStore, RemoteStore, RepositoryResult};

/// Remote writes waiting for the background writer.
enum RemoteOp {
    CreateConversation(Conversation),
    PatchConversation {
        id: String,
        patch: ConversationPatch,
    },
    DeleteConversation {
        id: String,
    },
    CreateMessage(Message),
    PatchMessage {
        conversation_id: String,
        message_id: String,
        patch: MessagePatch,
    },
    DeleteMessage {
        conversation_id: String,
        message_id: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct PipelineState {
    /// Ids this pipeline has written or seen synced. Decides insert vs patch.
    seen_ids: HashSet<String>,
    /// Local id -> canonical server id, learned from create responses.
    server_ids: HashMap<String, String>,
    /// Ids deleted locally whose remote delete has not run yet.
    pending_deletes: HashSet<String>,
}

impl PipelineState {
    fn canonical_id(&self, id: &str) -> String {
        self.server_ids
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

/// Local-first writer for conversations and messages.
///
/// Every write lands in the reactive cache and the local store before the
/// call returns. The remote write is queued and executed in order by a
/// background task; its failure is logged and never retried.
///
/// Must be constructed inside a tokio runtime.
pub struct OptimisticWritePipeline {
    local: Arc<dyn LocalStore>,
    cache: Arc<ReactiveCache>,
    state: Arc<Mutex<PipelineState>>,
    remote_ops: mpsc::UnboundedSender<RemoteOp>,
}

impl OptimisticWritePipeline {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<ReactiveCache>,
    ) -> Self {
        let state = Arc::new(Mutex::new(PipelineState::default()));
        let (remote_ops, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_remote_writer(remote, state.clone(), receiver));

        Self {
            local,
            cache,
            state,
            remote_ops,
        }
    }

    pub fn cache(&self) -> &Arc<ReactiveCache> {
        &self.cache
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Insert a message. An empty `id` is replaced with a fresh one and a
    /// missing `client_id` is set to the local id.
    pub async fn create_message(&self, mut message: Message) -> SyncResult<Message> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        if message.client_id.is_none() {
            message.client_id = Some(message.id.clone());
        }
        self.state.lock().seen_ids.insert(message.id.clone());

        self.cache.upsert_message(message.clone());
        self.bump_conversation(&message.conversation_id, message.created_at)
            .await;
        self.persist("put message", || self.local.put_message(message.clone()))
            .await;

        debug!(message_id = %message.id, conversation_id = %message.conversation_id, "Message created");
        self.enqueue(RemoteOp::CreateMessage(message.clone()));
        Ok(message)
    }

    /// Patch a message. An id this pipeline has never seen is sent to the
    /// remote as a create.
    pub async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<Message> {
        let mut message = self
            .find_message(id)
            .await?
            .ok_or_else(|| SyncError::MessageNotFound(id.to_string()))?;
        patch.apply(&mut message);

        let first_write = self.state.lock().seen_ids.insert(message.id.clone());

        self.cache.upsert_message(message.clone());
        self.bump_conversation(&message.conversation_id, Utc::now())
            .await;
        self.persist("put message", || self.local.put_message(message.clone()))
            .await;

        if first_write {
            debug!(message_id = %message.id, "Unseen message, sending as create");
            self.enqueue(RemoteOp::CreateMessage(message.clone()));
        } else {
            self.enqueue(RemoteOp::PatchMessage {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id.clone(),
                patch,
            });
        }
        Ok(message)
    }

    pub async fn delete_message(&self, id: &str) -> SyncResult<()> {
        let message = self
            .find_message(id)
            .await?
            .ok_or_else(|| SyncError::MessageNotFound(id.to_string()))?;

        self.state.lock().pending_deletes.insert(message.id.clone());
        self.cache.remove_message(&message.id);
        self.persist("delete message", || self.local.delete_message(&message.id))
            .await;

        self.enqueue(RemoteOp::DeleteMessage {
            conversation_id: message.conversation_id,
            message_id: message.id,
        });
        Ok(())
    }

    pub async fn delete_messages(&self, ids: &[String]) -> SyncResult<()> {
        for id in ids {
            self.delete_message(id).await?;
        }
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        mut conversation: Conversation,
    ) -> SyncResult<Conversation> {
        if conversation.id.is_empty() {
            conversation.id = Uuid::new_v4().to_string();
        }

        self.cache.upsert_conversation(conversation.clone());
        self.persist("put conversation", || {
            self.local.put_conversation(conversation.clone())
        })
        .await;

        self.enqueue(RemoteOp::CreateConversation(conversation.clone()));
        Ok(conversation)
    }

    /// Apply a patch locally. Only fields meant for the remote are sent;
    /// a patch that only changes `model_id` stays local.
    pub async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> SyncResult<Conversation> {
        let mut conversation = self
            .find_conversation(id)
            .await?
            .ok_or_else(|| SyncError::ConversationNotFound(id.to_string()))?;
        patch.apply(&mut conversation, Utc::now());

        self.store_conversation_locally(conversation.clone()).await;

        let remote_patch = patch.for_remote();
        if !remote_patch.is_empty() {
            self.enqueue(RemoteOp::PatchConversation {
                id: conversation.id.clone(),
                patch: remote_patch,
            });
        }
        Ok(conversation)
    }

    /// Delete a conversation and its messages.
    pub async fn delete_conversation(&self, id: &str) -> SyncResult<()> {
        self.state.lock().pending_deletes.insert(id.to_string());
        self.cache.remove_conversation(id);
        self.persist("delete conversation", || self.local.delete_conversation(id))
            .await;

        self.enqueue(RemoteOp::DeleteConversation { id: id.to_string() });
        Ok(())
    }

    /// Write a conversation to the cache and local store without a remote write.
    pub(crate) async fn store_conversation_locally(&self, conversation: Conversation) {
        self.cache.upsert_conversation(conversation.clone());
        self.persist("put conversation", || {
            self.local.put_conversation(conversation.clone())
        })
        .await;
    }

    /// Mark records read from the remote as seen, so later writes patch them.
    pub fn register_synced(&self, messages: &[Message]) {
        let mut state = self.state.lock();
        state
            .seen_ids
            .extend(messages.iter().map(|message| message.id.clone()));
    }

    /// Ids deleted locally whose remote delete is still queued.
    pub fn pending_deletes(&self) -> HashSet<String> {
        self.state.lock().pending_deletes.clone()
    }

    /// The server id a local id was created under, or the id itself.
    pub fn canonical_id(&self, id: &str) -> String {
        self.state.lock().canonical_id(id)
    }

    /// Wait until every remote write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.remote_ops.send(RemoteOp::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }

    fn enqueue(&self, op: RemoteOp) {
        if self.remote_ops.send(op).is_err() {
            warn!("Remote writer stopped, dropping remote write");
        }
    }

    async fn find_message(&self, id: &str) -> SyncResult<Option<Message>> {
        if let Some(message) = self.cache.message(id) {
            return Ok(Some(message));
        }
        self.local
            .get_message(id)
            .await
            .map_err(SyncError::LocalPersistence)
    }

    async fn find_conversation(&self, id: &str) -> SyncResult<Option<Conversation>> {
        if let Some(conversation) = self.cache.conversation(id) {
            return Ok(Some(conversation));
        }
        self.local
            .get_conversation(id)
            .await
            .map_err(SyncError::LocalPersistence)
    }

    async fn bump_conversation(&self, conversation_id: &str, at: DateTime<Utc>) {
        let touched = match self.cache.touch_conversation(conversation_id, at) {
            Some(conversation) => Some(conversation),
            None => match self.local.get_conversation(conversation_id).await {
                Ok(Some(mut conversation)) => {
                    conversation.touch(at);
                    self.cache.upsert_conversation(conversation.clone());
                    Some(conversation)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = ?e, "Failed to load conversation for timestamp bump");
                    None
                }
            },
        };
        if let Some(conversation) = touched {
            self.persist("put conversation", || {
                self.local.put_conversation(conversation.clone())
            })
            .await;
        }
    }

    /// Run a local write, retrying once. A second failure is logged and swallowed.
    async fn persist<F>(&self, what: &str, write: F)
    where
        F: Fn() -> BoxFuture<'static, RepositoryResult<()>>,
    {
        let Err(first) = write().await else {
            return;
        };
        warn!(error = ?first, "Local {} failed, retrying", what);
        if let Err(e) = write().await {
            let err = SyncError::LocalPersistence(e);
            error!(error = %err, "Local {} failed after retry", what);
        }
    }
}

async fn run_remote_writer(
    remote: Arc<dyn RemoteStore>,
    state: Arc<Mutex<PipelineState>>,
    mut ops: mpsc::UnboundedReceiver<RemoteOp>,
) {
    while let Some(op) = ops.recv().await {
        if let Err(e) = execute(remote.as_ref(), &state, op).await {
            let err = SyncError::RemoteWrite(e);
            warn!(error = %err, "Remote write dropped");
        }
    }
    debug!("Remote writer finished");
}

async fn execute(
    remote: &dyn RemoteStore,
    state: &Mutex<PipelineState>,
    op: RemoteOp,
) -> RepositoryResult<()> {
    match op {
        RemoteOp::Flush(done) => {
            let _ = done.send(());
        }
        RemoteOp::CreateConversation(conversation) => {
            remote.create_conversation(conversation).await?;
        }
        RemoteOp::PatchConversation { id, patch } => {
            remote.patch_conversation(&id, patch).await?;
        }
        RemoteOp::DeleteConversation { id } => {
            let result = remote.delete_conversation(&id).await;
            state.lock().pending_deletes.remove(&id);
            result?;
        }
        RemoteOp::CreateMessage(message) => {
            let local_id = message.id.clone();
            let created = remote.create_message(message).await?;
            if created.id != local_id {
                debug!(local_id = %local_id, server_id = %created.id, "Server assigned canonical id");
                let mut state = state.lock();
                state.seen_ids.insert(created.id.clone());
                state.server_ids.insert(local_id, created.id);
            }
        }
        RemoteOp::PatchMessage {
            conversation_id,
            message_id,
            patch,
        } => {
            let target = state.lock().canonical_id(&message_id);
            remote.patch_message(&conversation_id, &target, patch).await?;
        }
        RemoteOp::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            let target = state.lock().canonical_id(&message_id);
            let result = remote.delete_message(&conversation_id, &target).await;
            state.lock().pending_deletes.remove(&message_id);
            result?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::repositories::{InMemoryLocalStore, InMemoryRemoteStore};

    struct Fixture {
        local: InMemoryLocalStore,
        remote: InMemoryRemoteStore,
        cache: Arc<ReactiveCache>,
        pipeline: OptimisticWritePipeline,
    }

    fn fixture(remote: InMemoryRemoteStore) -> Fixture {
        let local = InMemoryLocalStore::new();
        let cache = Arc::new(ReactiveCache::new());
        let pipeline = OptimisticWritePipeline::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            cache.clone(),
        );
        Fixture {
            local,
            remote,
            cache,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_create_is_visible_locally_before_remote() {
        let f = fixture(InMemoryRemoteStore::new());
        f.remote.set_offline(true);

        let message = f
            .pipeline
            .create_message(Message::new("c1", Role::User, "hello"))
            .await
            .unwrap();

        assert!(!message.id.is_empty());
        assert_eq!(message.client_id.as_deref(), Some(message.id.as_str()));
        assert_eq!(f.cache.message(&message.id), Some(message.clone()));
        assert!(f.local.get_message(&message.id).await.unwrap().is_some());

        // Remote failure leaves local state intact
        f.pipeline.flush().await;
        assert!(f.remote.messages("c1").is_empty());
        assert!(f.cache.message(&message.id).is_some());
    }

    #[tokio::test]
    async fn test_local_write_retried_once() {
        let f = fixture(InMemoryRemoteStore::new());

        f.local.fail_next_writes(1);
        let kept = f
            .pipeline
            .create_message(Message::new("c1", Role::User, "one"))
            .await
            .unwrap();
        assert!(f.local.get_message(&kept.id).await.unwrap().is_some());

        f.local.fail_next_writes(2);
        let lost = f
            .pipeline
            .create_message(Message::new("c1", Role::User, "two"))
            .await
            .unwrap();
        assert!(f.local.get_message(&lost.id).await.unwrap().is_none());
        assert!(f.cache.message(&lost.id).is_some());
    }

    #[tokio::test]
    async fn test_update_patches_server_copy_under_canonical_id() {
        let f = fixture(InMemoryRemoteStore::new());
        let message = f
            .pipeline
            .create_message(Message::new("c1", Role::Assistant, ""))
            .await
            .unwrap();
        f.pipeline.flush().await;
        assert_eq!(f.pipeline.canonical_id(&message.id), "srv-1");

        f.pipeline
            .update_message(&message.id, MessagePatch::content("streamed"))
            .await
            .unwrap();
        f.pipeline.flush().await;

        let server = f.remote.messages("c1");
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].id, "srv-1");
        assert_eq!(server[0].visible_text(), "streamed");
    }

    #[tokio::test]
    async fn test_update_of_unseen_id_is_sent_as_create() {
        let f = fixture(InMemoryRemoteStore::adopting_client_ids());
        let mut stored = Message::new("c1", Role::Assistant, "draft");
        stored.id = "m1".to_string();
        f.local.put_message(stored).await.unwrap();

        f.pipeline
            .update_message("m1", MessagePatch::content("final"))
            .await
            .unwrap();
        f.pipeline.flush().await;

        let server = f.remote.messages("c1");
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].visible_text(), "final");
    }

    #[tokio::test]
    async fn test_seen_ids_are_per_pipeline() {
        let first = fixture(InMemoryRemoteStore::adopting_client_ids());
        let mut message = Message::new("c1", Role::User, "hi");
        message.id = "m1".to_string();
        first.pipeline.create_message(message.clone()).await.unwrap();

        let second = fixture(InMemoryRemoteStore::adopting_client_ids());
        second.local.put_message(message).await.unwrap();
        second
            .pipeline
            .update_message("m1", MessagePatch::content("edited"))
            .await
            .unwrap();
        second.pipeline.flush().await;

        // Unseen by the second pipeline, so it was created rather than patched
        assert_eq!(second.remote.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_message_fails() {
        let f = fixture(InMemoryRemoteStore::new());
        let result = f
            .pipeline
            .update_message("nope", MessagePatch::content("x"))
            .await;
        assert!(matches!(result, Err(SyncError::MessageNotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_create_bumps_conversation() {
        let f = fixture(InMemoryRemoteStore::new());
        let conversation = f
            .pipeline
            .create_conversation(Conversation::new("", "Chat"))
            .await
            .unwrap();
        assert!(conversation.last_message_at.is_none());

        let message = f
            .pipeline
            .create_message(Message::new(&conversation.id, Role::User, "hi"))
            .await
            .unwrap();

        let cached = f.cache.conversation(&conversation.id).unwrap();
        assert_eq!(cached.last_message_at, Some(message.created_at));
        let stored = f.local.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.last_message_at, Some(message.created_at));
    }

    #[tokio::test]
    async fn test_model_id_stays_local_unless_persisted() {
        let f = fixture(InMemoryRemoteStore::new());
        let conversation = f
            .pipeline
            .create_conversation(Conversation::new("c1", "Chat"))
            .await
            .unwrap();

        let patch = ConversationPatch {
            model_id: Some("gpt-x".to_string()),
            ..ConversationPatch::default()
        };
        let updated = f
            .pipeline
            .update_conversation(&conversation.id, patch)
            .await
            .unwrap();
        f.pipeline.flush().await;

        assert_eq!(updated.model_id.as_deref(), Some("gpt-x"));
        assert_eq!(f.remote.conversation("c1").unwrap().model_id, None);
    }

    #[tokio::test]
    async fn test_delete_tombstone_cleared_after_remote_delete() {
        let f = fixture(InMemoryRemoteStore::adopting_client_ids());
        let message = f
            .pipeline
            .create_message(Message::new("c1", Role::User, "bye"))
            .await
            .unwrap();

        f.pipeline.delete_message(&message.id).await.unwrap();
        assert!(f.cache.message(&message.id).is_none());

        f.pipeline.flush().await;
        assert!(f.pipeline.pending_deletes().is_empty());
        assert!(f.remote.messages("c1").is_empty());
    }
}
