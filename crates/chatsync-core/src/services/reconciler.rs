use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::write_pipeline::OptimisticWritePipeline;
use crate::cache::ReactiveCache;
use crate::cache::reactive_cache::by_recent_activity;
use crate::error::{SyncError, SyncResult};
use crate::models::{Conversation, Message, SessionRegistry};
use crate::repositories::{LocalStore, Page, RemoteStore, RepositoryResult};

/// Merge a remote conversation snapshot with the local one.
///
/// Server fields win, except `model_id` which is spliced in from the local
/// copy. Local-only conversations are kept. The result is ordered by
/// `last_message_at` descending, conversations without messages last.
pub fn reconcile_conversations(server: &[Conversation], local: &[Conversation]) -> Vec<Conversation> {
    let local_by_id: HashMap<&str, &Conversation> =
        local.iter().map(|c| (c.id.as_str(), c)).collect();
    let server_ids: HashSet<&str> = server.iter().map(|c| c.id.as_str()).collect();

    let mut merged: Vec<Conversation> = server
        .iter()
        .map(|remote| {
            let mut conversation = remote.clone();
            if let Some(local) = local_by_id.get(remote.id.as_str())
                && local.model_id.is_some()
            {
                conversation.model_id = local.model_id.clone();
            }
            conversation
        })
        .collect();
    merged.extend(
        local
            .iter()
            .filter(|c| !server_ids.contains(c.id.as_str()))
            .cloned(),
    );

    merged.sort_by(by_recent_activity);
    merged
}

/// Pairs of (local temporary id, server canonical id) matched through `client_id`.
pub fn client_id_handoffs(server: &[Message], local: &[Message]) -> Vec<(String, String)> {
    let pending: HashMap<&str, &str> = local
        .iter()
        .filter_map(|m| m.client_id.as_deref().map(|client_id| (client_id, m.id.as_str())))
        .collect();

    server
        .iter()
        .filter_map(|remote| {
            let local_id = pending.get(remote.client_id.as_deref()?)?;
            (*local_id != remote.id).then(|| (local_id.to_string(), remote.id.clone()))
        })
        .collect()
}

/// Merge a remote message snapshot with the local one.
///
/// A server message whose `client_id` matches a local optimistic write
/// replaces it, unless that local message is `streaming_target`: a live
/// generation keeps its id until it finishes. Local-only messages are kept.
/// When both sides hold the same id with different text, the server wins
/// except for `streaming_target`. The result is ordered by `created_at`,
/// server records before local-only ones on ties.
pub fn reconcile_messages(
    server: &[Message],
    local: &[Message],
    streaming_target: Option<&str>,
) -> Vec<Message> {
    let local_by_id: HashMap<&str, &Message> = local.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut handed_off: HashSet<String> = HashSet::new();
    let mut shadowed: HashSet<String> = HashSet::new();
    for (local_id, server_id) in client_id_handoffs(server, local) {
        if Some(local_id.as_str()) == streaming_target {
            shadowed.insert(server_id);
        } else {
            handed_off.insert(local_id);
        }
    }

    let mut merged: Vec<Message> = Vec::with_capacity(server.len() + local.len());
    let mut merged_ids: HashSet<String> = HashSet::new();

    for remote in server {
        if shadowed.contains(&remote.id) || !merged_ids.insert(remote.id.clone()) {
            continue;
        }
        let keep_local = Some(remote.id.as_str()) == streaming_target
            && local_by_id
                .get(remote.id.as_str())
                .is_some_and(|local| local.content != remote.content);
        match local_by_id.get(remote.id.as_str()) {
            Some(local) if keep_local => merged.push((*local).clone()),
            _ => merged.push(remote.clone()),
        }
    }
    for local in local {
        if handed_off.contains(&local.id) || !merged_ids.insert(local.id.clone()) {
            continue;
        }
        merged.push(local.clone());
    }

    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    merged
}

/// Pulls remote snapshots and reconciles them into the local store and cache.
///
/// Remote failures never reach the caller: the local snapshot is returned
/// instead and the failure is logged.
pub struct SyncService {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<ReactiveCache>,
    pipeline: Arc<OptimisticWritePipeline>,
    sessions: Arc<SessionRegistry>,
    page_size: usize,
}

impl SyncService {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<ReactiveCache>,
        pipeline: Arc<OptimisticWritePipeline>,
        sessions: Arc<SessionRegistry>,
        page_size: usize,
    ) -> Self {
        Self {
            local,
            remote,
            cache,
            pipeline,
            sessions,
            page_size: page_size.max(1),
        }
    }

    pub async fn sync_conversations(&self) -> SyncResult<Vec<Conversation>> {
        let local = self
            .local
            .list_conversations()
            .await
            .map_err(SyncError::LocalPersistence)?;

        let server = match self.fetch_all_conversations().await {
            Ok(server) => server,
            Err(e) => {
                let err = SyncError::Network(e);
                warn!(error = %err, "Conversation sync failed, serving local snapshot");
                self.cache.set_conversations(local.clone());
                return Ok(self.cache.conversations());
            }
        };

        let pending_deletes = self.pipeline.pending_deletes();
        let server: Vec<Conversation> = server
            .into_iter()
            .filter(|c| !pending_deletes.contains(&c.id))
            .collect();
        let merged = reconcile_conversations(&server, &local);

        for conversation in &merged {
            if let Err(e) = self.local.put_conversation(conversation.clone()).await {
                warn!(conversation_id = %conversation.id, error = ?e, "Failed to store synced conversation");
            }
        }
        self.cache.set_conversations(merged.clone());
        info!(count = merged.len(), "Conversations synced");
        Ok(merged)
    }

    pub async fn sync_messages(&self, conversation_id: &str) -> SyncResult<Vec<Message>> {
        let mut local = self
            .local
            .list_messages(conversation_id)
            .await
            .map_err(SyncError::LocalPersistence)?;

        let streaming_target = self.sessions.streaming_target(conversation_id);
        // The live streamed copy only exists in the cache until the session ends.
        if let Some(target) = &streaming_target
            && let Some(live) = self.cache.message(target)
        {
            match local.iter_mut().find(|m| m.id == *target) {
                Some(stored) => *stored = live,
                None => local.push(live),
            }
        }

        let server = match self.fetch_all_messages(conversation_id).await {
            Ok(server) => server,
            Err(e) => {
                let err = SyncError::Network(e);
                warn!(conversation_id = %conversation_id, error = %err, "Message sync failed, serving local snapshot");
                self.cache.set_messages(conversation_id, local.clone());
                return Ok(self.cache.messages(conversation_id).unwrap_or_default());
            }
        };

        let pending_deletes = self.pipeline.pending_deletes();
        let server: Vec<Message> = server
            .into_iter()
            .filter(|m| {
                !pending_deletes.contains(&m.id)
                    && !m
                        .client_id
                        .as_ref()
                        .is_some_and(|client_id| pending_deletes.contains(client_id))
            })
            .collect();

        let merged = reconcile_messages(&server, &local, streaming_target.as_deref());
        self.pipeline.register_synced(&server);

        if let Err(e) = self
            .local
            .replace_messages(conversation_id, merged.clone())
            .await
        {
            warn!(conversation_id = %conversation_id, error = ?e, "Failed to store synced messages");
        }
        self.cache.set_messages(conversation_id, merged.clone());
        debug!(conversation_id = %conversation_id, count = merged.len(), "Messages synced");
        Ok(merged)
    }

    async fn fetch_all_conversations(&self) -> RepositoryResult<Vec<Conversation>> {
        let mut items = Vec::new();
        let mut cursor = None;
        loop {
            let Page {
                items: page,
                next_cursor,
            } = self
                .remote
                .list_conversations(cursor.take(), self.page_size)
                .await?;
            items.extend(page);
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }

    async fn fetch_all_messages(&self, conversation_id: &str) -> RepositoryResult<Vec<Message>> {
        let mut items = Vec::new();
        let mut cursor = None;
        loop {
            let Page {
                items: page,
                next_cursor,
            } = self
                .remote
                .list_messages(conversation_id, cursor.take(), self.page_size)
                .await?;
            items.extend(page);
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }
}
