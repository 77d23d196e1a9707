use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::error::{RepositoryError, RepositoryResult};
use super::local_store::BoxFuture;
use super::remote_store::{Page, RemoteStore};
use crate::models::{Conversation, ConversationPatch, Message, MessagePatch};

/// JSON-over-HTTP remote store.
///
/// Routes:
/// - `GET    {base}/conversations?cursor=&limit=`
/// - `GET    {base}/conversations/{id}`
/// - `POST   {base}/conversations`
/// - `PATCH  {base}/conversations/{id}`
/// - `DELETE {base}/conversations/{id}`
/// - `GET    {base}/conversations/{id}/messages?cursor=&limit=`
/// - `POST   {base}/conversations/{id}/messages`
/// - `PATCH  {base}/conversations/{id}/messages?messageId=`
/// - `DELETE {base}/conversations/{id}/messages?messageId=`
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RepositoryResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

fn page_query(cursor: Option<String>, limit: usize) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor));
    }
    query
}

async fn expect_success(response: Response) -> RepositoryResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RepositoryError::StatusError {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> RepositoryResult<T> {
    let response = expect_success(response).await?;
    Ok(response.json::<T>().await?)
}

impl RemoteStore for HttpRemoteStore {
    fn list_conversations(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Conversation>>> {
        let request = self
            .client
            .get(self.url("conversations"))
            .query(&page_query(cursor, limit));

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn get_conversation(
        &self,
        id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let request = self.client.get(self.url(&format!("conversations/{id}")));

        Box::pin(async move {
            let response = request.send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            read_json(response).await.map(Some)
        })
    }

    fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>> {
        let request = self
            .client
            .post(self.url("conversations"))
            .json(&conversation.for_remote());

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn patch_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<Conversation>> {
        let request = self
            .client
            .patch(self.url(&format!("conversations/{id}")))
            .json(&patch.for_remote());

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let request = self.client.delete(self.url(&format!("conversations/{id}")));

        Box::pin(async move {
            expect_success(request.send().await?).await?;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> BoxFuture<'static, RepositoryResult<Page<Message>>> {
        let request = self
            .client
            .get(self.url(&format!("conversations/{conversation_id}/messages")))
            .query(&page_query(cursor, limit));

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn create_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<Message>> {
        let request = self
            .client
            .post(self.url(&format!(
                "conversations/{}/messages",
                message.conversation_id
            )))
            .json(&message);

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn patch_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> BoxFuture<'static, RepositoryResult<Message>> {
        let request = self
            .client
            .patch(self.url(&format!("conversations/{conversation_id}/messages")))
            .query(&[("messageId", message_id)])
            .json(&patch);

        Box::pin(async move { read_json(request.send().await?).await })
    }

    fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let request = self
            .client
            .delete(self.url(&format!("conversations/{conversation_id}/messages")))
            .query(&[("messageId", message_id)]);

        Box::pin(async move {
            expect_success(request.send().await?).await?;
            Ok(())
        })
    }
}
