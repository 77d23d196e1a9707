use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::Role;
use crate::repositories::{BoxFuture, RepositoryError, RepositoryResult};

/// Raw transport chunks from a generation endpoint.
pub type ByteStream = BoxStream<'static, RepositoryResult<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenerationMode {
    #[default]
    Retry,
    Concise,
    Detailed,
    Custom,
}

/// How a regenerated answer should differ from the one it replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationDirective {
    pub mode: RegenerationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Text of the answer being replaced.
    pub assistant_text: String,
}

impl RegenerationDirective {
    /// System prompt line steering the new answer, if the mode asks for one.
    pub fn system_prompt(&self) -> Option<String> {
        match self.mode {
            RegenerationMode::Retry => None,
            RegenerationMode::Concise => Some(format!(
                "Rewrite your previous answer to be more concise. Previous answer:\n{}",
                self.assistant_text
            )),
            RegenerationMode::Detailed => Some(format!(
                "Rewrite your previous answer with more detail. Previous answer:\n{}",
                self.assistant_text
            )),
            RegenerationMode::Custom => {
                let instruction = self.instruction.as_deref().unwrap_or_default().trim();
                if instruction.is_empty() {
                    None
                } else {
                    Some(format!(
                        "Rewrite your previous answer following this instruction: {}\nPrevious answer:\n{}",
                        instruction, self.assistant_text
                    ))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub messages: Vec<PromptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regeneration: Option<RegenerationDirective>,
}

/// Source of streamed model output.
pub trait GenerationGateway: Send + Sync + 'static {
    fn stream(&self, request: GenerationRequest) -> BoxFuture<'static, RepositoryResult<ByteStream>>;
}

/// Posts the request as JSON and hands back the response body as it arrives.
#[derive(Clone)]
pub struct HttpGenerationGateway {
    client: Client,
    url: String,
}

impl HttpGenerationGateway {
    /// `timeout` bounds connection setup only; a stream may run for as long as the model writes.
    pub fn new(url: impl Into<String>, timeout: Duration) -> RepositoryResult<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl GenerationGateway for HttpGenerationGateway {
    fn stream(&self, request: GenerationRequest) -> BoxFuture<'static, RepositoryResult<ByteStream>> {
        let request = self.client.post(&self.url).json(&request);

        Box::pin(async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(RepositoryError::StatusError {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }
            let bytes = response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(RepositoryError::from);
            Ok(Box::pin(bytes) as ByteStream)
        })
    }
}

/// Replays fixed chunks for every request.
/// Useful for testing and offline development
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    chunks: Vec<Vec<u8>>,
    hold_open: bool,
    unavailable: bool,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedGateway {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Keep the stream open after the last chunk, like a model that never finishes.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Fail every request before any bytes are sent.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

impl GenerationGateway for ScriptedGateway {
    fn stream(&self, request: GenerationRequest) -> BoxFuture<'static, RepositoryResult<ByteStream>> {
        self.requests.lock().push(request);
        let chunks = self.chunks.clone();
        let hold_open = self.hold_open;
        let unavailable = self.unavailable;

        Box::pin(async move {
            if unavailable {
                return Err(RepositoryError::Unavailable {
                    message: "generation endpoint unreachable".to_string(),
                });
            }
            let scripted = stream::iter(chunks.into_iter().map(Ok::<Vec<u8>, RepositoryError>));
            let bytes: ByteStream = if hold_open {
                Box::pin(scripted.chain(stream::pending()))
            } else {
                Box::pin(scripted)
            };
            Ok(bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(mode: RegenerationMode, instruction: Option<&str>) -> RegenerationDirective {
        RegenerationDirective {
            mode,
            instruction: instruction.map(str::to_string),
            assistant_text: "old answer".to_string(),
        }
    }

    #[test]
    fn test_system_prompt_per_mode() {
        assert_eq!(directive(RegenerationMode::Retry, None).system_prompt(), None);

        let concise = directive(RegenerationMode::Concise, None).system_prompt().unwrap();
        assert!(concise.contains("concise"));
        assert!(concise.contains("old answer"));

        let custom = directive(RegenerationMode::Custom, Some("use bullet points"))
            .system_prompt()
            .unwrap();
        assert!(custom.contains("use bullet points"));

        assert_eq!(
            directive(RegenerationMode::Custom, Some("  ")).system_prompt(),
            None
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let request = GenerationRequest {
            conversation_id: "c1".to_string(),
            messages: vec![PromptMessage::new(Role::User, "hi")],
            model_id: Some("gpt".to_string()),
            regeneration: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["modelId"], "gpt");
        assert!(value.get("regeneration").is_none());
    }

    #[tokio::test]
    async fn test_scripted_gateway_replays_and_records() {
        let gateway = ScriptedGateway::new(["a", "b"]);
        let request = GenerationRequest {
            conversation_id: "c1".to_string(),
            messages: Vec::new(),
            model_id: None,
            regeneration: None,
        };

        let chunks: Vec<Vec<u8>> = gateway
            .stream(request.clone())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(gateway.requests(), vec![request]);
        assert!(
            ScriptedGateway::unavailable()
                .stream(GenerationRequest {
                    conversation_id: "c1".to_string(),
                    messages: Vec::new(),
                    model_id: None,
                    regeneration: None,
                })
                .await
                .is_err()
        );
    }
}
