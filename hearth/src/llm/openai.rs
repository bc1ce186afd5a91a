//! OpenAI-compatible Chat Completions client implementing [`LlmClient`].
//!
//! Points at `HEARTH_LLM_BASE_URL` (or the async-openai default) and uses
//! `OPENAI_API_KEY` from the environment unless configured explicitly.
//! Streaming reads `choices[0].delta.content` per chunk and classifies it as
//! [`SdkEvent::Text`]; cancellation drops the stream, which aborts the HTTP
//! request.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
    },
    Client,
};

use super::{LlmClient, LlmError, LlmResponse, LlmUsage, SdkEvent};
use crate::message::Message;

/// OpenAI-compatible chat client.
pub struct ChatOpenAi {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
}

impl ChatOpenAi {
    /// Default config: API key from `OPENAI_API_KEY`, base URL from config.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            temperature: None,
        }
    }

    /// Custom config (API key, base URL).
    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            temperature: None,
        }
    }

    /// Convenience for the daemon: optional base-URL override from settings.
    pub fn from_settings(base_url: Option<&str>, model: impl Into<String>) -> Self {
        match base_url {
            Some(url) => {
                Self::with_config(OpenAIConfig::new().with_api_base(url.to_string()), model)
            }
            None => Self::new(model),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn messages_to_request(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System(s) => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(s.as_str()),
                ),
                Message::User(s) => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(s.as_str()),
                ),
                Message::Assistant(s) => {
                    ChatCompletionRequestMessage::Assistant((s.as_str()).into())
                }
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(Self::messages_to_request(messages));
        if stream {
            args.stream(true);
        }
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        args.build()
            .map_err(|e| LlmError::Api(format!("request build failed: {}", e)))
    }
}

#[async_trait]
impl LlmClient for ChatOpenAi {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let request = self.build_request(messages, false)?;
        debug!(model = %self.model, message_count = messages.len(), "chat create");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Api("no choices in response".to_string()))?;
        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: response.usage.map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        events: mpsc::Sender<SdkEvent>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let request = self.build_request(messages, true)?;
        debug!(model = %self.model, message_count = messages.len(), "chat create_stream");
        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let mut full_content = String::new();
        let mut usage: Option<LlmUsage> = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                n = stream.next() => n,
            };
            let Some(result) = next else { break };
            let chunk = result.map_err(|e| LlmError::Api(e.to_string()))?;
            if let Some(ref u) = chunk.usage {
                usage = Some(LlmUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
            }
            for choice in chunk.choices {
                if let Some(ref content) = choice.delta.content {
                    if !content.is_empty() {
                        full_content.push_str(content);
                        if events.send(SdkEvent::Text(content.clone())).await.is_err() {
                            return Err(LlmError::Cancelled);
                        }
                    }
                }
            }
        }
        Ok(LlmResponse {
            content: full_content,
            usage,
        })
    }
}
