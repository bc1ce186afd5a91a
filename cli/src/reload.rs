//! Hot-swappable LLM client wrapper backing SIGHUP config reload: the daemon
//! keeps one handle while the endpoint URL or model name changes underneath.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use hearth::llm::{LlmError, LlmResponse, SdkEvent};
use hearth::{LlmClient, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ReloadableLlm {
    inner: RwLock<Arc<dyn LlmClient>>,
}

impl ReloadableLlm {
    pub fn new(inner: Arc<dyn LlmClient>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Replaces the client; in-flight calls finish on the old one.
    pub fn swap(&self, inner: Arc<dyn LlmClient>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = inner;
        }
    }

    fn current(&self) -> Arc<dyn LlmClient> {
        self.inner
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl LlmClient for ReloadableLlm {
    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        self.current().invoke(messages).await
    }

    async fn invoke_structured(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        self.current().invoke_structured(messages, schema).await
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        events: mpsc::Sender<SdkEvent>,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        self.current().invoke_stream(messages, events, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth::MockLlm;

    #[tokio::test]
    async fn swap_changes_responses() {
        let llm = ReloadableLlm::new(Arc::new(MockLlm::new("old")));
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "old");
        llm.swap(Arc::new(MockLlm::new("new")));
        assert_eq!(llm.invoke(&[]).await.unwrap().content, "new");
    }
}
