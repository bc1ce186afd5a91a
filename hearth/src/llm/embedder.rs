//! Embedder trait plus the OpenAI-compatible implementation and a
//! deterministic mock for tests.

use async_trait::async_trait;

use async_openai::{
    config::OpenAIConfig,
    types::embeddings::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};

use super::LlmError;

/// Produces fixed-size float vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Vector dimension returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embeddings client.
pub struct OpenAiEmbedder {
    config: OpenAIConfig,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            config: OpenAIConfig::new(),
            model: model.into(),
            dimension,
        }
    }

    pub fn with_config(config: OpenAIConfig, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            config,
            model: model.into(),
            dimension,
        }
    }

    pub fn from_settings(
        base_url: Option<&str>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        match base_url {
            Some(url) => Self::with_config(
                OpenAIConfig::new().with_api_base(url.to_string()),
                model,
                dimension,
            ),
            None => Self::new(model, dimension),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, LlmError> {
        let inputs: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        let input = if inputs.len() == 1 {
            EmbeddingInput::String(inputs.into_iter().next().unwrap_or_default())
        } else {
            EmbeddingInput::StringArray(inputs)
        };
        let request = CreateEmbeddingRequest {
            input,
            model: self.model.clone(),
            ..Default::default()
        };
        let client = Client::with_config(self.config.clone());
        let response = client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;
        if response.data.is_empty() {
            return Err(LlmError::Api("no embedding returned".to_string()));
        }
        Ok(response.data.into_iter().map(|e| e.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedder for tests: same text always yields the same unit
/// vector, different texts (almost always) different ones.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        let mut v = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            v.push((hasher.finish() % 1000) as f32 / 1000.0 + 0.001);
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
