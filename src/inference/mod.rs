pub mod bert_embedder;
pub mod qwen;
pub mod snapshot;

use anyhow::Result;
use serde::Serialize;

pub const DEFAULT_TEMPERATURE: f64 = 0.2;

/// Sentence embedding backend. Returns one pooled vector per input text.
pub trait TextEmbedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Chat-tuned causal LM. `generate` returns only the newly produced text,
/// never the rendered prompt.
pub trait ChatModel: Send + Sync {
    fn generate(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    /// `None` draws a fresh seed per request.
    pub seed: Option<u64>,
}

impl GenerationParams {
    pub fn new(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: DEFAULT_TEMPERATURE,
            seed: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}
