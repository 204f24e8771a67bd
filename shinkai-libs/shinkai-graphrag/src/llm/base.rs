use std::{fmt, str::FromStr};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "system" => Ok(ChatRole::System),
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            other => Err(format!("Invalid role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMParams {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

impl Default for LLMParams {
    fn default() -> Self {
        LLMParams {
            max_tokens: 2000,
            temperature: 0.0,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LLMResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl LLMResponse {
    pub fn new(content: impl Into<String>) -> Self {
        LLMResponse {
            content: content.into(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LLMStreamChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
}

impl LLMStreamChunk {
    pub fn is_stop(&self) -> bool {
        self.finish_reason.as_deref() == Some("stop")
    }

    /// Any finish reason ends the completion, `stop` or not.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

pub type LLMStream = BoxStream<'static, anyhow::Result<LLMStreamChunk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalSearchPhase {
    Map,
    Reduce,
    CommunitySelection,
}

#[async_trait]
pub trait BaseLLM: Send + Sync {
    fn model_name(&self) -> &str;

    async fn agenerate(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMResponse>;

    /// Streams the completion. Providers without native streaming yield the whole answer as
    /// one terminal chunk.
    async fn astream(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMStream> {
        let response = self.agenerate(messages, llm_params, search_phase).await?;
        let chunk = LLMStreamChunk {
            delta: response.content,
            finish_reason: Some(response.finish_reason.unwrap_or_else(|| "stop".to_string())),
        };
        Ok(stream::iter(vec![Ok(chunk)]).boxed())
    }
}

#[async_trait]
pub trait BaseTextEmbedding: Send + Sync {
    async fn aembed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}
