use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::base::{BaseLLM, BaseTextEmbedding, ChatMessage, GlobalSearchPhase, LLMParams, LLMResponse, TokenUsage};

#[derive(Serialize, Deserialize, Debug)]
pub struct OllamaChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: OllamaChatMessage,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<usize>,
    #[serde(default)]
    pub eval_count: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct OllamaChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct OllamaEmbeddingResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
}

pub struct OllamaChat {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaChat {
    pub fn new(base_url: &str, model: &str) -> Self {
        OllamaChat {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl BaseLLM for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn agenerate(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        _search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMResponse> {
        let chat_url = format!("{}{}", &self.base_url, "/api/chat");

        let messages_json: Vec<OllamaChatMessage> = messages
            .into_iter()
            .map(|message| OllamaChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content,
            })
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages_json,
            "options": {
                "num_predict": llm_params.max_tokens,
                "temperature": llm_params.temperature,
            },
            "stream": false,
        });

        if llm_params.json {
            payload["format"] = json!("json");
        }

        let response = self.client.post(chat_url).json(&payload).send().await?;
        let response = response.error_for_status()?.json::<OllamaChatResponse>().await?;

        let usage = match (response.prompt_eval_count, response.eval_count) {
            (Some(prompt_tokens), Some(completion_tokens)) => Some(TokenUsage::new(prompt_tokens, completion_tokens)),
            _ => None,
        };

        Ok(LLMResponse {
            content: response.message.content,
            finish_reason: Some(response.done_reason.unwrap_or_else(|| "stop".to_string())),
            usage,
        })
    }
}

pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedding {
    pub fn new(base_url: &str, model: &str) -> Self {
        OllamaEmbedding {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl BaseTextEmbedding for OllamaEmbedding {
    async fn aembed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let embedding_url = format!("{}{}", &self.base_url, "/api/embed");

        let payload = json!({
            "model": self.model,
            "input": text,
        });

        let response = self.client.post(embedding_url).json(&payload).send().await?;
        let response = response.error_for_status()?.json::<OllamaEmbeddingResponse>().await?;

        Ok(response.embeddings.into_iter().next().unwrap_or_default())
    }
}
