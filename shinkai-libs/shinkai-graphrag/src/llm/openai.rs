use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionResponseFormat, ChatCompletionResponseFormatType,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, FinishReason,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use ndarray::{Array1, Array2, Axis};
use ndarray_stats::SummaryStatisticsExt;
use tracing::warn;

use super::{
    base::{
        BaseLLM, BaseTextEmbedding, ChatMessage, ChatRole, GlobalSearchPhase, LLMParams, LLMResponse, LLMStream,
        LLMStreamChunk, TokenUsage,
    },
    utils::{chunk_text, num_tokens},
};

fn openai_client(api_key: Option<String>, api_base: Option<String>) -> Client<OpenAIConfig> {
    let mut config = OpenAIConfig::new();
    if let Some(api_key) = api_key {
        config = config.with_api_key(api_key);
    }
    if let Some(api_base) = api_base {
        config = config.with_api_base(api_base);
    }
    Client::with_config(config)
}

fn finish_reason_name(reason: FinishReason) -> Option<String> {
    serde_json::to_value(reason)
        .ok()
        .and_then(|value| value.as_str().map(|s| s.to_string()))
}

pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
    pub model: String,
    pub max_retries: usize,
}

impl ChatOpenAI {
    pub fn new(api_key: Option<String>, model: &str, max_retries: usize) -> Self {
        Self::with_api_base(api_key, None, model, max_retries)
    }

    /// Targets an OpenAI compatible endpoint, e.g. `http://localhost:8080/v1`.
    pub fn with_api_base(api_key: Option<String>, api_base: Option<String>, model: &str, max_retries: usize) -> Self {
        ChatOpenAI {
            client: openai_client(api_key, api_base),
            model: model.to_string(),
            max_retries,
        }
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: &LLMParams,
    ) -> anyhow::Result<CreateChatCompletionRequest> {
        let request_messages = messages
            .into_iter()
            .map(|message| -> anyhow::Result<ChatCompletionRequestMessage> {
                let request_message: ChatCompletionRequestMessage = match message.role {
                    ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(message.content)
                        .build()?
                        .into(),
                    ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content)
                        .build()?
                        .into(),
                    ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content)
                        .build()?
                        .into(),
                };
                Ok(request_message)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut request = CreateChatCompletionRequestArgs::default();
        request
            .model(self.model.clone())
            .messages(request_messages)
            .max_tokens(llm_params.max_tokens)
            .temperature(llm_params.temperature);

        if llm_params.json {
            request.response_format(ChatCompletionResponseFormat {
                r#type: ChatCompletionResponseFormatType::JsonObject,
            });
        }

        Ok(request.build()?)
    }

    async fn _agenerate(&self, messages: Vec<ChatMessage>, llm_params: &LLMParams) -> anyhow::Result<LLMResponse> {
        let request = self.build_request(messages, llm_params)?;
        let response = self.client.chat().create(request).await?;

        let usage = response.usage.map(|usage| {
            TokenUsage::new(usage.prompt_tokens as usize, usage.completion_tokens as usize)
        });

        match response.choices.into_iter().next() {
            Some(choice) => Ok(LLMResponse {
                content: choice.message.content.unwrap_or_default(),
                finish_reason: choice.finish_reason.and_then(finish_reason_name),
                usage,
            }),
            None => Ok(LLMResponse {
                content: String::new(),
                finish_reason: None,
                usage,
            }),
        }
    }
}

#[async_trait]
impl BaseLLM for ChatOpenAI {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn agenerate(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        _search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMResponse> {
        let mut retry_count = 0;

        loop {
            match self._agenerate(messages.clone(), &llm_params).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if retry_count < self.max_retries {
                        retry_count += 1;
                        warn!("OpenAI chat request failed, retrying ({}/{}): {}", retry_count, self.max_retries, e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn astream(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        _search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMStream> {
        let request = self.build_request(messages, &llm_params)?;
        let stream = self.client.chat().create_stream(request).await?;

        let stream = stream.map(|chunk| {
            let chunk = chunk?;
            let choice = chunk.choices.into_iter().next();
            Ok(match choice {
                Some(choice) => LLMStreamChunk {
                    delta: choice.delta.content.unwrap_or_default(),
                    finish_reason: choice.finish_reason.and_then(finish_reason_name),
                },
                None => LLMStreamChunk::default(),
            })
        });

        Ok(stream.boxed())
    }
}

pub struct OpenAIEmbedding {
    client: Client<OpenAIConfig>,
    pub model: String,
    pub max_tokens: usize,
    pub max_retries: usize,
}

impl OpenAIEmbedding {
    pub fn new(api_key: Option<String>, model: &str, max_tokens: usize, max_retries: usize) -> Self {
        Self::with_api_base(api_key, None, model, max_tokens, max_retries)
    }

    pub fn with_api_base(
        api_key: Option<String>,
        api_base: Option<String>,
        model: &str,
        max_tokens: usize,
        max_retries: usize,
    ) -> Self {
        OpenAIEmbedding {
            client: openai_client(api_key, api_base),
            model: model.to_string(),
            max_tokens,
            max_retries,
        }
    }

    async fn _aembed_with_retry(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut retry_count = 0;

        loop {
            match self._aembed(text).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if retry_count < self.max_retries {
                        retry_count += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn _aembed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input([text.to_string()])
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .unwrap_or_default();

        Ok(embedding)
    }
}

#[async_trait]
impl BaseTextEmbedding for OpenAIEmbedding {
    async fn aembed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let token_chunks = chunk_text(text, self.max_tokens)?;
        let mut chunk_embeddings = Vec::new();
        let mut chunk_lens = Vec::new();

        for chunk in token_chunks {
            let embedding = self._aembed_with_retry(&chunk).await?;
            chunk_embeddings.push(embedding);
            chunk_lens.push(num_tokens(&chunk));
        }

        combine_chunk_embeddings(chunk_embeddings, chunk_lens)
    }
}

/// Length-weighted average of chunk embeddings, normalized to unit length.
pub fn combine_chunk_embeddings(mut embeddings: Vec<Vec<f32>>, lens: Vec<usize>) -> anyhow::Result<Vec<f32>> {
    match embeddings.len() {
        0 => return Ok(Vec::new()),
        1 => return Ok(embeddings.swap_remove(0)),
        _ => {}
    }

    let rows = embeddings.len();
    let cols = embeddings[0].len();
    let flat_embeddings: Vec<f32> = embeddings.into_iter().flatten().collect();
    let array_embeddings = Array2::from_shape_vec((rows, cols), flat_embeddings)?;
    let array_lens = Array1::from_iter(lens.into_iter().map(|x| x as f32));

    let weighted_avg = array_embeddings
        .weighted_mean_axis(Axis(0), &array_lens)
        .map_err(|e| anyhow::anyhow!("Failed to average chunk embeddings: {}", e))?;

    let norm = weighted_avg.mapv(|x| x.powi(2)).sum().sqrt();
    if norm == 0.0 {
        return Ok(weighted_avg.to_vec());
    }

    Ok((weighted_avg / norm).to_vec())
}
