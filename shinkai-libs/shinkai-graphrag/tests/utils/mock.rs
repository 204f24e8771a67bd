use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use shinkai_graphrag::llm::base::{
    BaseLLM, BaseTextEmbedding, ChatMessage, GlobalSearchPhase, LLMParams, LLMResponse, LLMStream, LLMStreamChunk,
};

type Responder = Box<dyn Fn(&[ChatMessage], Option<GlobalSearchPhase>) -> String + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub llm_params: LLMParams,
    pub search_phase: Option<GlobalSearchPhase>,
}

impl RecordedCall {
    pub fn system_prompt(&self) -> &str {
        self.messages.first().map(|message| message.content.as_str()).unwrap_or_default()
    }
}

/// Scripted chat model. Replies come from `responder`, every call is recorded.
pub struct MockLLM {
    responder: Responder,
    delay: Option<Duration>,
    final_finish_reason: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockLLM {
    pub fn new(
        responder: impl Fn(&[ChatMessage], Option<GlobalSearchPhase>) -> String + Send + Sync + 'static,
    ) -> Self {
        MockLLM {
            responder: Box::new(responder),
            delay: None,
            final_finish_reason: Some("stop".to_string()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Finish reason of the last streamed chunk. `None` ends the stream without one.
    pub fn with_final_finish_reason(mut self, finish_reason: Option<&str>) -> Self {
        self.final_finish_reason = finish_reason.map(String::from);
        self
    }

    /// Most calls ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_in_phase(&self, search_phase: GlobalSearchPhase) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.search_phase == Some(search_phase))
            .collect()
    }

    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        search_phase: Option<GlobalSearchPhase>,
    ) -> String {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let content = (self.responder)(&messages, search_phase);
        self.calls.lock().unwrap().push(RecordedCall {
            messages,
            llm_params,
            search_phase,
        });
        content
    }
}

#[async_trait]
impl BaseLLM for MockLLM {
    fn model_name(&self) -> &str {
        "mock-llm"
    }

    async fn agenerate(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMResponse> {
        Ok(LLMResponse::new(self.respond(messages, llm_params, search_phase).await))
    }

    /// One chunk per word, the last one carrying the final finish reason.
    async fn astream(
        &self,
        messages: Vec<ChatMessage>,
        llm_params: LLMParams,
        search_phase: Option<GlobalSearchPhase>,
    ) -> anyhow::Result<LLMStream> {
        let content = self.respond(messages, llm_params, search_phase).await;
        let words: Vec<String> = content.split_inclusive(' ').map(String::from).collect();
        let last = words.len().saturating_sub(1);
        let final_finish_reason = self.final_finish_reason.clone();

        let chunks: Vec<anyhow::Result<LLMStreamChunk>> = words
            .into_iter()
            .enumerate()
            .map(|(index, delta)| {
                Ok(LLMStreamChunk {
                    delta,
                    finish_reason: if index == last { final_finish_reason.clone() } else { None },
                })
            })
            .collect();

        Ok(stream::iter(chunks).boxed())
    }
}

/// Embeds every text to the same vector.
pub struct ConstantEmbedding;

#[async_trait]
impl BaseTextEmbedding for ConstantEmbedding {
    async fn aembed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}
