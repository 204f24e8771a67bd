use std::{pin::Pin, sync::Arc};

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    context_builder::{
        context_table::ContextRecords,
        conversation_history::{ConversationRole, SharedConversationHistory},
    },
    error::{GraphRagError, Result},
    llm::base::{ChatMessage, LLMStream, TokenUsage},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub answer: String,
    pub score: f64,
}

/// Outcome of one map call over a single batch of community reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapResponse {
    pub key_points: Vec<KeyPoint>,
    pub context_text: String,
    pub completion_time: f64,
    pub llm_calls: usize,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchDetails {
    pub context_text: Vec<String>,
    pub context_records: ContextRecords,
    pub completion_time: f64,
    pub llm_calls: usize,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    pub map_responses: Vec<MapResponse>,
    pub reduce_context_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub choice: Choice,
    pub usage: TokenUsage,
    /// Only filled in verbose mode.
    pub details: Option<SearchDetails>,
}

impl SearchResult {
    pub fn new(
        model: &str,
        answer: String,
        finish_reason: Option<String>,
        usage: TokenUsage,
        details: Option<SearchDetails>,
    ) -> Self {
        SearchResult {
            id: completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choice: Choice {
                index: 0,
                message: ChatMessage::assistant(answer),
                finish_reason,
            },
            usage,
            details,
        }
    }

    pub fn response(&self) -> &str {
        &self.choice.message.content
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchChunk {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub delta: String,
    pub finish_reason: Option<String>,
    /// Attached to the terminal chunk only, in verbose mode.
    pub details: Option<SearchDetails>,
}

pub type SearchStream = Pin<Box<dyn Stream<Item = Result<SearchChunk>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub streaming: bool,
    pub verbose: bool,
    pub cancellation_token: CancellationToken,
}

impl SearchOptions {
    pub fn streaming() -> Self {
        SearchOptions {
            streaming: true,
            ..Default::default()
        }
    }

    pub fn verbose() -> Self {
        SearchOptions {
            verbose: true,
            ..Default::default()
        }
    }
}

pub enum SearchOutput {
    Complete(SearchResult),
    Stream(SearchStream),
}

impl SearchOutput {
    pub fn into_result(self) -> Option<SearchResult> {
        match self {
            SearchOutput::Complete(result) => Some(result),
            SearchOutput::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<SearchStream> {
        match self {
            SearchOutput::Stream(stream) => Some(stream),
            SearchOutput::Complete(_) => None,
        }
    }
}

/// Observer of search progress. Every hook defaults to a no-op.
pub trait SearchCallback: Send + Sync {
    fn on_context(&self, _context: &[String]) {}

    fn on_map_response_start(&self, _map_response_contexts: &[String]) {}

    fn on_map_response_end(&self, _map_response_outputs: &[MapResponse]) {}

    fn on_reduce_response_start(&self, _reduce_response_context: &str) {}

    fn on_llm_new_token(&self, _token: &str) {}
}

pub(crate) fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// Appends the finished exchange to the shared history.
pub(crate) async fn record_exchange(conversation_history: Option<&SharedConversationHistory>, query: &str, answer: &str) {
    if let Some(conversation_history) = conversation_history {
        let mut conversation_history = conversation_history.write().await;
        conversation_history.add_turn(ConversationRole::User, query);
        conversation_history.add_turn(ConversationRole::Assistant, answer);
    }
}

/// Forwards an LLM stream as search chunks.
///
/// The history is updated and `details` attached on the first chunk carrying a finish reason. When the LLM
/// stream ends without one, the exchange is still recorded and any `details` follow in an empty closing
/// chunk. A cancelled token ends the stream with `GraphRagError::Cancelled` and drops the LLM stream.
pub(crate) fn stream_search_response(
    llm_stream: LLMStream,
    model: String,
    query: String,
    conversation_history: Option<SharedConversationHistory>,
    details: Option<SearchDetails>,
    callbacks: Vec<Arc<dyn SearchCallback>>,
    cancellation_token: CancellationToken,
) -> SearchStream {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp();

    let stream = try_stream! {
        let mut llm_stream = llm_stream;
        let mut details = details;
        let mut answer = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => Err(GraphRagError::Cancelled),
                chunk = llm_stream.next() => Ok(chunk),
            };

            let next = next?;
            let Some(chunk) = next else {
                debug!("LLM stream ended without a finish reason");
                record_exchange(conversation_history.as_ref(), &query, &answer).await;
                if let Some(details) = details.take() {
                    yield SearchChunk {
                        id: id.clone(),
                        created,
                        model: model.clone(),
                        delta: String::new(),
                        finish_reason: None,
                        details: Some(details),
                    };
                }
                break;
            };
            let chunk = chunk.map_err(GraphRagError::Llm)?;

            for callback in &callbacks {
                callback.on_llm_new_token(&chunk.delta);
            }
            answer.push_str(&chunk.delta);

            let is_terminal = chunk.is_terminal();
            if is_terminal {
                if !chunk.is_stop() {
                    debug!("LLM stream finished with {:?}", chunk.finish_reason);
                }
                record_exchange(conversation_history.as_ref(), &query, &answer).await;
            }

            yield SearchChunk {
                id: id.clone(),
                created,
                model: model.clone(),
                delta: chunk.delta,
                finish_reason: chunk.finish_reason,
                details: if is_terminal { details.take() } else { None },
            };

            if is_terminal {
                break;
            }
        }
    };

    Box::pin(stream)
}
