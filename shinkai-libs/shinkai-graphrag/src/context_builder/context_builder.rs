use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, search::local_search::mixed_context::MixedContextBuilderParams};

use super::{
    community_context::CommunityContextBuilderParams, context_table::ContextRecords,
    conversation_history::ConversationHistory,
};

#[derive(Debug, Clone, Default)]
pub struct ContextBuilderResult {
    pub context_chunks: Vec<String>,
    pub context_records: ContextRecords,
    pub llm_calls: usize,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
}

#[async_trait]
pub trait GlobalContextBuilder: Send + Sync {
    /// Build the context for the global search mode.
    async fn build_context(
        &self,
        query: &str,
        conversation_history: Option<&ConversationHistory>,
        context_builder_params: &CommunityContextBuilderParams,
        cancellation_token: &CancellationToken,
    ) -> Result<ContextBuilderResult>;
}

#[async_trait]
pub trait LocalContextBuilder: Send + Sync {
    /// Build the context for the local search mode.
    async fn build_context(
        &self,
        query: &str,
        conversation_history: Option<&ConversationHistory>,
        context_builder_params: &MixedContextBuilderParams,
    ) -> Result<(String, ContextRecords)>;
}
