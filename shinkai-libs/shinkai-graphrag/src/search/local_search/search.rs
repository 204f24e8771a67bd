use std::{sync::Arc, time::Instant};

use tracing::{instrument, warn};

use crate::{
    context_builder::{context_builder::LocalContextBuilder, conversation_history::SharedConversationHistory},
    error::{GraphRagError, Result},
    llm::{
        base::{BaseLLM, ChatMessage, LLMParams, TokenUsage},
        cancellable::cancellable,
    },
    search::base::{
        record_exchange, stream_search_response, SearchCallback, SearchDetails, SearchOptions, SearchOutput,
        SearchResult,
    },
};

use super::{mixed_context::MixedContextBuilderParams, prompts::LOCAL_SEARCH_SYSTEM_PROMPT};

pub struct LocalSearchParams {
    pub llm: Arc<dyn BaseLLM>,
    pub context_builder: Box<dyn LocalContextBuilder>,
    pub num_tokens_fn: fn(&str) -> usize,
    pub system_prompt: Option<String>,
    pub response_type: String,
    pub llm_params: LLMParams,
    pub context_builder_params: MixedContextBuilderParams,
    pub callbacks: Option<Vec<Arc<dyn SearchCallback>>>,
}

impl LocalSearchParams {
    pub fn new(
        llm: Arc<dyn BaseLLM>,
        context_builder: Box<dyn LocalContextBuilder>,
        num_tokens_fn: fn(&str) -> usize,
    ) -> Self {
        LocalSearchParams {
            llm,
            context_builder,
            num_tokens_fn,
            system_prompt: None,
            response_type: "multiple paragraphs".to_string(),
            llm_params: LLMParams::default(),
            context_builder_params: MixedContextBuilderParams::default(),
            callbacks: None,
        }
    }
}

/// Single LLM call over a context mixing entities, relationships, reports and source texts.
pub struct LocalSearch {
    llm: Arc<dyn BaseLLM>,
    context_builder: Box<dyn LocalContextBuilder>,
    num_tokens_fn: fn(&str) -> usize,
    system_prompt: String,
    response_type: String,
    llm_params: LLMParams,
    context_builder_params: MixedContextBuilderParams,
    callbacks: Vec<Arc<dyn SearchCallback>>,
}

impl LocalSearch {
    pub fn new(local_search_params: LocalSearchParams) -> Result<Self> {
        let LocalSearchParams {
            llm,
            context_builder,
            num_tokens_fn,
            system_prompt,
            response_type,
            llm_params,
            context_builder_params,
            callbacks,
        } = local_search_params;

        context_builder_params.validate()?;

        let system_prompt = system_prompt.unwrap_or_else(|| LOCAL_SEARCH_SYSTEM_PROMPT.to_string());
        if !system_prompt.contains("{context_data}") {
            warn!("Local search system prompt does not contain the {{context_data}} placeholder");
        }

        Ok(LocalSearch {
            llm,
            context_builder,
            num_tokens_fn,
            system_prompt,
            response_type,
            llm_params,
            context_builder_params,
            callbacks: callbacks.unwrap_or_default(),
        })
    }

    #[instrument(skip_all, fields(query = %query))]
    pub async fn search(
        &self,
        query: &str,
        conversation_history: Option<SharedConversationHistory>,
        options: SearchOptions,
    ) -> Result<SearchOutput> {
        let start_time = Instant::now();
        let cancellation_token = &options.cancellation_token;

        let history_snapshot = match &conversation_history {
            Some(history) => Some(history.read().await.clone()),
            None => None,
        };

        let (context_text, context_records) = cancellable(
            cancellation_token,
            self.context_builder
                .build_context(query, history_snapshot.as_ref(), &self.context_builder_params),
        )
        .await?;

        for callback in &self.callbacks {
            callback.on_context(std::slice::from_ref(&context_text));
        }

        let search_prompt = self
            .system_prompt
            .replace("{context_data}", &context_text)
            .replace("{response_type}", &self.response_type);

        let mut search_messages = vec![ChatMessage::system(search_prompt.clone())];
        if let Some(history) = &history_snapshot {
            search_messages
                .extend(history.to_recent_messages(self.context_builder_params.conversation_history_max_turns));
        }
        search_messages.push(ChatMessage::user(query));

        let prompt_tokens: usize = search_messages
            .iter()
            .map(|message| (self.num_tokens_fn)(&message.content))
            .sum();

        let mut details = SearchDetails {
            context_text: vec![context_text],
            context_records,
            llm_calls: 1,
            prompt_tokens,
            ..Default::default()
        };

        if options.streaming {
            let llm_stream = cancellable(cancellation_token, async {
                self.llm
                    .astream(search_messages, self.llm_params.clone(), None)
                    .await
                    .map_err(GraphRagError::Llm)
            })
            .await?;

            details.completion_time = start_time.elapsed().as_secs_f64();

            return Ok(SearchOutput::Stream(stream_search_response(
                llm_stream,
                self.llm.model_name().to_string(),
                query.to_string(),
                conversation_history,
                options.verbose.then_some(details),
                self.callbacks.clone(),
                options.cancellation_token.clone(),
            )));
        }

        let search_response = cancellable(cancellation_token, async {
            self.llm
                .agenerate(search_messages, self.llm_params.clone(), None)
                .await
                .map_err(GraphRagError::Llm)
        })
        .await?;

        details.output_tokens = (self.num_tokens_fn)(&search_response.content);
        details.completion_time = start_time.elapsed().as_secs_f64();

        record_exchange(conversation_history.as_ref(), query, &search_response.content).await;

        let usage = TokenUsage::new(details.prompt_tokens, details.output_tokens);
        Ok(SearchOutput::Complete(SearchResult::new(
            self.llm.model_name(),
            search_response.content,
            search_response.finish_reason,
            usage,
            options.verbose.then_some(details),
        )))
    }
}
