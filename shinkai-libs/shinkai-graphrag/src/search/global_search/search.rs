use std::{cmp::Ordering, sync::Arc, time::Instant};

use futures::{
    future::join_all,
    stream::{self, StreamExt},
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::{
    context_builder::{
        community_context::CommunityContextBuilderParams, context_builder::GlobalContextBuilder,
        conversation_history::SharedConversationHistory,
    },
    error::{GraphRagError, Result},
    llm::{
        base::{BaseLLM, ChatMessage, GlobalSearchPhase, LLMParams, LLMStream, LLMStreamChunk, TokenUsage},
        cancellable::cancellable,
        utils::try_parse_json_object,
    },
    search::base::{
        record_exchange, stream_search_response, KeyPoint, MapResponse, SearchCallback, SearchDetails, SearchOptions,
        SearchOutput, SearchResult,
    },
};

use super::prompts::{GENERAL_KNOWLEDGE_INSTRUCTION, MAP_SYSTEM_PROMPT, NO_DATA_ANSWER, REDUCE_SYSTEM_PROMPT};

pub struct GlobalSearchParams {
    pub llm: Arc<dyn BaseLLM>,
    pub context_builder: Box<dyn GlobalContextBuilder>,
    pub num_tokens_fn: fn(&str) -> usize,
    pub map_system_prompt: Option<String>,
    pub reduce_system_prompt: Option<String>,
    pub response_type: String,
    pub allow_general_knowledge: bool,
    pub general_knowledge_inclusion_prompt: Option<String>,
    /// Ask for JSON object replies in the map phase.
    pub json_mode: bool,
    pub callbacks: Option<Vec<Arc<dyn SearchCallback>>>,
    /// Token budget of the analyst blocks fed to the reduce call.
    pub max_data_tokens: usize,
    pub map_max_length: usize,
    pub reduce_max_length: usize,
    pub map_llm_params: LLMParams,
    pub reduce_llm_params: LLMParams,
    pub context_builder_params: CommunityContextBuilderParams,
    pub concurrent_coroutines: usize,
}

impl GlobalSearchParams {
    pub fn new(
        llm: Arc<dyn BaseLLM>,
        context_builder: Box<dyn GlobalContextBuilder>,
        num_tokens_fn: fn(&str) -> usize,
    ) -> Self {
        GlobalSearchParams {
            llm,
            context_builder,
            num_tokens_fn,
            map_system_prompt: None,
            reduce_system_prompt: None,
            response_type: "multiple paragraphs".to_string(),
            allow_general_knowledge: false,
            general_knowledge_inclusion_prompt: None,
            json_mode: true,
            callbacks: None,
            max_data_tokens: 8000,
            map_max_length: 1000,
            reduce_max_length: 2000,
            map_llm_params: LLMParams {
                max_tokens: 1000,
                ..Default::default()
            },
            reduce_llm_params: LLMParams {
                max_tokens: 2000,
                ..Default::default()
            },
            context_builder_params: CommunityContextBuilderParams::default(),
            concurrent_coroutines: 32,
        }
    }
}

/// Map-reduce search over community report batches.
pub struct GlobalSearch {
    llm: Arc<dyn BaseLLM>,
    context_builder: Box<dyn GlobalContextBuilder>,
    num_tokens_fn: fn(&str) -> usize,
    map_system_prompt: String,
    reduce_system_prompt: String,
    response_type: String,
    allow_general_knowledge: bool,
    general_knowledge_inclusion_prompt: String,
    callbacks: Vec<Arc<dyn SearchCallback>>,
    max_data_tokens: usize,
    map_max_length: usize,
    reduce_max_length: usize,
    map_llm_params: LLMParams,
    reduce_llm_params: LLMParams,
    context_builder_params: CommunityContextBuilderParams,
    semaphore: Semaphore,
}

impl GlobalSearch {
    pub fn new(global_search_params: GlobalSearchParams) -> Result<Self> {
        let GlobalSearchParams {
            llm,
            context_builder,
            num_tokens_fn,
            map_system_prompt,
            reduce_system_prompt,
            response_type,
            allow_general_knowledge,
            general_knowledge_inclusion_prompt,
            json_mode,
            callbacks,
            max_data_tokens,
            map_max_length,
            reduce_max_length,
            mut map_llm_params,
            reduce_llm_params,
            context_builder_params,
            concurrent_coroutines,
        } = global_search_params;

        if concurrent_coroutines == 0 {
            return Err(GraphRagError::config("concurrent_coroutines must be greater than 0"));
        }
        if max_data_tokens == 0 {
            return Err(GraphRagError::config("max_data_tokens must be greater than 0"));
        }
        context_builder_params.validate()?;

        let map_system_prompt = map_system_prompt.unwrap_or_else(|| MAP_SYSTEM_PROMPT.to_string());
        let reduce_system_prompt = reduce_system_prompt.unwrap_or_else(|| REDUCE_SYSTEM_PROMPT.to_string());
        let general_knowledge_inclusion_prompt =
            general_knowledge_inclusion_prompt.unwrap_or_else(|| GENERAL_KNOWLEDGE_INSTRUCTION.to_string());

        if !map_system_prompt.contains("{context_data}") {
            warn!("Map system prompt does not contain the {{context_data}} placeholder");
        }
        if !reduce_system_prompt.contains("{report_data}") {
            warn!("Reduce system prompt does not contain the {{report_data}} placeholder");
        }

        map_llm_params.json = json_mode;

        Ok(GlobalSearch {
            llm,
            context_builder,
            num_tokens_fn,
            map_system_prompt,
            reduce_system_prompt,
            response_type,
            allow_general_knowledge,
            general_knowledge_inclusion_prompt,
            callbacks: callbacks.unwrap_or_default(),
            max_data_tokens,
            map_max_length,
            reduce_max_length,
            map_llm_params,
            reduce_llm_params,
            context_builder_params,
            semaphore: Semaphore::new(concurrent_coroutines),
        })
    }

    /// Answers `query` from every relevant community report.
    ///
    /// In streaming mode the map phase completes before the stream is returned; only the reduce answer is
    /// streamed. The exchange is appended to `conversation_history` once the answer is complete.
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

        // Step 1: answer the query against every batch of community reports
        let context = self
            .context_builder
            .build_context(
                query,
                history_snapshot.as_ref(),
                &self.context_builder_params,
                cancellation_token,
            )
            .await?;

        for callback in &self.callbacks {
            callback.on_context(&context.context_chunks);
            callback.on_map_response_start(&context.context_chunks);
        }

        let map_responses = join_all(
            context
                .context_chunks
                .iter()
                .map(|batch| self.map_response_single_batch(batch, query, &options)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<MapResponse>>>()?;

        for callback in &self.callbacks {
            callback.on_map_response_end(&map_responses);
        }

        info!("Map phase produced {} responses", map_responses.len());

        let mut details = SearchDetails {
            llm_calls: context.llm_calls + map_responses.iter().map(|response| response.llm_calls).sum::<usize>(),
            prompt_tokens: context.prompt_tokens
                + map_responses.iter().map(|response| response.prompt_tokens).sum::<usize>(),
            output_tokens: context.output_tokens
                + map_responses.iter().map(|response| response.output_tokens).sum::<usize>(),
            context_text: context.context_chunks,
            context_records: context.context_records,
            ..Default::default()
        };

        // Step 2: combine the key points of every analyst into the final answer
        let report_data = format_key_points(&map_responses, self.num_tokens_fn, self.max_data_tokens);
        details.map_responses = map_responses;

        let report_data = match report_data {
            Some(report_data) => report_data,
            None if self.allow_general_knowledge => String::new(),
            None => {
                warn!("All map responses have score 0, returning the no data answer");
                details.completion_time = start_time.elapsed().as_secs_f64();
                return self
                    .no_data_response(query, conversation_history, details, options)
                    .await;
            }
        };

        for callback in &self.callbacks {
            callback.on_reduce_response_start(&report_data);
        }

        let mut search_prompt = self
            .reduce_system_prompt
            .replace("{report_data}", &report_data)
            .replace("{response_type}", &self.response_type)
            .replace("{max_length}", &self.reduce_max_length.to_string());
        if self.allow_general_knowledge {
            search_prompt.push('\n');
            search_prompt.push_str(&self.general_knowledge_inclusion_prompt);
        }

        let search_messages = vec![ChatMessage::system(search_prompt.clone()), ChatMessage::user(query)];

        details.llm_calls += 1;
        details.prompt_tokens += (self.num_tokens_fn)(&search_prompt);
        details.reduce_context_text = Some(report_data);

        if options.streaming {
            let llm_stream = cancellable(cancellation_token, async {
                self.llm
                    .astream(
                        search_messages,
                        self.reduce_llm_params.clone(),
                        Some(GlobalSearchPhase::Reduce),
                    )
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
                .agenerate(
                    search_messages,
                    self.reduce_llm_params.clone(),
                    Some(GlobalSearchPhase::Reduce),
                )
                .await
                .map_err(GraphRagError::Llm)
        })
        .await?;

        details.output_tokens += (self.num_tokens_fn)(&search_response.content);
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

    async fn map_response_single_batch(
        &self,
        context_data: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<MapResponse> {
        let start_time = Instant::now();
        let search_prompt = self
            .map_system_prompt
            .replace("{context_data}", context_data)
            .replace("{max_length}", &self.map_max_length.to_string());

        let search_messages = vec![ChatMessage::system(search_prompt.clone()), ChatMessage::user(query)];

        let search_response = cancellable(&options.cancellation_token, async {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| GraphRagError::Llm(anyhow::anyhow!("Semaphore closed: {}", e)))?;
            self.llm
                .agenerate(search_messages, self.map_llm_params.clone(), Some(GlobalSearchPhase::Map))
                .await
                .map_err(GraphRagError::Llm)
        })
        .await?;

        let key_points = parse_search_response(&search_response.content);

        Ok(MapResponse {
            key_points,
            context_text: context_data.to_string(),
            completion_time: start_time.elapsed().as_secs_f64(),
            llm_calls: 1,
            prompt_tokens: (self.num_tokens_fn)(&search_prompt),
            output_tokens: (self.num_tokens_fn)(&search_response.content),
        })
    }

    async fn no_data_response(
        &self,
        query: &str,
        conversation_history: Option<SharedConversationHistory>,
        details: SearchDetails,
        options: SearchOptions,
    ) -> Result<SearchOutput> {
        let usage = TokenUsage::new(details.prompt_tokens, details.output_tokens);
        let details = options.verbose.then_some(details);

        if options.streaming {
            let chunk = LLMStreamChunk {
                delta: NO_DATA_ANSWER.to_string(),
                finish_reason: Some("stop".to_string()),
            };
            let llm_stream: LLMStream = stream::iter(vec![Ok(chunk)]).boxed();
            return Ok(SearchOutput::Stream(stream_search_response(
                llm_stream,
                self.llm.model_name().to_string(),
                query.to_string(),
                conversation_history,
                details,
                self.callbacks.clone(),
                options.cancellation_token,
            )));
        }

        record_exchange(conversation_history.as_ref(), query, NO_DATA_ANSWER).await;

        Ok(SearchOutput::Complete(SearchResult::new(
            self.llm.model_name(),
            NO_DATA_ANSWER.to_string(),
            Some("stop".to_string()),
            usage,
            details,
        )))
    }
}

/// Extracts the key points of a map reply.
///
/// A reply without a JSON `points` array yields one empty point with score 0. Points missing a
/// description or a numeric score are skipped.
pub fn parse_search_response(search_response: &str) -> Vec<KeyPoint> {
    let points = try_parse_json_object(search_response)
        .and_then(|value| value.get("points").and_then(|points| points.as_array()).cloned());

    let Some(points) = points else {
        warn!("Map response is not a JSON object with a points array");
        debug!("Unparsable map response: {}", search_response);
        return vec![KeyPoint {
            answer: String::new(),
            score: 0.0,
        }];
    };

    points
        .iter()
        .filter_map(|point| {
            let answer = point.get("description")?.as_str()?;
            let score = match point.get("score")? {
                Value::Number(score) => score.as_f64()?,
                Value::String(score) => score.trim().parse::<f64>().ok()?,
                _ => return None,
            };
            Some(KeyPoint {
                answer: answer.to_string(),
                score,
            })
        })
        .collect()
}

/// Renders the positive-score key points of all analysts, best first, under `max_data_tokens`.
///
/// Returns `None` when no analyst produced a positive-score point.
pub fn format_key_points(
    map_responses: &[MapResponse],
    num_tokens_fn: fn(&str) -> usize,
    max_data_tokens: usize,
) -> Option<String> {
    let mut key_points: Vec<(usize, &KeyPoint)> = map_responses
        .iter()
        .enumerate()
        .flat_map(|(index, response)| response.key_points.iter().map(move |point| (index, point)))
        .filter(|(_, point)| point.score > 0.0)
        .collect();

    if key_points.is_empty() {
        return None;
    }

    key_points.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(Ordering::Equal));

    let mut data = Vec::new();
    let mut total_tokens = 0;
    for (analyst, point) in key_points {
        let formatted_response_text = format!(
            "----Analyst {}----\nImportance Score: {}\n{}",
            analyst + 1,
            point.score,
            point.answer
        );
        let tokens = num_tokens_fn(&formatted_response_text);
        if total_tokens + tokens > max_data_tokens {
            warn!("Reduce context reached max_data_tokens ({}), dropping lower scored points", max_data_tokens);
            break;
        }
        total_tokens += tokens;
        data.push(formatted_response_text);
    }

    Some(data.join("\n\n"))
}
