use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{GraphRagError, Result},
    llm::{
        base::{BaseLLM, ChatMessage, GlobalSearchPhase, LLMParams},
        cancellable::cancellable,
        utils::try_parse_json_object,
    },
};

/// Rating recorded when the reply carries no usable `rating` field.
const FALLBACK_RATING: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelevanceRating {
    pub rating: u32,
    pub ratings: Vec<u32>,
    pub llm_calls: usize,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
}

/// Asks the LLM `num_repeats` times how relevant `description` is to `query` and keeps the
/// majority rating.
#[allow(clippy::too_many_arguments)]
pub async fn rate_relevancy(
    query: &str,
    description: &str,
    llm: &dyn BaseLLM,
    num_tokens_fn: fn(&str) -> usize,
    rate_query: &str,
    num_repeats: usize,
    llm_params: &LLMParams,
    semaphore: &Semaphore,
    cancellation_token: &CancellationToken,
) -> Result<RelevanceRating> {
    let system_prompt = rate_query
        .replace("{description}", description)
        .replace("{question}", query);
    let messages = vec![ChatMessage::system(system_prompt.clone())];
    let prompt_tokens = num_tokens_fn(&system_prompt);

    let mut result = RelevanceRating::default();

    for _ in 0..num_repeats.max(1) {
        let response = cancellable(cancellation_token, async {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| GraphRagError::Llm(anyhow::anyhow!("Semaphore closed: {}", e)))?;
            llm.agenerate(
                messages.clone(),
                llm_params.clone(),
                Some(GlobalSearchPhase::CommunitySelection),
            )
            .await
            .map_err(GraphRagError::Llm)
        })
        .await?;

        let rating = try_parse_json_object(&response.content)
            .and_then(|value| parse_rating(&value))
            .unwrap_or_else(|| {
                debug!("Could not parse a rating from response: {}", response.content);
                FALLBACK_RATING
            });

        result.ratings.push(rating);
        result.llm_calls += 1;
        result.prompt_tokens += prompt_tokens;
        result.output_tokens += num_tokens_fn(&response.content);
    }

    result.rating = majority_vote(&result.ratings);
    Ok(result)
}

fn parse_rating(value: &Value) -> Option<u32> {
    match &value["rating"] {
        Value::Number(number) => number
            .as_u64()
            .map(|rating| rating as u32)
            .or_else(|| number.as_f64().map(|rating| rating.round().max(0.0) as u32)),
        Value::String(text) => text.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Most frequent rating. Ties go to the lowest rating.
pub fn majority_vote(ratings: &[u32]) -> u32 {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for rating in ratings {
        *counts.entry(*rating).or_default() += 1;
    }

    let mut winner: Option<(u32, usize)> = None;
    for (rating, count) in counts {
        match winner {
            Some((_, best)) if count <= best => {}
            _ => winner = Some((rating, count)),
        }
    }

    winner.map(|(rating, _)| rating).unwrap_or(FALLBACK_RATING)
}
