use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use async_trait::async_trait;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{GraphRagError, Result},
    models::{CommunityReport, Entity},
};

use super::{
    context_builder::{ContextBuilderResult, GlobalContextBuilder},
    context_table::{csv_separator, dataframe_to_csv, records_to_dataframe, render_rows, ContextRecords},
    conversation_history::{ConversationHistory, ConversationHistoryContextParams},
    dynamic_community_selection::DynamicCommunitySelection,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityContextBuilderParams {
    /// Render report summaries instead of full reports.
    pub use_community_summary: bool,
    pub column_delimiter: String,
    pub shuffle_data: bool,
    pub include_community_rank: bool,
    pub min_community_rank: f64,
    pub community_rank_name: String,
    pub include_community_weight: bool,
    pub community_weight_name: String,
    pub normalize_community_weight: bool,
    pub max_tokens: usize,
    pub single_batch: bool,
    pub context_name: String,
    pub conversation_history_user_turns_only: bool,
    pub conversation_history_max_turns: Option<usize>,
}

impl Default for CommunityContextBuilderParams {
    fn default() -> Self {
        CommunityContextBuilderParams {
            use_community_summary: false,
            column_delimiter: "|".to_string(),
            shuffle_data: true,
            include_community_rank: true,
            min_community_rank: 0.0,
            community_rank_name: "rank".to_string(),
            include_community_weight: true,
            community_weight_name: "occurrence weight".to_string(),
            normalize_community_weight: true,
            max_tokens: 8000,
            single_batch: false,
            context_name: "Reports".to_string(),
            conversation_history_user_turns_only: true,
            conversation_history_max_turns: Some(5),
        }
    }
}

impl CommunityContextBuilderParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(GraphRagError::config("max_tokens for community context must be greater than 0"));
        }
        csv_separator(&self.column_delimiter)?;
        Ok(())
    }
}

pub struct GlobalCommunityContext {
    community_reports: Vec<CommunityReport>,
    entities: Option<Vec<Entity>>,
    num_tokens_fn: fn(&str) -> usize,
    random_state: u64,
    dynamic_community_selection: Option<DynamicCommunitySelection>,
}

impl GlobalCommunityContext {
    pub fn new(
        community_reports: Vec<CommunityReport>,
        entities: Option<Vec<Entity>>,
        num_tokens_fn: fn(&str) -> usize,
    ) -> Self {
        GlobalCommunityContext {
            community_reports,
            entities,
            num_tokens_fn,
            random_state: 86,
            dynamic_community_selection: None,
        }
    }

    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = random_state;
        self
    }

    /// Rate the community tree per query instead of batching every report.
    pub fn with_dynamic_community_selection(mut self, selection: DynamicCommunitySelection) -> Self {
        self.dynamic_community_selection = Some(selection);
        self
    }
}

#[async_trait]
impl GlobalContextBuilder for GlobalCommunityContext {
    async fn build_context(
        &self,
        query: &str,
        conversation_history: Option<&ConversationHistory>,
        context_builder_params: &CommunityContextBuilderParams,
        cancellation_token: &CancellationToken,
    ) -> Result<ContextBuilderResult> {
        context_builder_params.validate()?;

        let mut result = ContextBuilderResult::default();
        let mut conversation_history_context = String::new();

        if let Some(conversation_history) = conversation_history {
            let history_params = ConversationHistoryContextParams {
                include_user_turns_only: context_builder_params.conversation_history_user_turns_only,
                max_qa_turns: context_builder_params.conversation_history_max_turns,
                max_tokens: context_builder_params.max_tokens,
                recency_bias: false,
                column_delimiter: context_builder_params.column_delimiter.clone(),
                ..Default::default()
            };
            let (history_context, history_records) =
                conversation_history.build_context(self.num_tokens_fn, &history_params)?;
            if !history_context.is_empty() {
                conversation_history_context = history_context;
                result.context_records.extend(history_records);
            }
        }

        let selected_reports;
        let community_reports = match &self.dynamic_community_selection {
            Some(selection) => {
                let selection = selection.select(query, cancellation_token).await?;
                result.llm_calls += selection.llm_calls;
                result.prompt_tokens += selection.prompt_tokens;
                result.output_tokens += selection.output_tokens;
                selected_reports = selection.reports;
                &selected_reports
            }
            None => &self.community_reports,
        };

        let (community_context, community_records) = build_community_context(
            community_reports,
            self.entities.as_deref(),
            self.num_tokens_fn,
            context_builder_params,
            self.random_state,
        )?;

        result.context_chunks = if conversation_history_context.is_empty() {
            community_context
        } else {
            community_context
                .into_iter()
                .map(|context| format!("{}\n\n{}", conversation_history_context, context))
                .collect()
        };
        result.context_records.extend(community_records);

        Ok(result)
    }
}

struct ReportRow<'a> {
    report: &'a CommunityReport,
    weight: Option<f64>,
}

struct RenderedRow {
    cells: Vec<String>,
    weight: f64,
    rank: f64,
}

/// Packs community reports into token-bounded batches.
///
/// Each returned batch is a standalone `-----{context_name}-----` table. A report that does not fit
/// an empty batch on its own is still emitted as its own batch.
pub fn build_community_context(
    community_reports: &[CommunityReport],
    entities: Option<&[Entity]>,
    num_tokens_fn: fn(&str) -> usize,
    params: &CommunityContextBuilderParams,
    random_state: u64,
) -> Result<(Vec<String>, ContextRecords)> {
    let Some(first_report) = community_reports.first() else {
        return Ok((Vec::new(), ContextRecords::new()));
    };

    let weight_name = params.community_weight_name.as_str();
    let compute_community_weights = entities.is_some()
        && params.include_community_weight
        && !first_report.attributes.contains_key(weight_name);

    let computed_weights = match entities {
        Some(entities) if compute_community_weights => {
            info!("Computing community weights...");
            Some(compute_community_weights_by_text_units(
                community_reports,
                entities,
                params.normalize_community_weight,
            ))
        }
        _ => None,
    };

    let weight_attribute_present = first_report.attributes.contains_key(weight_name);
    let use_weight_column = params.include_community_weight && (computed_weights.is_some() || weight_attribute_present);

    let mut selected_reports: Vec<ReportRow> = community_reports
        .iter()
        .filter(|report| report.rank.is_some_and(|rank| rank >= params.min_community_rank))
        .map(|report| {
            let weight = match &computed_weights {
                Some(weights) => weights.get(&report.community_id).copied(),
                None => report
                    .attributes
                    .get(weight_name)
                    .and_then(|weight| weight.parse::<f64>().ok()),
            };
            ReportRow { report, weight }
        })
        .collect();

    if selected_reports.is_empty() {
        warn!("No community reports meet the minimum community rank");
        return Ok((Vec::new(), ContextRecords::new()));
    }

    if params.shuffle_data {
        let mut rng = StdRng::seed_from_u64(random_state);
        selected_reports.shuffle(&mut rng);
    }

    let content_column = if params.use_community_summary { "summary" } else { "content" };
    let reserved_columns = ["id", "title", weight_name, content_column, params.community_rank_name.as_str()];
    let attributes: Vec<String> = first_report
        .attributes
        .keys()
        .filter(|key| !reserved_columns.contains(&key.as_str()))
        .cloned()
        .collect();

    let mut header = vec!["id".to_string(), "title".to_string()];
    header.extend(attributes.iter().cloned());
    if use_weight_column {
        header.push(weight_name.to_string());
    }
    header.push(content_column.to_string());
    if params.include_community_rank {
        header.push(params.community_rank_name.clone());
    }

    let batch_header = format!(
        "-----{}-----\n{}",
        params.context_name,
        render_rows(&header, &[], &params.column_delimiter, true)?
    );
    let header_tokens = num_tokens_fn(&batch_header);

    let mut all_context_text: Vec<String> = Vec::new();
    let mut all_context_rows: Vec<Vec<String>> = Vec::new();

    let mut batch_tokens = header_tokens;
    let mut batch_rows: Vec<RenderedRow> = Vec::new();
    let mut stopped_early = false;

    let mut cut_batch = |batch_rows: &mut Vec<RenderedRow>| -> Result<()> {
        if batch_rows.is_empty() {
            return Ok(());
        }
        let mut rows = std::mem::take(batch_rows);
        rank_report_rows(&mut rows, use_weight_column, params.include_community_rank);

        let cells: Vec<Vec<String>> = rows.into_iter().map(|row| row.cells).collect();
        let mut record_df = records_to_dataframe(&header, &cells)?;
        all_context_text.push(format!(
            "-----{}-----\n{}",
            params.context_name,
            dataframe_to_csv(&mut record_df, &params.column_delimiter, true)?
        ));
        all_context_rows.extend(cells);
        Ok(())
    };

    for row in &selected_reports {
        let rendered = render_report_row(row, &attributes, use_weight_column, params);
        let new_context_text = render_rows(
            &header,
            std::slice::from_ref(&rendered.cells),
            &params.column_delimiter,
            false,
        )?;
        let new_tokens = num_tokens_fn(&new_context_text);

        if batch_tokens + new_tokens > params.max_tokens {
            cut_batch(&mut batch_rows)?;
            if params.single_batch {
                stopped_early = true;
                break;
            }
            batch_tokens = header_tokens;
        }

        batch_tokens += new_tokens;
        batch_rows.push(rendered);
    }

    if !stopped_early {
        cut_batch(&mut batch_rows)?;
    }

    if all_context_text.is_empty() {
        warn!("No community records added when building community context.");
        return Ok((Vec::new(), ContextRecords::new()));
    }

    let all_context_records = records_to_dataframe(&header, &all_context_rows)?;
    Ok((
        all_context_text,
        ContextRecords::from([(params.context_name.to_lowercase(), all_context_records)]),
    ))
}

fn render_report_row(
    row: &ReportRow,
    attributes: &[String],
    use_weight_column: bool,
    params: &CommunityContextBuilderParams,
) -> RenderedRow {
    let report = row.report;
    let mut cells = vec![report.short_id.clone().unwrap_or_default(), report.title.clone()];

    for field in attributes {
        cells.push(report.attributes.get(field).cloned().unwrap_or_default());
    }

    if use_weight_column {
        cells.push(row.weight.map(|weight| weight.to_string()).unwrap_or_default());
    }

    cells.push(if params.use_community_summary {
        report.summary.clone()
    } else {
        report.full_content.clone()
    });

    let rank = report.rank.unwrap_or_default();
    if params.include_community_rank {
        cells.push(rank.to_string());
    }

    RenderedRow {
        cells,
        weight: row.weight.unwrap_or_default(),
        rank,
    }
}

/// Sorts a batch by weight, then rank, both descending. Stable for equal keys.
fn rank_report_rows(rows: &mut [RenderedRow], by_weight: bool, by_rank: bool) {
    if !by_weight && !by_rank {
        return;
    }
    rows.sort_by(|a, b| {
        let weight_order = if by_weight {
            b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal)
        } else {
            Ordering::Equal
        };
        let rank_order = if by_rank {
            b.rank.partial_cmp(&a.rank).unwrap_or(Ordering::Equal)
        } else {
            Ordering::Equal
        };
        weight_order.then(rank_order)
    });
}

/// A community's weight is the number of distinct text units mentioning its entities.
pub fn compute_community_weights_by_text_units(
    community_reports: &[CommunityReport],
    entities: &[Entity],
    normalize: bool,
) -> HashMap<String, f64> {
    let mut community_text_units: HashMap<&str, HashSet<&str>> = HashMap::new();
    for entity in entities {
        let Some(community_ids) = &entity.community_ids else {
            continue;
        };
        for community_id in community_ids {
            let text_units = community_text_units.entry(community_id.as_str()).or_default();
            if let Some(text_unit_ids) = &entity.text_unit_ids {
                text_units.extend(text_unit_ids.iter().map(|id| id.as_str()));
            }
        }
    }

    let mut weights: HashMap<String, f64> = community_reports
        .iter()
        .map(|report| {
            let weight = community_text_units
                .get(report.community_id.as_str())
                .map(|text_units| text_units.len())
                .unwrap_or(0);
            (report.community_id.clone(), weight as f64)
        })
        .collect();

    if normalize {
        let max_weight = weights.values().cloned().fold(0.0, f64::max);
        if max_weight > 0.0 {
            for weight in weights.values_mut() {
                *weight /= max_weight;
            }
        }
    }

    weights
}
