use std::collections::HashSet;

use polars::frame::DataFrame;

use crate::{
    context_builder::context_table::records_to_dataframe,
    error::Result,
    models::{CommunityReport, Entity},
};

/// Reports of every community the selected entities belong to.
pub fn get_candidate_communities(
    selected_entities: &[Entity],
    community_reports: &[CommunityReport],
    include_community_rank: bool,
    use_community_summary: bool,
) -> Result<DataFrame> {
    let selected_community_ids: HashSet<&str> = selected_entities
        .iter()
        .filter_map(|entity| entity.community_ids.as_ref())
        .flatten()
        .map(|id| id.as_str())
        .collect();

    let selected_reports: Vec<CommunityReport> = community_reports
        .iter()
        .filter(|report| selected_community_ids.contains(report.community_id.as_str()))
        .cloned()
        .collect();

    to_community_report_table(&selected_reports, include_community_rank, use_community_summary)
}

pub fn to_community_report_table(
    reports: &[CommunityReport],
    include_community_rank: bool,
    use_community_summary: bool,
) -> Result<DataFrame> {
    let Some(first_report) = reports.first() else {
        return Ok(DataFrame::default());
    };

    let content_column = if use_community_summary { "summary" } else { "content" };
    let mut header = vec!["id".to_string(), "title".to_string()];
    let attribute_cols: Vec<String> = first_report
        .attributes
        .keys()
        .filter(|key| !header.contains(*key) && key.as_str() != content_column && key.as_str() != "rank")
        .cloned()
        .collect();
    header.extend(attribute_cols.iter().cloned());
    header.push(content_column.to_string());
    if include_community_rank {
        header.push("rank".to_string());
    }

    let rows: Vec<Vec<String>> = reports
        .iter()
        .map(|report| {
            let mut row = vec![report.short_id.clone().unwrap_or_default(), report.title.clone()];
            for field in &attribute_cols {
                row.push(report.attributes.get(field).cloned().unwrap_or_default());
            }
            row.push(if use_community_summary {
                report.summary.clone()
            } else {
                report.full_content.clone()
            });
            if include_community_rank {
                row.push(report.rank.map(|rank| rank.to_string()).unwrap_or_default());
            }
            row
        })
        .collect();

    records_to_dataframe(&header, &rows)
}
