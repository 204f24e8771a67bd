use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
};

use polars::frame::DataFrame;

use crate::{
    error::Result,
    models::{Covariate, Entity, Relationship},
    retrieval::{
        covariates::{covariate_columns, covariate_row, get_candidate_covariates, to_covariate_table},
        entities::{entity_columns, entity_row, to_entity_table},
        relationships::{
            get_candidate_relationships, get_entities_from_relationships, get_in_network_relationships,
            get_out_network_relationships, relationship_columns, relationship_row, to_relationship_table,
            RelationshipRanker,
        },
    },
};

use super::context_table::{dataframe_to_csv, records_to_dataframe, render_rows, ContextRecords};

/// Renders rows greedily under `max_tokens`. The header always counts against the budget.
fn render_table(
    context_name: &str,
    header: Vec<String>,
    rows: impl Iterator<Item = Vec<String>>,
    num_tokens_fn: fn(&str) -> usize,
    max_tokens: usize,
    column_delimiter: &str,
) -> Result<(String, DataFrame)> {
    let section_header = format!("-----{}-----\n", context_name);
    let header_text = render_rows(&header, &[], column_delimiter, true)?;
    let mut current_tokens = num_tokens_fn(&format!("{}{}", section_header, header_text));
    let mut kept_rows: Vec<Vec<String>> = Vec::new();

    for row in rows {
        let new_tokens = num_tokens_fn(&render_rows(&header, std::slice::from_ref(&row), column_delimiter, false)?);
        if current_tokens + new_tokens > max_tokens {
            break;
        }
        kept_rows.push(row);
        current_tokens += new_tokens;
    }

    let mut record_df = records_to_dataframe(&header, &kept_rows)?;
    let context_text = format!("{}{}", section_header, dataframe_to_csv(&mut record_df, column_delimiter, true)?);
    Ok((context_text, record_df))
}

pub fn build_entity_context(
    selected_entities: &[Entity],
    num_tokens_fn: fn(&str) -> usize,
    max_tokens: usize,
    include_entity_rank: bool,
    rank_description: &str,
    column_delimiter: &str,
    context_name: &str,
) -> Result<(String, DataFrame)> {
    if selected_entities.is_empty() {
        return Ok((String::new(), DataFrame::default()));
    }

    let (header, attribute_cols) = entity_columns(selected_entities, include_entity_rank, rank_description);
    let rows = selected_entities
        .iter()
        .map(|entity| entity_row(entity, include_entity_rank, &attribute_cols));

    render_table(context_name, header, rows, num_tokens_fn, max_tokens, column_delimiter)
}

#[allow(clippy::too_many_arguments)]
pub fn build_relationship_context(
    selected_entities: &[Entity],
    relationships: &[Relationship],
    num_tokens_fn: fn(&str) -> usize,
    include_relationship_weight: bool,
    max_tokens: usize,
    top_k_relationships: usize,
    relationship_ranking_attribute: &str,
    column_delimiter: &str,
    context_name: &str,
) -> Result<(String, DataFrame)> {
    let selected_relationships = filter_relationships(
        selected_entities,
        relationships,
        top_k_relationships,
        relationship_ranking_attribute,
    );

    if selected_entities.is_empty() || selected_relationships.is_empty() {
        return Ok((String::new(), DataFrame::default()));
    }

    let (header, attribute_cols) = relationship_columns(&selected_relationships, include_relationship_weight);
    let rows = selected_relationships
        .iter()
        .map(|relationship| relationship_row(relationship, include_relationship_weight, &attribute_cols));

    render_table(context_name, header, rows, num_tokens_fn, max_tokens, column_delimiter)
}

pub fn build_covariates_context(
    selected_entities: &[Entity],
    covariates: &[Covariate],
    num_tokens_fn: fn(&str) -> usize,
    max_tokens: usize,
    column_delimiter: &str,
    context_name: &str,
) -> Result<(String, DataFrame)> {
    let selected_covariates: Vec<&Covariate> = selected_entities
        .iter()
        .flat_map(|entity| covariates.iter().filter(move |covariate| covariate.subject_id == entity.title))
        .collect();

    if selected_covariates.is_empty() {
        return Ok((String::new(), DataFrame::default()));
    }

    let (header, attribute_cols) = covariate_columns(covariates);
    let rows = selected_covariates
        .into_iter()
        .map(|covariate| covariate_row(covariate, &attribute_cols));

    render_table(context_name, header, rows, num_tokens_fn, max_tokens, column_delimiter)
}

/// Picks the relationships of the selected entities.
///
/// In-network relationships come first. Out-network relationships follow, ordered by how many selected
/// entities share the same outside endpoint, then by rank, capped at `top_k_relationships` per selected entity.
pub fn filter_relationships(
    selected_entities: &[Entity],
    relationships: &[Relationship],
    top_k_relationships: usize,
    relationship_ranking_attribute: &str,
) -> Vec<Relationship> {
    let mut in_network_relationships =
        get_in_network_relationships(selected_entities, relationships, relationship_ranking_attribute);
    let out_network_relationships =
        get_out_network_relationships(selected_entities, relationships, relationship_ranking_attribute);

    if out_network_relationships.len() <= 1 {
        in_network_relationships.extend(out_network_relationships);
        return in_network_relationships;
    }

    let selected_entity_names: HashSet<&str> = selected_entities.iter().map(|entity| entity.title.as_str()).collect();

    // outside entity -> selected entities it is linked to
    let mut out_network_entity_links: HashMap<&str, HashSet<&str>> = HashMap::new();
    for relationship in &out_network_relationships {
        let (outside, inside) = if selected_entity_names.contains(relationship.source.as_str()) {
            (relationship.target.as_str(), relationship.source.as_str())
        } else {
            (relationship.source.as_str(), relationship.target.as_str())
        };
        out_network_entity_links.entry(outside).or_default().insert(inside);
    }

    let links = |relationship: &Relationship| -> usize {
        out_network_entity_links
            .get(relationship.source.as_str())
            .or_else(|| out_network_entity_links.get(relationship.target.as_str()))
            .map(|linked| linked.len())
            .unwrap_or(0)
    };

    let ranker = RelationshipRanker::new(&out_network_relationships, selected_entities, relationship_ranking_attribute);
    let sort_keys: Vec<(usize, f64)> = out_network_relationships
        .iter()
        .map(|relationship| (links(relationship), ranker.rank(relationship)))
        .collect();
    let mut ranked: Vec<(usize, f64, Relationship)> = sort_keys
        .into_iter()
        .zip(out_network_relationships)
        .map(|((links, rank), relationship)| (links, rank, relationship))
        .collect();
    ranked.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });

    let relationship_budget = top_k_relationships * selected_entities.len();
    in_network_relationships.extend(
        ranked
            .into_iter()
            .take(relationship_budget)
            .map(|(_, _, relationship)| relationship),
    );
    in_network_relationships
}

/// Full candidate tables for the selected entities, regardless of what fit in the context.
#[allow(clippy::too_many_arguments)]
pub fn get_candidate_context(
    selected_entities: &[Entity],
    entities: &[Entity],
    relationships: &[Relationship],
    covariates: &BTreeMap<String, Vec<Covariate>>,
    include_entity_rank: bool,
    entity_rank_description: &str,
    include_relationship_weight: bool,
) -> Result<ContextRecords> {
    let mut candidate_context = ContextRecords::new();

    let candidate_relationships = get_candidate_relationships(selected_entities, relationships);
    candidate_context.insert(
        "relationships".to_string(),
        to_relationship_table(&candidate_relationships, include_relationship_weight)?,
    );

    let candidate_entities = get_entities_from_relationships(&candidate_relationships, entities);
    candidate_context.insert(
        "entities".to_string(),
        to_entity_table(&candidate_entities, include_entity_rank, entity_rank_description)?,
    );

    for (covariate_type, covariate_list) in covariates {
        let candidate_covariates = get_candidate_covariates(selected_entities, covariate_list);
        candidate_context.insert(covariate_type.to_lowercase(), to_covariate_table(&candidate_covariates)?);
    }

    Ok(candidate_context)
}
