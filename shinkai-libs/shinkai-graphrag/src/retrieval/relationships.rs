use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use polars::frame::DataFrame;

use crate::{
    context_builder::context_table::records_to_dataframe,
    error::Result,
    models::{Entity, Relationship},
};

enum RankingSource<'a> {
    Attribute(&'a str),
    Weight,
    /// Sum of the source and target entity ranks.
    CombinedRank(HashMap<&'a str, i32>),
}

/// Ranks relationships by `ranking_attribute`.
///
/// The attribute map of the first relationship decides where the rank comes from: the attribute itself when
/// present, the relationship weight for `"weight"`, otherwise the combined rank of both endpoints. Ranks are
/// computed on the fly, relationships are never annotated.
pub struct RelationshipRanker<'a> {
    source: RankingSource<'a>,
}

impl<'a> RelationshipRanker<'a> {
    pub fn new(relationships: &[Relationship], entities: &'a [Entity], ranking_attribute: &'a str) -> Self {
        let has_attribute = relationships
            .first()
            .is_some_and(|relationship| relationship.attributes.contains_key(ranking_attribute));

        let source = if has_attribute {
            RankingSource::Attribute(ranking_attribute)
        } else if ranking_attribute == "weight" {
            RankingSource::Weight
        } else {
            RankingSource::CombinedRank(
                entities
                    .iter()
                    .map(|entity| (entity.title.as_str(), entity.rank.unwrap_or(0)))
                    .collect(),
            )
        };

        RelationshipRanker { source }
    }

    pub fn rank(&self, relationship: &Relationship) -> f64 {
        match &self.source {
            RankingSource::Attribute(attribute) => relationship
                .attributes
                .get(*attribute)
                .and_then(|rank| rank.parse::<f64>().ok())
                .unwrap_or(0.0),
            RankingSource::Weight => relationship.weight,
            RankingSource::CombinedRank(entity_ranks) => {
                calculate_relationship_combined_rank(relationship, entity_ranks) as f64
            }
        }
    }
}

pub fn calculate_relationship_combined_rank(relationship: &Relationship, entity_ranks: &HashMap<&str, i32>) -> i32 {
    let source_rank = entity_ranks.get(relationship.source.as_str()).copied().unwrap_or(0);
    let target_rank = entity_ranks.get(relationship.target.as_str()).copied().unwrap_or(0);
    source_rank + target_rank
}

/// Sorts by descending rank, keeping input order for equal ranks.
pub fn sort_relationships_by_ranking_attribute(
    mut relationships: Vec<Relationship>,
    entities: &[Entity],
    ranking_attribute: &str,
) -> Vec<Relationship> {
    if relationships.len() <= 1 {
        return relationships;
    }

    let ranker = RelationshipRanker::new(&relationships, entities, ranking_attribute);
    relationships.sort_by(|a, b| ranker.rank(b).partial_cmp(&ranker.rank(a)).unwrap_or(Ordering::Equal));
    relationships
}

fn entity_names(entities: &[Entity]) -> HashSet<&str> {
    entities.iter().map(|entity| entity.title.as_str()).collect()
}

/// Relationships whose both endpoints are selected.
pub fn get_in_network_relationships(
    selected_entities: &[Entity],
    relationships: &[Relationship],
    ranking_attribute: &str,
) -> Vec<Relationship> {
    let selected_entity_names = entity_names(selected_entities);

    let selected_relationships: Vec<Relationship> = relationships
        .iter()
        .filter(|relationship| {
            selected_entity_names.contains(relationship.source.as_str())
                && selected_entity_names.contains(relationship.target.as_str())
        })
        .cloned()
        .collect();

    sort_relationships_by_ranking_attribute(selected_relationships, selected_entities, ranking_attribute)
}

/// Relationships with exactly one selected endpoint.
pub fn get_out_network_relationships(
    selected_entities: &[Entity],
    relationships: &[Relationship],
    ranking_attribute: &str,
) -> Vec<Relationship> {
    let selected_entity_names = entity_names(selected_entities);

    let source_relationships = relationships.iter().filter(|relationship| {
        selected_entity_names.contains(relationship.source.as_str())
            && !selected_entity_names.contains(relationship.target.as_str())
    });
    let target_relationships = relationships.iter().filter(|relationship| {
        selected_entity_names.contains(relationship.target.as_str())
            && !selected_entity_names.contains(relationship.source.as_str())
    });

    let selected_relationships: Vec<Relationship> = source_relationships.chain(target_relationships).cloned().collect();

    sort_relationships_by_ranking_attribute(selected_relationships, selected_entities, ranking_attribute)
}

pub fn get_candidate_relationships(selected_entities: &[Entity], relationships: &[Relationship]) -> Vec<Relationship> {
    let selected_entity_names = entity_names(selected_entities);

    relationships
        .iter()
        .filter(|relationship| {
            selected_entity_names.contains(relationship.source.as_str())
                || selected_entity_names.contains(relationship.target.as_str())
        })
        .cloned()
        .collect()
}

pub fn get_entities_from_relationships(relationships: &[Relationship], entities: &[Entity]) -> Vec<Entity> {
    let names: HashSet<&str> = relationships
        .iter()
        .flat_map(|relationship| [relationship.source.as_str(), relationship.target.as_str()])
        .collect();

    entities
        .iter()
        .filter(|entity| names.contains(entity.title.as_str()))
        .cloned()
        .collect()
}

pub(crate) fn relationship_columns(
    relationships: &[Relationship],
    include_relationship_weight: bool,
) -> (Vec<String>, Vec<String>) {
    let mut header = vec![
        "id".to_string(),
        "source".to_string(),
        "target".to_string(),
        "description".to_string(),
    ];
    if include_relationship_weight {
        header.push("weight".to_string());
    }

    let attribute_cols: Vec<String> = relationships
        .first()
        .map(|relationship| {
            relationship
                .attributes
                .keys()
                .filter(|key| !header.contains(*key))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    header.extend(attribute_cols.iter().cloned());
    (header, attribute_cols)
}

pub(crate) fn relationship_row(
    relationship: &Relationship,
    include_relationship_weight: bool,
    attribute_cols: &[String],
) -> Vec<String> {
    let mut row = vec![
        relationship.short_id.clone().unwrap_or_default(),
        relationship.source.clone(),
        relationship.target.clone(),
        relationship.description.clone().unwrap_or_default(),
    ];

    if include_relationship_weight {
        row.push(relationship.weight.to_string());
    }

    for field in attribute_cols {
        row.push(relationship.attributes.get(field).cloned().unwrap_or_default());
    }

    row
}

pub fn to_relationship_table(relationships: &[Relationship], include_relationship_weight: bool) -> Result<DataFrame> {
    if relationships.is_empty() {
        return Ok(DataFrame::default());
    }

    let (header, attribute_cols) = relationship_columns(relationships, include_relationship_weight);
    let rows: Vec<Vec<String>> = relationships
        .iter()
        .map(|relationship| relationship_row(relationship, include_relationship_weight, &attribute_cols))
        .collect();

    records_to_dataframe(&header, &rows)
}
