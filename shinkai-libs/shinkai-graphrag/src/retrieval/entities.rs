use uuid::Uuid;

use polars::frame::DataFrame;

use crate::{context_builder::context_table::records_to_dataframe, error::Result, models::Entity};

/// Looks up an entity by one of its fields. Ids given as dashed UUIDs also match their simple form.
pub fn get_entity_by_key<'a>(entities: &'a [Entity], key: &str, value: &str) -> Option<&'a Entity> {
    let simple_uuid = if is_valid_uuid(value) {
        Some(value.replace('-', ""))
    } else {
        None
    };
    let matches_id = |candidate: &str| candidate == value || simple_uuid.as_deref() == Some(candidate);

    entities.iter().find(|entity| match key {
        "id" => matches_id(&entity.id),
        "short_id" => entity.short_id.as_deref().is_some_and(|id| matches_id(id)),
        "title" => entity.title == value,
        "entity_type" => entity.entity_type.as_deref() == Some(value),
        "description" => entity.description.as_deref() == Some(value),
        _ => false,
    })
}

pub fn get_entity_by_name<'a>(entities: &'a [Entity], entity_name: &str) -> Vec<&'a Entity> {
    entities.iter().filter(|entity| entity.title == entity_name).collect()
}

pub fn is_valid_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// Header and attribute columns of an entity table. Attribute columns come from the first entity.
pub(crate) fn entity_columns(
    entities: &[Entity],
    include_entity_rank: bool,
    rank_description: &str,
) -> (Vec<String>, Vec<String>) {
    let mut header = vec!["id".to_string(), "entity".to_string(), "description".to_string()];
    if include_entity_rank {
        header.push(rank_description.to_string());
    }

    let attribute_cols: Vec<String> = entities
        .first()
        .map(|entity| {
            entity
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

pub(crate) fn entity_row(entity: &Entity, include_entity_rank: bool, attribute_cols: &[String]) -> Vec<String> {
    let mut row = vec![
        entity.short_id.clone().unwrap_or_default(),
        entity.title.clone(),
        entity.description.clone().unwrap_or_default(),
    ];

    if include_entity_rank {
        row.push(entity.rank.map(|rank| rank.to_string()).unwrap_or_default());
    }

    for field in attribute_cols {
        row.push(entity.attributes.get(field).cloned().unwrap_or_default());
    }

    row
}

pub fn to_entity_table(entities: &[Entity], include_entity_rank: bool, rank_description: &str) -> Result<DataFrame> {
    if entities.is_empty() {
        return Ok(DataFrame::default());
    }

    let (header, attribute_cols) = entity_columns(entities, include_entity_rank, rank_description);
    let rows: Vec<Vec<String>> = entities
        .iter()
        .map(|entity| entity_row(entity, include_entity_rank, &attribute_cols))
        .collect();

    records_to_dataframe(&header, &rows)
}
