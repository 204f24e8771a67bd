use std::collections::HashSet;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    error::Result,
    models::{Relationship, TextUnit},
    retrieval::text_units::{text_unit_columns, text_unit_row},
};

use super::context_table::{dataframe_to_csv, records_to_dataframe, render_rows, ContextRecords};

/// Renders text units as a `-----{context_name}-----` table until `max_tokens` is reached.
pub fn build_text_unit_context(
    text_units: &[TextUnit],
    num_tokens_fn: fn(&str) -> usize,
    column_delimiter: &str,
    shuffle_data: bool,
    max_tokens: usize,
    context_name: &str,
    random_state: u64,
) -> Result<(String, ContextRecords)> {
    if text_units.is_empty() {
        return Ok((String::new(), ContextRecords::new()));
    }

    let mut unique_ids = HashSet::new();
    let mut text_units: Vec<&TextUnit> = text_units.iter().filter(|unit| unique_ids.insert(unit.id.as_str())).collect();

    if shuffle_data {
        let mut rng = StdRng::seed_from_u64(random_state);
        text_units.shuffle(&mut rng);
    }

    let first_unit = std::slice::from_ref(text_units[0]);
    let (header, attribute_cols) = text_unit_columns(first_unit);

    let section_header = format!("-----{}-----\n", context_name);
    let header_text = render_rows(&header, &[], column_delimiter, true)?;
    let mut current_tokens = num_tokens_fn(&format!("{}{}", section_header, header_text));
    let mut kept_rows: Vec<Vec<String>> = Vec::new();

    for unit in text_units {
        let row = text_unit_row(unit, &attribute_cols);
        let new_tokens = num_tokens_fn(&render_rows(&header, std::slice::from_ref(&row), column_delimiter, false)?);

        if current_tokens + new_tokens > max_tokens {
            break;
        }

        kept_rows.push(row);
        current_tokens += new_tokens;
    }

    if kept_rows.is_empty() {
        return Ok((String::new(), ContextRecords::new()));
    }

    let mut record_df = records_to_dataframe(&header, &kept_rows)?;
    let context_text = format!("{}{}", section_header, dataframe_to_csv(&mut record_df, column_delimiter, true)?);
    Ok((context_text, ContextRecords::from([(context_name.to_lowercase(), record_df)])))
}

/// Number of `entity_relationships` tied to `text_unit`.
///
/// Uses the unit's own relationship ids when it has them, otherwise the text unit ids recorded on each
/// relationship.
pub fn count_relationships(entity_relationships: &[&Relationship], text_unit: &TextUnit) -> usize {
    match &text_unit.relationship_ids {
        Some(relationship_ids) if !relationship_ids.is_empty() => {
            let entity_relationship_ids: HashSet<&str> =
                entity_relationships.iter().map(|relationship| relationship.id.as_str()).collect();
            relationship_ids
                .iter()
                .filter(|id| entity_relationship_ids.contains(id.as_str()))
                .count()
        }
        _ => entity_relationships
            .iter()
            .filter(|relationship| {
                relationship
                    .text_unit_ids
                    .as_ref()
                    .is_some_and(|ids| ids.contains(&text_unit.id))
            })
            .count(),
    }
}
