use std::collections::HashSet;

use polars::frame::DataFrame;

use crate::{
    context_builder::context_table::records_to_dataframe,
    error::Result,
    models::{Entity, TextUnit},
};

pub fn get_candidate_text_units(selected_entities: &[Entity], text_units: &[TextUnit]) -> Result<DataFrame> {
    let selected_text_ids: HashSet<&str> = selected_entities
        .iter()
        .filter_map(|entity| entity.text_unit_ids.as_ref())
        .flatten()
        .map(|id| id.as_str())
        .collect();

    let selected_text_units: Vec<TextUnit> = text_units
        .iter()
        .filter(|unit| selected_text_ids.contains(unit.id.as_str()))
        .cloned()
        .collect();

    to_text_unit_table(&selected_text_units)
}

pub(crate) fn text_unit_columns(text_units: &[TextUnit]) -> (Vec<String>, Vec<String>) {
    let mut header = vec!["id".to_string(), "text".to_string()];

    let attribute_cols: Vec<String> = text_units
        .first()
        .map(|unit| {
            unit.attributes
                .keys()
                .filter(|key| !header.contains(*key))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    header.extend(attribute_cols.iter().cloned());
    (header, attribute_cols)
}

pub(crate) fn text_unit_row(unit: &TextUnit, attribute_cols: &[String]) -> Vec<String> {
    let mut row = vec![unit.short_id.clone().unwrap_or_default(), unit.text.clone()];
    for field in attribute_cols {
        row.push(unit.attributes.get(field).cloned().unwrap_or_default());
    }
    row
}

pub fn to_text_unit_table(text_units: &[TextUnit]) -> Result<DataFrame> {
    if text_units.is_empty() {
        return Ok(DataFrame::default());
    }

    let (header, attribute_cols) = text_unit_columns(text_units);
    let rows: Vec<Vec<String>> = text_units
        .iter()
        .map(|unit| text_unit_row(unit, &attribute_cols))
        .collect();

    records_to_dataframe(&header, &rows)
}
