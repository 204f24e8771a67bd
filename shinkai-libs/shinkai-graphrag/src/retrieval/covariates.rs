use std::collections::HashSet;

use polars::frame::DataFrame;

use crate::{
    context_builder::context_table::records_to_dataframe,
    error::Result,
    models::{Covariate, Entity},
};

/// Covariates whose subject is one of the selected entities.
pub fn get_candidate_covariates(selected_entities: &[Entity], covariates: &[Covariate]) -> Vec<Covariate> {
    let selected_entity_names: HashSet<&str> = selected_entities.iter().map(|entity| entity.title.as_str()).collect();

    covariates
        .iter()
        .filter(|covariate| selected_entity_names.contains(covariate.subject_id.as_str()))
        .cloned()
        .collect()
}

pub(crate) fn covariate_columns(covariates: &[Covariate]) -> (Vec<String>, Vec<String>) {
    let mut header = vec!["id".to_string(), "entity".to_string()];

    let attribute_cols: Vec<String> = covariates
        .first()
        .map(|covariate| {
            covariate
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

pub(crate) fn covariate_row(covariate: &Covariate, attribute_cols: &[String]) -> Vec<String> {
    let mut row = vec![covariate.short_id.clone().unwrap_or_default(), covariate.subject_id.clone()];
    for field in attribute_cols {
        row.push(covariate.attributes.get(field).cloned().unwrap_or_default());
    }
    row
}

pub fn to_covariate_table(covariates: &[Covariate]) -> Result<DataFrame> {
    if covariates.is_empty() {
        return Ok(DataFrame::default());
    }

    let (header, attribute_cols) = covariate_columns(covariates);
    let rows: Vec<Vec<String>> = covariates
        .iter()
        .map(|covariate| covariate_row(covariate, &attribute_cols))
        .collect();

    records_to_dataframe(&header, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_builder::context_table::column_values;

    #[test]
    fn covariates_follow_their_subject() {
        let entities = vec![Entity {
            id: "1".to_string(),
            title: "ALICE".to_string(),
            ..Default::default()
        }];
        let mut claim = Covariate {
            id: "c1".to_string(),
            short_id: Some("0".to_string()),
            subject_id: "ALICE".to_string(),
            ..Default::default()
        };
        claim.attributes.insert("status".to_string(), "TRUE".to_string());
        let other = Covariate {
            id: "c2".to_string(),
            subject_id: "BOB".to_string(),
            ..Default::default()
        };

        let candidates = get_candidate_covariates(&entities, &[claim, other]);
        assert_eq!(candidates.len(), 1);

        let table = to_covariate_table(&candidates).unwrap();
        assert_eq!(table.get_column_names(), vec!["id", "entity", "status"]);
        assert_eq!(column_values(&table, "status").unwrap(), vec!["TRUE"]);
    }
}
