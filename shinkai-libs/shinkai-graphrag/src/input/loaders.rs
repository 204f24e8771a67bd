use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{
    error::{GraphRagError, Result},
    models::{Community, CommunityReport, Covariate, Entity, Relationship, TextUnit},
    vector_stores::vector_store::{VectorStore, VectorStoreDocument},
};

pub const ENTITIES_FILE: &str = "entities.json";
pub const RELATIONSHIPS_FILE: &str = "relationships.json";
pub const COMMUNITIES_FILE: &str = "communities.json";
pub const COMMUNITY_REPORTS_FILE: &str = "community_reports.json";
pub const TEXT_UNITS_FILE: &str = "text_units.json";
pub const COVARIATES_FILE: &str = "covariates.json";

/// Tables written by the indexing pipeline.
#[derive(Debug, Clone, Default)]
pub struct IndexerOutput {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub communities: Vec<Community>,
    pub community_reports: Vec<CommunityReport>,
    pub text_units: Vec<TextUnit>,
    pub covariates: Vec<Covariate>,
}

impl IndexerOutput {
    /// Covariates grouped into context tables by type, e.g. `claim` records under `Claims`.
    pub fn covariates_by_type(&self) -> BTreeMap<String, Vec<Covariate>> {
        let mut grouped: BTreeMap<String, Vec<Covariate>> = BTreeMap::new();
        for covariate in &self.covariates {
            grouped
                .entry(covariate_table_name(&covariate.covariate_type))
                .or_default()
                .push(covariate.clone());
        }
        grouped
    }
}

fn covariate_table_name(covariate_type: &str) -> String {
    let mut chars = covariate_type.chars();
    let mut name: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return "Covariates".to_string(),
    };
    if !name.ends_with('s') {
        name.push('s');
    }
    name
}

/// Reads a JSON array of records.
pub fn read_json_records<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| GraphRagError::InvalidData(format!("Failed to parse {}: {}", path.display(), e)))
}

fn read_optional_records<T: DeserializeOwned>(path: PathBuf) -> Result<Vec<T>> {
    if !path.exists() {
        debug!("{} not found, using an empty table", path.display());
        return Ok(Vec::new());
    }
    read_json_records(path)
}

/// Loads the indexer tables from `input_dir`. Only the entities table is required.
pub fn read_indexer_output(input_dir: impl AsRef<Path>) -> Result<IndexerOutput> {
    let input_dir = input_dir.as_ref();

    let output = IndexerOutput {
        entities: read_json_records(input_dir.join(ENTITIES_FILE))?,
        relationships: read_optional_records(input_dir.join(RELATIONSHIPS_FILE))?,
        communities: read_optional_records(input_dir.join(COMMUNITIES_FILE))?,
        community_reports: read_optional_records(input_dir.join(COMMUNITY_REPORTS_FILE))?,
        text_units: read_optional_records(input_dir.join(TEXT_UNITS_FILE))?,
        covariates: read_optional_records(input_dir.join(COVARIATES_FILE))?,
    };

    info!(
        "Loaded {} entities, {} relationships, {} communities, {} reports, {} text units, {} covariates",
        output.entities.len(),
        output.relationships.len(),
        output.communities.len(),
        output.community_reports.len(),
        output.text_units.len(),
        output.covariates.len()
    );

    Ok(output)
}

/// Keeps reports whose level is at most `community_level`. Reports without a level are kept.
pub fn filter_under_community_level(
    community_reports: Vec<CommunityReport>,
    community_level: usize,
) -> Vec<CommunityReport> {
    community_reports
        .into_iter()
        .filter(|report| match report.level.as_deref().map(str::parse::<usize>) {
            Some(Ok(level)) => level <= community_level,
            _ => true,
        })
        .collect()
}

/// Loads entity description embeddings into `vectorstore`, keyed by entity id.
pub async fn store_entity_semantic_embeddings(entities: &[Entity], vectorstore: &mut dyn VectorStore) -> Result<()> {
    let documents: Vec<VectorStoreDocument> = entities
        .iter()
        .map(|entity| {
            let mut attributes = entity.attributes.clone();
            attributes.insert("title".to_string(), entity.title.clone());

            VectorStoreDocument {
                id: entity.id.clone(),
                text: entity.description.clone(),
                vector: entity.description_embedding.clone(),
                attributes,
            }
        })
        .collect();

    vectorstore.load_documents(documents, true).await
}
