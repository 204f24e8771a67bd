use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    llm::base::BaseTextEmbedding,
    models::Entity,
    retrieval::entities::{get_entity_by_key, get_entity_by_name},
    vector_stores::vector_store::VectorStore,
};

/// Entity field stored as the document id in the entity embedding store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityVectorStoreKey {
    #[default]
    Id,
    Title,
}

impl EntityVectorStoreKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityVectorStoreKey::Id => "id",
            EntityVectorStoreKey::Title => "title",
        }
    }
}

/// Maps a query to at most `k` entities by embedding similarity.
///
/// The store is searched for `k * oversample_scaler` candidates so that excluded names do not starve the
/// result. An empty query falls back to the `k` highest ranked entities. Entities named in
/// `include_entity_names` are always returned first.
#[allow(clippy::too_many_arguments)]
pub async fn map_query_to_entities(
    query: &str,
    text_embedding_vectorstore: &dyn VectorStore,
    text_embedder: &dyn BaseTextEmbedding,
    all_entities: &[Entity],
    embedding_vectorstore_key: EntityVectorStoreKey,
    include_entity_names: &[String],
    exclude_entity_names: &[String],
    k: usize,
    oversample_scaler: usize,
) -> Result<Vec<Entity>> {
    let exclude_entity_names: HashSet<&str> = exclude_entity_names.iter().map(|name| name.as_str()).collect();
    let mut matched_entities: Vec<&Entity> = Vec::new();

    if !query.is_empty() {
        let search_results = text_embedding_vectorstore
            .similarity_search_by_text(query, text_embedder, k * oversample_scaler.max(1))
            .await?;

        for result in search_results {
            if let Some(matched) =
                get_entity_by_key(all_entities, embedding_vectorstore_key.as_str(), &result.document.id)
            {
                matched_entities.push(matched);
            }
        }
    } else {
        matched_entities = all_entities.iter().collect();
        matched_entities.sort_by(|a, b| b.rank.unwrap_or(0).cmp(&a.rank.unwrap_or(0)));
        matched_entities.truncate(k);
    }

    matched_entities.retain(|entity| !exclude_entity_names.contains(entity.title.as_str()));
    matched_entities.truncate(k);

    let mut included_entities: Vec<&Entity> = Vec::new();
    for entity_name in include_entity_names {
        included_entities.extend(get_entity_by_name(all_entities, entity_name));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    Ok(included_entities
        .into_iter()
        .chain(matched_entities)
        .filter(|entity| seen_ids.insert(entity.id.as_str()))
        .cloned()
        .collect())
}
