use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;

use super::vector_store::{VectorStore, VectorStoreDocument, VectorStoreSearchResult};

/// Brute force cosine similarity store. Documents keep their load order, which is also the
/// tie-break order for equal scores.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    documents: Vec<VectorStoreDocument>,
    include_ids: Option<HashSet<String>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn load_documents(&mut self, documents: Vec<VectorStoreDocument>, overwrite: bool) -> Result<()> {
        if overwrite {
            self.documents.clear();
        }

        for document in documents {
            if document.vector.is_none() {
                continue;
            }
            match self.documents.iter_mut().find(|existing| existing.id == document.id) {
                Some(existing) => *existing = document,
                None => self.documents.push(document),
            }
        }

        Ok(())
    }

    fn filter_by_id(&mut self, include_ids: Vec<String>) {
        self.include_ids = if include_ids.is_empty() {
            None
        } else {
            Some(include_ids.into_iter().collect())
        };
    }

    async fn similarity_search_by_vector(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<VectorStoreSearchResult>> {
        let mut scored: Vec<VectorStoreSearchResult> = self
            .documents
            .iter()
            .filter(|document| match &self.include_ids {
                Some(ids) => ids.contains(&document.id),
                None => true,
            })
            .filter_map(|document| {
                let vector = document.vector.as_ref()?;
                Some(VectorStoreSearchResult {
                    document: document.clone(),
                    score: cosine_similarity(vector, query_embedding),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}
