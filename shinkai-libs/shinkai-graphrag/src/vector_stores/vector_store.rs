use async_trait::async_trait;

use crate::{
    error::{GraphRagError, Result},
    llm::base::BaseTextEmbedding,
    models::Attributes,
};

#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreSearchResult {
    pub document: VectorStoreDocument,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorStoreDocument {
    pub id: String,
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub attributes: Attributes,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn load_documents(&mut self, documents: Vec<VectorStoreDocument>, overwrite: bool) -> Result<()>;

    /// Restricts subsequent searches to the given document ids. An empty list clears the filter.
    fn filter_by_id(&mut self, include_ids: Vec<String>);

    async fn similarity_search_by_vector(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<VectorStoreSearchResult>>;

    async fn similarity_search_by_text(
        &self,
        text: &str,
        text_embedder: &dyn BaseTextEmbedding,
        k: usize,
    ) -> Result<Vec<VectorStoreSearchResult>> {
        let query_embedding = text_embedder.aembed(text).await.map_err(GraphRagError::Embedding)?;
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        self.similarity_search_by_vector(&query_embedding, k).await
    }
}
