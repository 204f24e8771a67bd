use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphRagError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("LLM request failed: {0}")]
    Llm(#[source] anyhow::Error),
    #[error("Embedding request failed: {0}")]
    Embedding(#[source] anyhow::Error),
    #[error("Vector store error: {0}")]
    VectorStore(String),
    #[error("Search was cancelled")]
    Cancelled,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Data frame error: {0}")]
    DataFrame(#[from] polars::prelude::PolarsError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphRagError {
    pub fn config(message: impl Into<String>) -> Self {
        GraphRagError::Config(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, GraphRagError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphRagError>;
