pub mod context_builder;
pub mod error;
pub mod input;
pub mod llm;
pub mod models;
pub mod retrieval;
pub mod search;
pub mod vector_stores;

pub use error::{GraphRagError, Result};
