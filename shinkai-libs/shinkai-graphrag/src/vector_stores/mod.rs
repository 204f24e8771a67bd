pub mod in_memory;
pub mod vector_store;
