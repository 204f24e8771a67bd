pub mod community_context;
pub mod context_builder;
pub mod context_table;
pub mod conversation_history;
pub mod dynamic_community_selection;
pub mod entity_extraction;
pub mod local_context;
pub mod rate_relevancy;
pub mod source_context;
