pub mod mixed_context;
pub mod prompts;
pub mod search;
