pub mod prompts;
pub mod search;
