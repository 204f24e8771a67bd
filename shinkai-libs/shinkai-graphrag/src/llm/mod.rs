pub mod base;
pub mod cancellable;
pub mod ollama;
pub mod openai;
pub mod utils;
