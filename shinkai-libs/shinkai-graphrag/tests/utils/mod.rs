#![allow(dead_code)]

pub mod mock;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
