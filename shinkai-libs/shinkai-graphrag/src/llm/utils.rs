use lazy_static::lazy_static;
use serde_json::Value;
use tiktoken_rs::{get_bpe_from_tokenizer, tokenizer::Tokenizer, CoreBPE};

lazy_static! {
    static ref CL100K_BASE: Option<CoreBPE> = get_bpe_from_tokenizer(Tokenizer::Cl100kBase).ok();
}

/// Number of `cl100k_base` tokens in `text`.
pub fn num_tokens(text: &str) -> usize {
    match CL100K_BASE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        // Rough estimate when the encoder data cannot be loaded.
        None => text.len().div_ceil(4),
    }
}

pub fn batched<T>(iterable: impl Iterator<Item = T>, n: usize) -> impl Iterator<Item = Vec<T>> {
    let n = n.max(1);
    let mut it = iterable.peekable();
    std::iter::from_fn(move || {
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            match it.next() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    })
}

/// Splits `text` into pieces of at most `max_tokens` tokens each.
///
/// A piece ends early when its last token stops inside a multi-byte character, so every piece is valid
/// text. A single token that cannot stand alone is widened until the character is complete.
pub fn chunk_text(text: &str, max_tokens: usize) -> anyhow::Result<Vec<String>> {
    match CL100K_BASE.as_ref() {
        Some(bpe) => {
            let tokens = bpe.encode_with_special_tokens(text);
            let max_tokens = max_tokens.max(1);
            let decode = |range: &[usize]| String::from_utf8(bpe._decode_native(range));

            let mut chunks = Vec::new();
            let mut start = 0;
            while start < tokens.len() {
                let mut end = (start + max_tokens).min(tokens.len());
                while end > start + 1 && decode(&tokens[start..end]).is_err() {
                    end -= 1;
                }
                while end < tokens.len() && decode(&tokens[start..end]).is_err() {
                    end += 1;
                }

                let bytes = bpe._decode_native(&tokens[start..end]);
                chunks.push(String::from_utf8_lossy(&bytes).into_owned());
                start = end;
            }
            Ok(chunks)
        }
        None => {
            let chars: Vec<char> = text.chars().collect();
            Ok(batched(chars.into_iter(), max_tokens.saturating_mul(4))
                .map(|chunk| chunk.into_iter().collect())
                .collect())
        }
    }
}

/// Extracts the first JSON object from an LLM reply, tolerating markdown fences and
/// surrounding prose.
pub fn try_parse_json_object(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}
