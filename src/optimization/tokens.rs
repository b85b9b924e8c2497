//! Token counting

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::warn;

static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn bpe() -> Option<&'static CoreBPE> {
    BPE.get_or_init(|| match tiktoken_rs::cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!("cl100k_base unavailable, estimating tokens from length: {}", e);
            None
        }
    })
    .as_ref()
}

/// Count tokens with the cl100k_base encoding (~4 chars per token fallback)
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert!(count_tokens("hello world") >= 2);
        assert!(count_tokens(&"word ".repeat(100)) > count_tokens("word"));
    }
}
