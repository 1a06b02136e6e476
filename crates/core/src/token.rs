//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 bytes per token. This is accurate
//! within ~10% for BPE tokenizers on English text and, unlike a real
//! tokenizer, is sub-additive: `estimate(a + b) <= estimate(a) + estimate(b)`.
//! Budget arithmetic relies on that property.

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 bytes. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Largest prefix of `text` that fits in `max_tokens`, cut on a char boundary.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let max_bytes = max_tokens.saturating_mul(4);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn concatenation_never_costs_more() {
        let a = "hello";
        let b = " world!";
        let joined = format!("{a}{b}");
        assert!(estimate_tokens(&joined) <= estimate_tokens(a) + estimate_tokens(b));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééééé"; // 10 bytes
        let cut = truncate_to_tokens(text, 1);
        assert_eq!(cut, "éé");
        assert!(estimate_tokens(cut) <= 1);
        assert_eq!(truncate_to_tokens("short", 10), "short");
    }
}
