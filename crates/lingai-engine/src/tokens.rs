use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOKEN_BOUNDARY: Regex =
        Regex::new(r"\s+|[.,!?;:]").expect("token boundary pattern is valid");
}

/// Whitespace/punctuation word count. Not a tokenizer.
pub fn count_tokens(text: &str) -> u32 {
    let count = TOKEN_BOUNDARY
        .split(text)
        .filter(|token| !token.is_empty())
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}
