use serde::{Deserialize, Serialize};

use crate::FINISH_REASON_STOP;

/// Token accounting for one generation.
///
/// The only constructor computes `total_tokens`, so the total always equals
/// prompt plus completion.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        let prompt_tokens = u64::from(prompt_tokens);
        let completion_tokens = u64::from(completion_tokens);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }
}

/// One frame of a streaming generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub content: String,
    /// Position in the stream, starting at 0 with no gaps.
    pub index: u64,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn partial(content: impl Into<String>, index: u64) -> Self {
        Self {
            content: content.into(),
            index,
            is_complete: false,
            finish_reason: None,
            usage: None,
        }
    }

    /// The completion marker: empty content, aggregate usage.
    pub fn complete(index: u64, usage: TokenUsage) -> Self {
        Self {
            content: String::new(),
            index,
            is_complete: true,
            finish_reason: Some(FINISH_REASON_STOP.to_string()),
            usage: Some(usage),
        }
    }
}
