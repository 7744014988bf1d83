use anyhow::Result;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::types::Message;

/// Per-message framing overhead used when estimating chat prompt size
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Counts tokens for a backend's vocabulary
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count_tokens(&self, text: &str) -> usize {
        self(text)
    }
}

/// BPE tokenizer backed by tiktoken's `cl100k_base` vocabulary
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| anyhow::anyhow!("Tokenizer error: {}", e))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Estimate the prompt size of a conversation
///
/// Non-text content contributes only the framing overhead.
pub fn count_message_tokens(tokenizer: &dyn Tokenizer, messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|msg| {
            let text_tokens = msg.text().map(|t| tokenizer.count_tokens(t)).unwrap_or(0);
            let call_tokens: usize = msg
                .tool_calls()
                .iter()
                .map(|c| tokenizer.count_tokens(&c.function.name) + tokenizer.count_tokens(&c.function.arguments))
                .sum();
            MESSAGE_OVERHEAD_TOKENS + text_tokens + call_tokens
        })
        .sum()
}
