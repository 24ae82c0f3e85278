//! Token estimation and the truncation primitive
//!
//! Counts are estimates: the same text always yields the same count and
//! longer text never yields fewer tokens, but boundaries do not have to match
//! any particular provider's tokenizer.

use std::sync::Arc;

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::conversation::{Message, Role};

/// Token estimation strategy used by conversation memory
pub trait TokenCounter: Send + Sync {
    /// Count the tokens in a piece of text
    fn count_tokens(&self, text: &str) -> usize;

    /// Count a message in its serialized `role: content` form
    fn count_message_tokens(&self, message: &Message) -> usize {
        self.count_tokens(&format!("{}: {}", message.role, message.content))
    }

    /// Sum of the message counts
    fn count_conversation_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message_tokens(m)).sum()
    }
}

/// Byte-pair counter using the `cl100k_base` encoding
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> anyhow::Result<Self> {
        let bpe = cl100k_base()?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Whitespace word counter.
///
/// Cheap enough to run on every streamed fragment; the assembler uses it for
/// its live thinking/answer estimates.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Tokens available for a request given the model context length
pub fn available_tokens(context_length: usize, requested: Option<usize>) -> usize {
    match requested {
        Some(requested) => requested.min(context_length),
        None => context_length,
    }
}

/// Keep the most recent messages that fit under `max_tokens`.
///
/// A leading system message is always kept and its cost counts against the
/// budget. The remaining messages are scanned newest first and the scan stops
/// at the first message that does not fit, so the result is always a
/// chronological suffix of the non-system messages.
pub fn truncate_conversation(
    counter: &dyn TokenCounter,
    messages: &[Message],
    max_tokens: usize,
) -> Vec<Message> {
    if counter.count_conversation_tokens(messages) <= max_tokens {
        return messages.to_vec();
    }

    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first), rest),
        _ => (None, messages),
    };

    let mut used = system.map_or(0, |m| counter.count_message_tokens(m));
    let mut keep_from = rest.len();

    for (idx, message) in rest.iter().enumerate().rev() {
        let cost = counter.count_message_tokens(message);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        keep_from = idx;
    }

    system
        .into_iter()
        .chain(rest[keep_from..].iter())
        .cloned()
        .collect()
}
