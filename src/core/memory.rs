//! Token-bounded conversation memory
//!
//! Holds the message log of a single session. Every mutation is followed by a
//! truncation pass so the log never costs more than the configured ceiling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conversation::{Message, Role};

use super::tokenizer::{truncate_conversation, TokenCounter};

/// Current token usage of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub current: usize,
    pub max: usize,
}

/// In-session conversation log
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_tokens: usize,
    counter: Arc<dyn TokenCounter>,
}

impl ConversationMemory {
    pub fn new(counter: Arc<dyn TokenCounter>, max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            counter,
        }
    }

    /// Append a message and enforce the token ceiling.
    ///
    /// System messages are only ever stored at the head of the log, so a
    /// `Role::System` message replaces the current system prompt instead of
    /// being appended.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        match role {
            Role::System => self.set_system_prompt(content),
            _ => {
                self.messages.push(Message::new(role, content));
                self.manage_memory();
            }
        }
    }

    /// Install or replace the leading system message
    pub fn set_system_prompt(&mut self, content: impl Into<String>) {
        let message = Message::system(content);
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => *first = message,
            _ => self.messages.insert(0, message),
        }
        self.manage_memory();
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Whether a new message fits under the ceiling next to the system
    /// prompt. Anything larger would be truncated away as soon as it is added.
    pub fn can_hold(&self, message: &Message) -> bool {
        let system = self
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .map_or(0, |m| self.counter.count_message_tokens(m));
        system + self.counter.count_message_tokens(message) <= self.max_tokens
    }

    /// Change the ceiling; shrinking it truncates immediately
    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.max_tokens = max_tokens;
        self.manage_memory();
    }

    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            current: self.counter.count_conversation_tokens(&self.messages),
            max: self.max_tokens,
        }
    }

    fn manage_memory(&mut self) {
        let current = self.counter.count_conversation_tokens(&self.messages);
        if current > self.max_tokens {
            let before = self.messages.len();
            self.messages = truncate_conversation(self.counter.as_ref(), &self.messages, self.max_tokens);
            tracing::debug!(
                "Truncated conversation from {} to {} messages ({} tokens over a {} ceiling)",
                before,
                self.messages.len(),
                current,
                self.max_tokens
            );
        }
    }
}
