//! Streaming response assembler
//!
//! Reasoning models interleave their thinking with the answer, either inline
//! between `<think>` and `</think>` markers or through a separate reasoning
//! channel. The assembler consumes fragments as they arrive, keeps the two
//! apart, produces display updates for every fragment, and builds the message
//! that is finally stored in memory.
//!
//! ```text
//! AwaitingStart ──<think>──▶ Thinking ──</think>──▶ Answering ──end──▶ Finalized
//!       └────────────────── end of stream (no markers) ──────────────────▶┘
//! ```

use std::fmt;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::adapter::ResponseFragment;
use super::tokenizer::{TokenCounter, WordCounter};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Trailing characters kept to spot a marker split across fragments
const LOOKBACK_CHARS: usize = 8;

static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblerState {
    AwaitingStart,
    Thinking,
    Answering,
    Finalized,
}

/// Live generation metrics; token figures are word counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationMetrics {
    pub elapsed_secs: f64,
    pub thinking_tokens: usize,
    pub response_tokens: usize,
}

/// What the render surface should show after a fragment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    /// Thinking still in progress, partial markers withheld
    Preview { text: String },
    /// Finished thinking section, shown as its own block
    ThinkingBlock { text: String },
    /// Answer so far; `cursor` is set while more text may follow
    Answer { text: String, cursor: bool },
    Metrics(GenerationMetrics),
}

/// Generation succeeded but left nothing to store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyResponse {
    NoResponse,
    EmptyAfterProcessing { thinking: String },
}

impl fmt::Display for EmptyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyResponse::NoResponse => f.write_str("No response generated. Please try again."),
            EmptyResponse::EmptyAfterProcessing { .. } => {
                f.write_str("Response was empty after processing. Please try again.")
            }
        }
    }
}

/// The finished response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledResponse {
    pub thinking: Option<String>,
    pub answer: String,
    pub metrics: GenerationMetrics,
}

impl AssembledResponse {
    /// Content to store in memory.
    ///
    /// The thinking section is written back between the same markers it
    /// arrived in so [`split_thinking`] can recover it later.
    pub fn message_content(&self) -> String {
        match self.thinking {
            Some(ref thinking) => format!("{}\n{}\n{}\n\n{}", THINK_OPEN, thinking, THINK_CLOSE, self.answer),
            None => self.answer.clone(),
        }
    }
}

/// Split stored message content into thinking and answer
pub fn split_thinking(content: &str) -> (Option<String>, String) {
    if let Some(rest) = content.trim_start().strip_prefix(THINK_OPEN) {
        if let Some(end) = rest.find(THINK_CLOSE) {
            let thinking = rest[..end].trim().to_string();
            let answer = rest[end + THINK_CLOSE.len()..].trim().to_string();
            return (Some(thinking).filter(|t| !t.is_empty()), answer);
        }
    }
    (None, content.trim().to_string())
}

/// Per-generation streaming state
pub struct StreamAssembler {
    state: AssemblerState,
    /// Inline text not yet attributed to thinking or answer
    raw: String,
    lookback: String,
    thinking: Option<String>,
    /// Text from the structured reasoning channel
    reasoning: String,
    answer: String,
    started: Instant,
    thinking_tokens: usize,
    response_tokens: usize,
    saw_content: bool,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::AwaitingStart,
            raw: String::new(),
            lookback: String::new(),
            thinking: None,
            reasoning: String::new(),
            answer: String::new(),
            started: Instant::now(),
            thinking_tokens: 0,
            response_tokens: 0,
            saw_content: false,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn metrics(&self) -> GenerationMetrics {
        GenerationMetrics {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            thinking_tokens: self.thinking_tokens,
            response_tokens: self.response_tokens,
        }
    }

    /// Feed one fragment; returns the display updates it causes
    pub fn push(&mut self, fragment: &ResponseFragment) -> Vec<RenderUpdate> {
        let mut updates = Vec::new();
        if self.state == AssemblerState::Finalized {
            return updates;
        }

        let reasoning = fragment.reasoning_text();
        if !reasoning.is_empty() {
            self.saw_content = true;
            self.reasoning.push_str(&reasoning);
            self.thinking_tokens = WordCounter.count_tokens(&self.combined_thinking().unwrap_or_default());
            if self.state != AssemblerState::Answering {
                updates.push(RenderUpdate::Preview {
                    text: self.preview_text(),
                });
            }
        }

        if !fragment.content.is_empty() {
            self.saw_content = true;
            match self.state {
                AssemblerState::AwaitingStart | AssemblerState::Thinking => {
                    self.push_unattributed(&fragment.content, &mut updates)
                }
                AssemblerState::Answering => self.push_answer(&fragment.content, &mut updates),
                AssemblerState::Finalized => {}
            }
        }

        updates.push(RenderUpdate::Metrics(self.metrics()));
        updates
    }

    /// Close the stream and build the response to store
    pub fn finish(&mut self) -> Result<AssembledResponse, EmptyResponse> {
        let previous = std::mem::replace(&mut self.state, AssemblerState::Finalized);
        if !self.saw_content {
            return Err(EmptyResponse::NoResponse);
        }

        let raw = std::mem::take(&mut self.raw);
        match previous {
            // No marker ever showed up, all of it was answer
            AssemblerState::AwaitingStart => {
                self.append_answer(&raw);
            }
            // Opening marker never closed: keep it as thinking, no answer
            AssemblerState::Thinking => {
                let body = raw
                    .find(THINK_OPEN)
                    .map_or(raw.as_str(), |open| &raw[open + THINK_OPEN.len()..]);
                let body = body.trim();
                if !body.is_empty() {
                    self.thinking = Some(body.to_string());
                }
                self.thinking_tokens = WordCounter.count_tokens(&self.combined_thinking().unwrap_or_default());
            }
            AssemblerState::Answering | AssemblerState::Finalized => {}
        }

        let answer = self.answer.trim_end().to_string();
        let thinking = self.combined_thinking();

        if answer.is_empty() {
            return Err(match thinking {
                Some(thinking) => EmptyResponse::EmptyAfterProcessing { thinking },
                None => EmptyResponse::NoResponse,
            });
        }

        Ok(AssembledResponse {
            thinking,
            answer,
            metrics: self.metrics(),
        })
    }

    /// Content received before the thinking section was closed
    fn push_unattributed(&mut self, content: &str, updates: &mut Vec<RenderUpdate>) {
        // A separate reasoning channel means inline text is answer, unless it
        // opens with a thinking marker of its own
        if self.state == AssemblerState::AwaitingStart && !self.reasoning.is_empty() {
            let pending = format!("{}{}", self.raw, content);
            let head = pending.trim_start();
            if !head.is_empty() && !THINK_OPEN.starts_with(head) && !head.starts_with(THINK_OPEN) {
                self.raw.clear();
                self.enter_answering(&pending, updates);
                return;
            }
        }

        self.lookback.push_str(content);
        let excess = self.lookback.chars().count().saturating_sub(LOOKBACK_CHARS);
        if let Some((cut, _)) = self.lookback.char_indices().nth(excess) {
            self.lookback.drain(..cut);
        }
        self.raw.push_str(content);

        let open = self.raw.find(THINK_OPEN);
        if open.is_some() {
            self.state = AssemblerState::Thinking;
        }
        let body_start = open.map_or(0, |o| o + THINK_OPEN.len());

        if let Some(close) = self.raw[body_start..].find(THINK_CLOSE).map(|c| c + body_start) {
            let thinking = self.raw[body_start..close].trim().to_string();
            let rest = self.raw[close + THINK_CLOSE.len()..].to_string();
            self.raw.clear();
            self.lookback.clear();

            if !thinking.is_empty() {
                self.thinking = Some(thinking);
            }
            let combined = self.combined_thinking().unwrap_or_default();
            self.thinking_tokens = WordCounter.count_tokens(&combined);
            if !combined.is_empty() {
                updates.push(RenderUpdate::ThinkingBlock { text: combined });
            }
            self.enter_answering(&rest, updates);
            return;
        }

        updates.push(RenderUpdate::Preview {
            text: self.preview_text(),
        });
    }

    fn enter_answering(&mut self, content: &str, updates: &mut Vec<RenderUpdate>) {
        self.state = AssemblerState::Answering;
        self.push_answer(content, updates);
    }

    fn push_answer(&mut self, content: &str, updates: &mut Vec<RenderUpdate>) {
        if self.append_answer(content) {
            updates.push(RenderUpdate::Answer {
                text: self.answer.clone(),
                cursor: true,
            });
        }
    }

    /// Returns whether anything was added
    fn append_answer(&mut self, content: &str) -> bool {
        // Whitespace between the thinking section and the answer is dropped
        let content = if self.answer.is_empty() {
            content.trim_start()
        } else {
            content
        };
        if content.is_empty() {
            return false;
        }

        self.answer.push_str(content);
        if let std::borrow::Cow::Owned(collapsed) = NEWLINE_RUNS.replace_all(&self.answer, "\n\n") {
            self.answer = collapsed;
        }
        self.response_tokens = WordCounter.count_tokens(&self.answer);
        true
    }

    /// Thinking text shown while the section is still open
    fn preview_text(&self) -> String {
        let body = match self.raw.find(THINK_OPEN) {
            Some(open) => &self.raw[open + THINK_OPEN.len()..],
            None => self.raw.as_str(),
        };
        let withheld = self.partial_marker_len().min(body.len());
        let visible = body[..body.len() - withheld].trim_start();

        match self.reasoning.trim() {
            "" => visible.to_string(),
            reasoning if visible.is_empty() => reasoning.to_string(),
            reasoning => format!("{}\n\n{}", reasoning, visible),
        }
    }

    /// Length of a marker prefix sitting at the end of the raw buffer
    fn partial_marker_len(&self) -> usize {
        let open_seen = self.raw.contains(THINK_OPEN);
        (1..THINK_CLOSE.len())
            .rev()
            .find(|&k| {
                self.lookback.ends_with(&THINK_CLOSE[..k])
                    || (!open_seen && k < THINK_OPEN.len() && self.lookback.ends_with(&THINK_OPEN[..k]))
            })
            .unwrap_or(0)
    }

    /// Structured reasoning and inline thinking as one section
    fn combined_thinking(&self) -> Option<String> {
        let parts: Vec<&str> = [Some(self.reasoning.trim()), self.thinking.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}
