//! Chat core
//!
//! Token counting, conversation memory, the completion adapter, streaming
//! response assembly and the session that ties them together.

pub mod adapter;
pub mod assembler;
mod chat;
mod error;
pub mod memory;
pub mod tokenizer;

pub use adapter::{CompletionAdapter, GenerationSettings, ResponseFragment};
pub use assembler::{AssembledResponse, EmptyResponse, GenerationMetrics, RenderUpdate, StreamAssembler};
pub use chat::{ChatSession, Notice, PlaceholderId, RenderSurface, SubmitOutcome, MIN_MEMORY_TOKENS};
pub use error::ChatError;
pub use memory::{ConversationMemory, TokenUsage};
pub use tokenizer::{TiktokenCounter, TokenCounter, WordCounter};
