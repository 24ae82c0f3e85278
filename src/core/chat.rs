//! Chat session orchestration
//!
//! A [`ChatSession`] owns everything one conversation needs: its memory, the
//! adapter for the selected model and the sampling settings. Submitting a
//! prompt:
//! 1. Rejects the prompt while another generation is in flight
//! 2. Disables input on the render surface
//! 3. Stores the prompt and streams a response through the assembler
//! 4. Commits the assembled message, or reports why nothing was committed
//! 5. Re-enables input, whatever the outcome

use std::fmt;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::config::CatalogEntry;
use crate::conversation::{Message, Role};

use super::adapter::{CompletionAdapter, GenerationSettings};
use super::assembler::{AssembledResponse, EmptyResponse, RenderUpdate, StreamAssembler};
use super::error::ChatError;
use super::memory::ConversationMemory;
use super::tokenizer::available_tokens;

/// Smallest memory ceiling a session accepts
pub const MIN_MEMORY_TOKENS: usize = 100;

/// Handle to a block created on the render surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PlaceholderId(Uuid);

impl PlaceholderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlaceholderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// User-visible message outside the conversation itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "lowercase")]
pub enum Notice {
    Warning(String),
    Error(String),
}

/// Where a session shows its progress
pub trait RenderSurface: Send {
    /// Create an empty block for a message of `role`
    fn create_placeholder(&mut self, role: Role) -> PlaceholderId;

    fn update_placeholder(&mut self, id: PlaceholderId, update: RenderUpdate);

    fn notify(&mut self, notice: Notice);

    fn set_input_enabled(&mut self, enabled: bool);
}

/// How a successful submission ended
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Response stored in memory
    Committed(AssembledResponse),
    /// Nothing usable came back; memory holds only the prompt
    Empty(EmptyResponse),
}

pub struct ChatSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    memory: ConversationMemory,
    adapter: CompletionAdapter,
    settings: GenerationSettings,
    busy: bool,
}

impl ChatSession {
    pub fn new(
        adapter: CompletionAdapter,
        memory: ConversationMemory,
        settings: GenerationSettings,
    ) -> Result<Self, ChatError> {
        settings.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            memory,
            adapter,
            settings,
            busy: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn model(&self) -> &CatalogEntry {
        self.adapter.model()
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn clear_messages(&mut self) {
        self.memory.clear_messages();
    }

    /// Change the memory ceiling.
    ///
    /// The request is capped at the model's context length and floored at
    /// [`MIN_MEMORY_TOKENS`]; returns the ceiling actually applied.
    pub fn set_memory_limit(&mut self, requested: usize) -> usize {
        let context_length = self.adapter.model().spec.context_length;
        let ceiling = available_tokens(context_length, Some(requested)).max(MIN_MEMORY_TOKENS);
        self.memory.set_max_tokens(ceiling);
        ceiling
    }

    /// Send a prompt and stream the response to `surface`.
    ///
    /// Errors are also reported to the surface as [`Notice::Error`]. A failed
    /// or empty generation never stores assistant output.
    pub async fn submit(
        &mut self,
        prompt: &str,
        surface: &mut dyn RenderSurface,
    ) -> Result<SubmitOutcome, ChatError> {
        if self.busy {
            return Err(ChatError::Busy);
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::Configuration("prompt is empty".into()));
        }
        if !self.memory.can_hold(&Message::user(prompt)) {
            return Err(ChatError::Configuration(format!(
                "prompt does not fit in the {} token conversation memory",
                self.memory.max_tokens()
            )));
        }

        self.busy = true;
        surface.set_input_enabled(false);

        let result = self.generate(prompt, surface).await;

        self.busy = false;
        surface.set_input_enabled(true);

        match result {
            Ok(SubmitOutcome::Committed(ref response)) => {
                tracing::info!(
                    "Session {} committed response ({} thinking / {} answer words in {:.1}s)",
                    self.id,
                    response.metrics.thinking_tokens,
                    response.metrics.response_tokens,
                    response.metrics.elapsed_secs
                );
            }
            Ok(SubmitOutcome::Empty(ref empty)) => {
                tracing::warn!("Session {}: {}", self.id, empty);
                surface.notify(Notice::Warning(empty.to_string()));
            }
            Err(ref e) => {
                tracing::error!("Session {}: {}", self.id, e);
                surface.notify(Notice::Error(e.to_string()));
            }
        }

        result
    }

    async fn generate(
        &mut self,
        prompt: &str,
        surface: &mut dyn RenderSurface,
    ) -> Result<SubmitOutcome, ChatError> {
        let prompt_slot = surface.create_placeholder(Role::User);
        surface.update_placeholder(
            prompt_slot,
            RenderUpdate::Answer {
                text: prompt.to_string(),
                cursor: false,
            },
        );
        self.memory.add_message(Role::User, prompt);

        let slot = surface.create_placeholder(Role::Assistant);
        let mut assembler = StreamAssembler::new();
        let mut fragments = self.adapter.generate(self.memory.messages(), &self.settings);

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            for update in assembler.push(&fragment) {
                surface.update_placeholder(slot, update);
            }
        }

        match assembler.finish() {
            Ok(response) => {
                surface.update_placeholder(
                    slot,
                    RenderUpdate::Answer {
                        text: response.answer.clone(),
                        cursor: false,
                    },
                );
                self.memory.add_message(Role::Assistant, response.message_content());
                Ok(SubmitOutcome::Committed(response))
            }
            Err(empty) => Ok(SubmitOutcome::Empty(empty)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::core::adapter::tests::{adapter_with, ScriptedProvider};
    use crate::core::tokenizer::WordCounter;
    use crate::providers::ProviderError;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Placeholder(Role),
        Update(RenderUpdate),
        Notice(Notice),
        Input(bool),
    }

    #[derive(Default)]
    struct RecordingSurface {
        events: Vec<Event>,
    }

    impl RecordingSurface {
        fn notices(&self) -> Vec<&Notice> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Notice(n) => Some(n),
                    _ => None,
                })
                .collect()
        }
    }

    impl RenderSurface for RecordingSurface {
        fn create_placeholder(&mut self, role: Role) -> PlaceholderId {
            self.events.push(Event::Placeholder(role));
            PlaceholderId::new()
        }

        fn update_placeholder(&mut self, _id: PlaceholderId, update: RenderUpdate) {
            self.events.push(Event::Update(update));
        }

        fn notify(&mut self, notice: Notice) {
            self.events.push(Event::Notice(notice));
        }

        fn set_input_enabled(&mut self, enabled: bool) {
            self.events.push(Event::Input(enabled));
        }
    }

    fn new_session(provider: Arc<ScriptedProvider>) -> ChatSession {
        let memory = ConversationMemory::new(Arc::new(WordCounter), 1000);
        ChatSession::new(adapter_with(provider), memory, GenerationSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_commits_thinking_and_answer() {
        let provider = Arc::new(ScriptedProvider::new(&["<think>greet", " back</think>", "Hello!"], false));
        let mut session = new_session(provider.clone());
        let mut surface = RecordingSurface::default();

        let outcome = session.submit("  hi  ", &mut surface).await.unwrap();
        let SubmitOutcome::Committed(response) = outcome else {
            panic!("expected a committed response");
        };
        assert_eq!(response.answer, "Hello!");

        assert_eq!(
            session.memory().messages(),
            &[
                Message::user("hi"),
                Message::assistant("<think>\ngreet back\n</think>\n\nHello!"),
            ]
        );
        assert!(!session.is_busy());

        assert_eq!(surface.events.first(), Some(&Event::Input(false)));
        assert_eq!(surface.events.last(), Some(&Event::Input(true)));
        assert_eq!(surface.events[1], Event::Placeholder(Role::User));
        assert!(surface.events.contains(&Event::Placeholder(Role::Assistant)));
        assert!(surface.events.contains(&Event::Update(RenderUpdate::ThinkingBlock {
            text: "greet back".into()
        })));
        assert!(surface.events.contains(&Event::Update(RenderUpdate::Answer {
            text: "Hello!".into(),
            cursor: false
        })));
        assert!(surface.notices().is_empty());

        // The prompt went out wrapped in the provider template
        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.messages.last().unwrap().content, "Human: hi\n\n");
    }

    #[tokio::test]
    async fn test_history_is_sent_on_the_next_turn() {
        let provider = Arc::new(ScriptedProvider::new(&["first"], false));
        let mut session = new_session(provider);
        let mut surface = RecordingSurface::default();
        session.submit("one", &mut surface).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new(&["second"], false));
        let mut next = ChatSession {
            adapter: adapter_with(provider.clone()),
            ..session
        };
        next.submit("two", &mut surface).await.unwrap();

        let request = provider.last_request.lock().unwrap().clone().unwrap();
        let contents: Vec<_> = request.messages.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Human: one\n\n", "Assistant: first\n\n", "Human: two\n\n"]
        );
        assert_eq!(next.memory().len(), 4);
    }

    #[tokio::test]
    async fn test_timeout_after_two_fragments_commits_nothing() {
        let provider = Arc::new(ScriptedProvider::new(&["Partial ", "answer"], true));
        let mut session = new_session(provider);
        let mut surface = RecordingSurface::default();

        let err = session.submit("hi", &mut surface).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Generation {
                source: ProviderError::Timeout(_),
                ..
            }
        ));

        assert_eq!(session.memory().messages(), &[Message::user("hi")]);
        assert!(!session.is_busy());
        assert_eq!(
            surface.events.iter().rev().find(|e| matches!(e, Event::Input(_))),
            Some(&Event::Input(true))
        );
        match surface.notices().as_slice() {
            [Notice::Error(message)] => assert!(message.contains("groq/qwen-qwq-32b")),
            other => panic!("unexpected notices: {:?}", other),
        }

        // The partial answer was shown but never finalized
        assert!(!surface.events.iter().any(|e| matches!(
            e,
            Event::Update(RenderUpdate::Answer { cursor: false, text }) if text.contains("Partial")
        )));
    }

    #[tokio::test]
    async fn test_empty_response_is_a_warning() {
        let provider = Arc::new(ScriptedProvider::new(&["<think>nothing to say</think>", "  "], false));
        let mut session = new_session(provider);
        let mut surface = RecordingSurface::default();

        let outcome = session.submit("hi", &mut surface).await.unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::Empty(EmptyResponse::EmptyAfterProcessing { .. })
        ));
        assert_eq!(session.memory().len(), 1);
        assert!(matches!(surface.notices().as_slice(), [Notice::Warning(_)]));

        let provider = Arc::new(ScriptedProvider::new(&[], false));
        let mut session = new_session(provider);
        let outcome = session.submit("hi", &mut surface).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Empty(EmptyResponse::NoResponse));
    }

    #[tokio::test]
    async fn test_busy_session_rejects_submission() {
        let provider = Arc::new(ScriptedProvider::new(&["ok"], false));
        let mut session = new_session(provider);
        session.busy = true;

        let mut surface = RecordingSurface::default();
        assert!(matches!(session.submit("hi", &mut surface).await, Err(ChatError::Busy)));
        assert!(surface.events.is_empty());
        assert!(session.memory().is_empty());
    }

    #[tokio::test]
    async fn test_blank_prompt_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(&["ok"], false));
        let mut session = new_session(provider);
        let mut surface = RecordingSurface::default();

        assert!(matches!(
            session.submit(" \n ", &mut surface).await,
            Err(ChatError::Configuration(_))
        ));
        assert!(session.memory().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_oversized_prompt_is_rejected_before_sending() {
        let provider = Arc::new(ScriptedProvider::new(&["ok"], false));
        let memory = ConversationMemory::new(Arc::new(WordCounter), 100);
        let mut session = ChatSession::new(adapter_with(provider.clone()), memory, GenerationSettings::default()).unwrap();
        let mut surface = RecordingSurface::default();

        let prompt = vec!["word"; 150].join(" ");
        let err = session.submit(&prompt, &mut surface).await.unwrap_err();
        assert!(matches!(err, ChatError::Configuration(ref m) if m.contains("100")));

        assert!(provider.last_request.lock().unwrap().is_none());
        assert!(session.memory().is_empty());
        assert!(!session.is_busy());
        assert!(surface.events.is_empty());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let provider = Arc::new(ScriptedProvider::new(&[], false));
        let memory = ConversationMemory::new(Arc::new(WordCounter), 1000);
        let settings = GenerationSettings {
            temperature: Some(3.0),
            ..Default::default()
        };
        assert!(matches!(
            ChatSession::new(adapter_with(provider), memory, settings),
            Err(ChatError::Configuration(_))
        ));
    }

    #[test]
    fn test_memory_limit_is_clamped() {
        let mut session = new_session(Arc::new(ScriptedProvider::new(&[], false)));
        assert_eq!(session.set_memory_limit(10), MIN_MEMORY_TOKENS);
        assert_eq!(session.set_memory_limit(4096), 4096);
        assert_eq!(session.set_memory_limit(10_000_000), 128_000);
        assert_eq!(session.memory().max_tokens(), 128_000);
    }

    #[test]
    fn test_notice_serialization() {
        let json = serde_json::to_value(Notice::Warning("empty".into())).unwrap();
        assert_eq!(json, serde_json::json!({"level": "warning", "message": "empty"}));
    }
}
