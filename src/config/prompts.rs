//! Prompt templates and default system prompts
//!
//! Providers expect chat turns wrapped in their own syntax. A template holds a
//! pre/post wrapper for each role and is looked up by provider id.
//!
//! # Example template (catalog TOML)
//!
//! ```toml
//! [providers.replicate.template.user]
//! pre_message = "<s>[INST] "
//! post_message = " [/INST]</s>\n"
//! ```

use serde::{Deserialize, Serialize};

use crate::conversation::Role;

/// Text placed around a message of one role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleWrapper {
    #[serde(default)]
    pub pre_message: String,

    #[serde(default)]
    pub post_message: String,
}

impl RoleWrapper {
    pub fn new(pre: impl Into<String>, post: impl Into<String>) -> Self {
        Self {
            pre_message: pre.into(),
            post_message: post.into(),
        }
    }

    pub fn wrap(&self, content: &str) -> String {
        format!("{}{}{}", self.pre_message, content, self.post_message)
    }
}

/// Per-role wrappers for one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: RoleWrapper,

    #[serde(default)]
    pub user: RoleWrapper,

    #[serde(default)]
    pub assistant: RoleWrapper,
}

impl PromptTemplate {
    pub fn wrapper(&self, role: Role) -> &RoleWrapper {
        match role {
            Role::System => &self.system,
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    pub fn apply(&self, role: Role, content: &str) -> String {
        self.wrapper(role).wrap(content)
    }
}

/// Kind of default system prompt a model receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    Instruction,
    Completion,
}

impl PromptKind {
    pub fn default_system_prompt(&self) -> &'static str {
        match self {
            PromptKind::Instruction => builtin::INSTRUCTION,
            PromptKind::Completion => builtin::COMPLETION,
        }
    }
}

/// Built-in prompts and templates that don't require files
pub mod builtin {
    use super::{PromptTemplate, RoleWrapper};

    /// Default prompt for instruction-tuned models
    pub const INSTRUCTION: &str = "You are a helpful AI assistant. You aim to provide accurate, helpful, and safe responses.
Always be direct and concise in your answers. If you're not sure about something, say so.";

    /// Default prompt for completion models
    pub const COMPLETION: &str = "You are a helpful AI assistant that completes text in a natural and coherent way.
Your completions should be contextually appropriate and maintain the style of the input text.";

    /// `Human:` / `Assistant:` turn prefixes
    pub fn human_assistant() -> PromptTemplate {
        PromptTemplate {
            system: RoleWrapper::new("", "\n\n"),
            user: RoleWrapper::new("Human: ", "\n\n"),
            assistant: RoleWrapper::new("Assistant: ", "\n\n"),
        }
    }

    /// Llama-2 style `[INST]` instruction delimiters
    pub fn llama_instruct() -> PromptTemplate {
        PromptTemplate {
            system: RoleWrapper::new("<s>[INST] <<SYS>>\n", "\n<</SYS>>\n[/INST]</s>\n"),
            user: RoleWrapper::new("<s>[INST] ", " [/INST]</s>\n"),
            assistant: RoleWrapper::new("", "\n"),
        }
    }

    /// Messages are sent untouched
    pub fn passthrough() -> PromptTemplate {
        PromptTemplate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_template() {
        let template = builtin::human_assistant();
        assert_eq!(template.apply(Role::User, "Hi"), "Human: Hi\n\n");
        assert_eq!(template.apply(Role::Assistant, "Hello"), "Assistant: Hello\n\n");

        let template = builtin::llama_instruct();
        assert_eq!(template.apply(Role::User, "Hi"), "<s>[INST] Hi [/INST]</s>\n");
    }

    #[test]
    fn test_parse_partial_template() {
        let toml_content = r#"
[user]
pre_message = "Q: "

[assistant]
pre_message = "A: "
post_message = "\n"
"#;

        let template: PromptTemplate = toml::from_str(toml_content).unwrap();
        assert_eq!(template.apply(Role::User, "x"), "Q: x");
        assert_eq!(template.apply(Role::Assistant, "y"), "A: y\n");
        assert_eq!(template.apply(Role::System, "z"), "z");
    }

    #[test]
    fn test_prompt_kind_selects_default() {
        assert!(PromptKind::Instruction.default_system_prompt().contains("helpful AI assistant"));
        assert!(PromptKind::Completion.default_system_prompt().contains("completes text"));
        let kind: PromptKind = serde_json::from_str(r#""completion""#).unwrap();
        assert_eq!(kind, PromptKind::Completion);
    }
}
