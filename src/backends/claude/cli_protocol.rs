//! Line events written by `claude -p --output-format stream-json`.
//!
//! Only the parts the gateway translates are modelled: the init line (for the
//! native session id), assistant text blocks, and the closing `result` line
//! with its usage. Everything else deserializes to an `Unknown` variant.

use serde::Deserialize;
use serde_json::Value;

use crate::backends::types::UsageInfo as CanonicalUsage;

/// One stdout line, discriminated by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    /// Tool results fed back to the model; ignored.
    User(UserEvent),
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

/// `init` and hook notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,

    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Only `Text` blocks become content chunks.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },

    ToolUse {
        #[serde(default)]
        name: String,
    },

    Thinking {
        #[serde(default)]
        thinking: String,
    },

    // New block kinds must not fail the whole line.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    #[serde(flatten)]
    pub extra: Value,
}

/// Closing summary of a turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    /// "success", "error_max_turns", "error_during_execution", ...
    pub subtype: String,

    #[serde(default)]
    pub is_error: bool,

    /// Final text on success, error description on failure
    #[serde(default)]
    pub result: Option<String>,

    /// Error details reported by some CLI versions
    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

impl ResultEvent {
    pub fn is_failure(&self) -> bool {
        self.is_error || self.subtype != "success"
    }

    /// Native error description, if the CLI provided one.
    pub fn error_message(&self) -> Option<String> {
        if !self.errors.is_empty() {
            return Some(self.errors.join("; "));
        }
        self.result
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Usage as reported by the CLI, before conversion to the canonical triple.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default)]
    pub cache_read_input_tokens: u64,

    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl UsageInfo {
    /// Effective prompt-side load: fresh input plus cache reads and writes.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }

    pub fn to_canonical(&self) -> CanonicalUsage {
        CanonicalUsage::new(self.prompt_tokens(), self.output_tokens, None)
    }
}
