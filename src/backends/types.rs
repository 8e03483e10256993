//! Core types and traits for the backend abstraction layer.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identifies the type of AI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Codex,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Claude, BackendKind::Codex, BackendKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            "gemini" => Ok(BackendKind::Gemini),
            _ => Err(BackendError::new(format!("Unknown backend: {}", s))),
        }
    }
}

/// Error type for backend operations that fail before a chunk sequence exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Status of CLI installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}

/// Token usage for one completed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageInfo {
    /// Builds usage from prompt/completion counts, computing the total when the tool omits it.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens.unwrap_or(prompt_tokens + completion_tokens),
        }
    }
}

/// Canonical output unit produced by every backend.
///
/// A sequence holds zero or more `Content` chunks followed by exactly one
/// `Done` or `Error`, unless it was cancelled, in which case it just ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChunk {
    Content {
        text: String,
    },
    Done {
        finish_reason: String,
        usage: Option<UsageInfo>,
        native_session_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ChatChunk {
    pub fn content(text: impl Into<String>) -> Self {
        ChatChunk::Content { text: text.into() }
    }

    pub fn done(usage: Option<UsageInfo>, native_session_id: Option<String>) -> Self {
        ChatChunk::Done {
            finish_reason: "stop".to_string(),
            usage,
            native_session_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ChatChunk::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatChunk::Content { .. })
    }
}

/// Information about an available model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// `backend/model` form.
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

impl ModelInfo {
    pub fn new(kind: BackendKind, model: &str, name: &str, owned_by: &str) -> Self {
        Self {
            id: format!("{}/{}", kind, model),
            name: name.to_string(),
            owned_by: owned_by.to_string(),
        }
    }
}

/// One message of the inbound conversation, already flattened to plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Inputs to launch one backend turn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub session_id: String,
    pub is_new_conversation: bool,
    /// Grants the subprocess unattended tool execution. Never defaulted to true.
    pub tools_enabled: bool,
    pub cancel: CancellationToken,
}

impl SpawnRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, session_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            session_id: session_id.into(),
            is_new_conversation: true,
            tools_enabled: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Copy of this request bound to a different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

pub type ChunkStream = BoxStream<'static, ChatChunk>;

/// Handle to one running backend turn: the chunk sequence and a way to stop it.
pub struct BackendRun {
    pub events: ChunkStream,
    kill: CancellationToken,
}

impl BackendRun {
    pub fn new(events: ChunkStream, kill: CancellationToken) -> Self {
        Self { events, kill }
    }

    /// Forcibly terminates the subprocess. The sequence ends without a terminal chunk.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn into_parts(self) -> (ChunkStream, CancellationToken) {
        (self.events, self.kill)
    }
}

/// Trait for a backend implementation (e.g., Claude, Codex).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Static model list for this tool.
    fn list_models(&self) -> Vec<ModelInfo>;

    /// Model used when the caller names only the backend.
    fn default_model(&self) -> String;

    /// Resolves the CLI and asks it for its version.
    async fn check_installed(&self) -> InstallStatus;

    /// PATH lookup only. Never runs the tool.
    fn detect(&self) -> bool;

    /// Launches one turn. Never fails: spawn errors surface as an `Error` chunk.
    fn run(&self, request: SpawnRequest) -> BackendRun;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips_through_strings() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("CLAUDE".parse::<BackendKind>().is_ok());
        assert_eq!(
            "copilot".parse::<BackendKind>().unwrap_err().to_string(),
            "Unknown backend: copilot"
        );
    }

    #[test]
    fn usage_total_is_computed_when_absent() {
        assert_eq!(UsageInfo::new(10, 5, None).total_tokens, 15);
        assert_eq!(UsageInfo::new(10, 5, Some(40)).total_tokens, 40);
    }

    #[test]
    fn only_content_is_non_terminal() {
        assert!(!ChatChunk::content("hi").is_terminal());
        assert!(ChatChunk::done(None, None).is_terminal());
        assert!(ChatChunk::error("boom").is_terminal());
    }

    #[test]
    fn model_info_uses_backend_prefix() {
        let info = ModelInfo::new(BackendKind::Codex, "gpt-5", "GPT-5", "openai");
        assert_eq!(info.id, "codex/gpt-5");
    }
}
