//! Codex JSONL event types and translation to canonical chunks.

use serde::Deserialize;

use crate::backends::types::{ChatChunk, UsageInfo};

/// Raw event from `codex exec --json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "turn.started")]
    TurnStarted,

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<CodexUsage>,
    },

    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<CodexError>,
    },

    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Item types within Codex events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexItem {
    #[serde(rename = "agent_message")]
    AgentMessage {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "reasoning")]
    Reasoning {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "command_execution")]
    CommandExecution {
        #[serde(default)]
        command: String,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct CodexError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Token usage from Codex.
#[derive(Debug, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl CodexUsage {
    /// `input_tokens` already includes the cached portion.
    pub fn to_canonical(&self) -> UsageInfo {
        UsageInfo::new(self.input_tokens, self.output_tokens, None)
    }
}

/// Outcome of translating one Codex event.
#[derive(Debug, PartialEq, Eq)]
pub enum Translated {
    Chunks(Vec<ChatChunk>),
    /// Side effect only: the tool announced its thread id.
    ThreadStarted(String),
    /// A turn summary; the caller attaches the native thread id.
    Completed(Option<UsageInfo>),
}

/// Converts a CodexEvent into its canonical meaning.
pub fn translate_event(event: CodexEvent) -> Translated {
    match event {
        CodexEvent::ThreadStarted { thread_id } => Translated::ThreadStarted(thread_id),

        CodexEvent::TurnCompleted { usage } => {
            Translated::Completed(usage.as_ref().map(CodexUsage::to_canonical))
        }

        CodexEvent::TurnFailed { error } => {
            let message = error
                .and_then(|e| e.message)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "Codex turn failed".to_string());
            Translated::Chunks(vec![ChatChunk::error(message)])
        }

        CodexEvent::Error { message } => {
            let message = message.unwrap_or_default();
            // Transport reconnect notices are progress, not failures.
            if message.starts_with("Reconnecting") {
                log::info!("[codex] {}", message);
                return Translated::Chunks(Vec::new());
            }
            if message.trim().is_empty() {
                return Translated::Chunks(vec![ChatChunk::error("Codex reported an error")]);
            }
            Translated::Chunks(vec![ChatChunk::error(message)])
        }

        CodexEvent::ItemCompleted { item } => match item {
            CodexItem::AgentMessage { text } if !text.is_empty() => {
                Translated::Chunks(vec![ChatChunk::content(text)])
            }
            CodexItem::Error { message } => {
                // Item-level errors are warnings; the turn continues.
                log::debug!("[codex] item warning: {}", message);
                Translated::Chunks(Vec::new())
            }
            CodexItem::CommandExecution { command } => {
                log::debug!("[codex] command finished: {}", command);
                Translated::Chunks(Vec::new())
            }
            _ => Translated::Chunks(Vec::new()),
        },

        CodexEvent::TurnStarted
        | CodexEvent::ItemStarted { .. }
        | CodexEvent::ItemUpdated { .. }
        | CodexEvent::Unknown => Translated::Chunks(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Translated {
        translate_event(serde_json::from_str(line).unwrap())
    }

    #[test]
    fn thread_started_is_side_effect_only() {
        assert_eq!(
            parse(r#"{"type":"thread.started","thread_id":"th_1"}"#),
            Translated::ThreadStarted("th_1".to_string())
        );
    }

    #[test]
    fn agent_message_becomes_content() {
        assert_eq!(
            parse(r#"{"type":"item.completed","item":{"id":"item_1","type":"agent_message","text":"4"}}"#),
            Translated::Chunks(vec![ChatChunk::content("4")])
        );
    }

    #[test]
    fn traces_are_discarded() {
        for line in [
            r#"{"type":"turn.started"}"#,
            r#"{"type":"item.started","item":{"id":"i","type":"command_execution","command":"ls","status":"in_progress"}}"#,
            r#"{"type":"item.completed","item":{"id":"i","type":"reasoning","text":"**Thinking**"}}"#,
            r#"{"type":"item.completed","item":{"id":"i","type":"command_execution","command":"ls","exit_code":0}}"#,
            r#"{"type":"item.completed","item":{"id":"i","type":"todo_list","items":[]}}"#,
            r#"{"type":"something.new"}"#,
        ] {
            assert_eq!(parse(line), Translated::Chunks(Vec::new()), "{line}");
        }
    }

    #[test]
    fn turn_completed_carries_usage() {
        assert_eq!(
            parse(r#"{"type":"turn.completed","usage":{"input_tokens":100,"cached_input_tokens":40,"output_tokens":7}}"#),
            Translated::Completed(Some(UsageInfo::new(100, 7, None)))
        );
        assert_eq!(parse(r#"{"type":"turn.completed"}"#), Translated::Completed(None));
    }

    #[test]
    fn failures_become_errors_with_fallback() {
        assert_eq!(
            parse(r#"{"type":"turn.failed","error":{"message":"stream disconnected"}}"#),
            Translated::Chunks(vec![ChatChunk::error("stream disconnected")])
        );
        assert_eq!(
            parse(r#"{"type":"turn.failed"}"#),
            Translated::Chunks(vec![ChatChunk::error("Codex turn failed")])
        );
        assert_eq!(
            parse(r#"{"type":"error","message":"quota exceeded"}"#),
            Translated::Chunks(vec![ChatChunk::error("quota exceeded")])
        );
    }

    #[test]
    fn reconnect_notices_are_not_errors() {
        assert_eq!(
            parse(r#"{"type":"error","message":"Reconnecting... 1/5"}"#),
            Translated::Chunks(Vec::new())
        );
    }
}
