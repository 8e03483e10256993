//! Gemini CLI `stream-json` event types.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::backends::types::{ChatChunk, UsageInfo};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeminiEvent {
    Init {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Message {
        role: String,
        #[serde(default)]
        content: String,
    },
    ToolUse {
        #[serde(default)]
        tool_name: String,
    },
    Error {
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        message: String,
    },
    Result {
        status: String,
        #[serde(default)]
        error: Option<GeminiError>,
        #[serde(default)]
        stats: Option<GeminiStats>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct GeminiError {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct GeminiStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl GeminiStats {
    pub fn to_canonical(&self) -> UsageInfo {
        UsageInfo::new(self.input_tokens, self.output_tokens, self.total_tokens)
    }
}

/// Internal turn markers Gemini leaks into message text.
const TURN_MARKERS: &[&str] = &["[END_OF_TURN]"];

fn control_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        let literals: Vec<String> = TURN_MARKERS.iter().map(|m| regex::escape(m)).collect();
        Regex::new(&format!(r"{}|<ctrl\d+>", literals.join("|"))).expect("valid regex")
    })
}

/// Removes the tool's internal markers (`[END_OF_TURN]`, `<ctrl42>`) from model text.
/// Any other bracketed text is left alone.
pub fn strip_control_markers(text: &str) -> String {
    control_marker().replace_all(text, "").into_owned()
}

/// True if `tail` is an unfinished marker that a later delta could complete.
fn could_become_marker(tail: &str) -> bool {
    if TURN_MARKERS
        .iter()
        .any(|m| m.len() > tail.len() && m.starts_with(tail))
    {
        return true;
    }
    match tail.strip_prefix('<') {
        Some(rest) => {
            "ctrl".starts_with(rest)
                || rest
                    .strip_prefix("ctrl")
                    .is_some_and(|digits| digits.chars().all(|c| c.is_ascii_digit()))
        }
        None => false,
    }
}

/// Strips markers from streamed `delta` fragments, holding back a trailing
/// fragment that may be the start of a marker split across two messages.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    pending: String,
}

impl MarkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text that is safe to emit now.
    pub fn push(&mut self, text: &str) -> String {
        self.pending.push_str(text);
        let clean = strip_control_markers(&self.pending);
        let hold = clean
            .rfind(|c: char| c == '[' || c == '<')
            .filter(|&i| could_become_marker(&clean[i..]));
        match hold {
            Some(i) => {
                self.pending = clean[i..].to_string();
                clean[..i].to_string()
            }
            None => {
                self.pending.clear();
                clean
            }
        }
    }

    /// Releases held-back text as content once no further delta can follow.
    pub fn drain(&mut self) -> Vec<ChatChunk> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![ChatChunk::content(rest)]
        }
    }
}

/// Outcome of translating one Gemini event.
#[derive(Debug, PartialEq, Eq)]
pub enum Translated {
    Chunks(Vec<ChatChunk>),
    /// Side effect only: the tool announced its session id.
    SessionStarted(String),
    /// Successful end of turn; the caller drains the filter and attaches the native session id.
    Completed(Option<UsageInfo>),
}

pub fn translate_event(event: GeminiEvent, markers: &mut MarkerFilter) -> Translated {
    match event {
        GeminiEvent::Init { session_id, model } => {
            log::debug!("[gemini] init: model={:?}", model);
            match session_id {
                Some(id) if !id.is_empty() => Translated::SessionStarted(id),
                _ => Translated::Chunks(Vec::new()),
            }
        }
        GeminiEvent::Message { role, content } if role == "assistant" => {
            let text = markers.push(&content);
            if text.is_empty() {
                Translated::Chunks(Vec::new())
            } else {
                Translated::Chunks(vec![ChatChunk::content(text)])
            }
        }
        GeminiEvent::Message { .. } => Translated::Chunks(Vec::new()),
        GeminiEvent::ToolUse { tool_name } => {
            log::debug!("[gemini] tool use: {}", tool_name);
            Translated::Chunks(Vec::new())
        }
        GeminiEvent::Error { severity, message } => {
            if severity.as_deref() == Some("warning") {
                log::warn!("[gemini] {}", message);
                return Translated::Chunks(Vec::new());
            }
            let message = if message.trim().is_empty() {
                "Gemini CLI reported an error".to_string()
            } else {
                message
            };
            let mut chunks = markers.drain();
            chunks.push(ChatChunk::error(message));
            Translated::Chunks(chunks)
        }
        GeminiEvent::Result {
            status,
            error,
            stats,
        } => {
            if status == "success" {
                return Translated::Completed(stats.as_ref().map(GeminiStats::to_canonical));
            }
            let message = error
                .map(|e| e.message)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("Gemini CLI finished with status {}", status));
            let mut chunks = markers.drain();
            chunks.push(ChatChunk::error(message));
            Translated::Chunks(chunks)
        }
        GeminiEvent::Unknown => Translated::Chunks(Vec::new()),
    }
}
