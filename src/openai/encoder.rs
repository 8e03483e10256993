//! Response encoder: canonical chunk sequences to OpenAI wire format.

use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::types::{
    ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, Delta, ErrorBody, ResponseMessage,
    Usage,
};
use crate::backends::{ChatChunk, ChunkStream};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Formats one SSE `data:` event.
pub fn sse_frame<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(e) => {
            log::error!("Failed to serialize SSE frame: {}", e);
            String::new()
        }
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Per-response streaming state: id, timestamp and model are fixed for every event.
#[derive(Debug, Clone)]
pub struct StreamEncoder {
    id: String,
    created: i64,
    model: String,
}

impl StreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            created: unix_now(),
            model: model.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    /// First event of every stream.
    pub fn role_frame(&self) -> String {
        sse_frame(&self.chunk(
            Delta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
            None,
        ))
    }

    /// Frames for one canonical chunk. Terminal chunks include the `[DONE]` sentinel.
    pub fn encode(&self, chunk: &ChatChunk) -> Vec<String> {
        match chunk {
            ChatChunk::Content { text } => vec![sse_frame(&self.chunk(
                Delta {
                    role: None,
                    content: Some(text.clone()),
                },
                None,
                None,
            ))],
            ChatChunk::Done {
                finish_reason,
                usage,
                ..
            } => vec![
                sse_frame(&self.chunk(
                    Delta::default(),
                    Some(finish_reason.clone()),
                    Some(usage.map(Usage::from).unwrap_or(ZERO_USAGE)),
                )),
                DONE_FRAME.to_string(),
            ],
            ChatChunk::Error { message } => vec![
                sse_frame(&ErrorBody::new(message.clone(), "backend_error")),
                DONE_FRAME.to_string(),
            ],
        }
    }
}

const ZERO_USAGE: Usage = Usage {
    prompt_tokens: 0,
    completion_tokens: 0,
    total_tokens: 0,
};

/// SSE body for a chunk sequence.
///
/// Stops after the first terminal chunk. A sequence that ends without one
/// (cancellation) ends the body without further frames.
pub fn sse_stream(events: ChunkStream, encoder: StreamEncoder) -> impl Stream<Item = String> + Send {
    let head = stream::iter(vec![encoder.role_frame()]);
    let body = stream::unfold(
        (events, encoder, false),
        |(mut events, encoder, finished)| async move {
            if finished {
                return None;
            }
            let chunk = events.next().await?;
            let terminal = chunk.is_terminal();
            let frames = encoder.encode(&chunk);
            Some((stream::iter(frames), (events, encoder, terminal)))
        },
    )
    .flatten();
    head.chain(body)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompletionError {
    #[error("{0}")]
    Backend(String),
    #[error("Backend ended without a result")]
    Incomplete,
}

/// Accumulates a chunk sequence into one non-streaming response.
///
/// An `Error` before `Done` discards the partial text.
pub async fn collect_completion(
    mut events: ChunkStream,
    model: &str,
) -> Result<ChatCompletion, CompletionError> {
    let mut text = String::new();
    while let Some(chunk) = events.next().await {
        match chunk {
            ChatChunk::Content { text: piece } => text.push_str(&piece),
            ChatChunk::Done {
                finish_reason: _,
                usage,
                ..
            } => {
                return Ok(ChatCompletion {
                    id: completion_id(),
                    object: "chat.completion".to_string(),
                    created: unix_now(),
                    model: model.to_string(),
                    choices: vec![Choice {
                        index: 0,
                        message: ResponseMessage {
                            role: "assistant".to_string(),
                            content: text,
                        },
                        finish_reason: "stop".to_string(),
                    }],
                    usage: usage.map(Usage::from).unwrap_or(ZERO_USAGE),
                });
            }
            ChatChunk::Error { message } => return Err(CompletionError::Backend(message)),
        }
    }
    Err(CompletionError::Incomplete)
}
