//! OpenAI-compatible wire layer.

mod encoder;
pub mod types;

pub use encoder::{collect_completion, sse_frame, sse_stream, CompletionError, StreamEncoder, DONE_FRAME};
pub use types::{ChatCompletion, ChatCompletionRequest, ErrorBody, ModelList};
