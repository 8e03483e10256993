//! Multi-backend abstraction layer for AI coding CLIs.
//!
//! Each backend drives one CLI tool as a subprocess per turn and translates
//! its native line-delimited JSON into canonical [`ChatChunk`]s.

mod bridge;
mod native_sessions;
mod process;
mod prompt;
mod registry;
mod retry;
pub(crate) mod types;

pub mod claude;
pub mod codex;
pub mod gemini;

pub use bridge::{LineBuffer, OutputBridge};
pub use native_sessions::NativeSessionCache;
pub use process::{check_cli_installed, cli_on_path, spawn_piped, spawn_pty, AnsiStripper, LineParser, ProcessSpec};
pub use prompt::{build_prompt, collect_system_prompt, first_user_message, flatten_transcript, last_user_message};
pub use registry::{BackendRegistry, RouteError};
pub use retry::RetryingBackend;
pub use types::{
    Backend, BackendError, BackendKind, BackendRun, ChatChunk, ChatMessage, ChunkStream,
    InstallStatus, ModelInfo, SpawnRequest, UsageInfo,
};
