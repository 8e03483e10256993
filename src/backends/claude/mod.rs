//! Claude Code backend implementation.

mod cli_adapter;
pub mod cli_protocol;

pub use cli_adapter::ClaudeCliBackend;
