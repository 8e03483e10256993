//! Codex CLI backend implementation.

mod adapter;
pub mod events;

pub use adapter::CodexBackend;
