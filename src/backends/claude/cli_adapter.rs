//! Claude CLI direct wrapper backend adapter.
//!
//! Spawns `claude -p` once per turn and translates its `stream-json` output
//! into canonical chunks. Claude accepts a caller-chosen `--session-id`, so
//! the gateway session id is used directly for resume.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::cli_protocol::{CliEvent, ContentBlock};
use crate::backends::native_sessions::NativeSessionCache;
use crate::backends::process::{check_cli_installed, cli_on_path, spawn_piped, LineParser, ProcessSpec};
use crate::backends::prompt::build_prompt;
use crate::backends::types::{
    Backend, BackendKind, BackendRun, ChatChunk, InstallStatus, ModelInfo, SpawnRequest,
};
use crate::config::{backend_env, BackendConfig};
use crate::sessions::session_uuid;

const DEFAULT_MODEL: &str = "sonnet";

/// Claude CLI backend implementation.
pub struct ClaudeCliBackend {
    command: String,
    default_model: String,
    session_continuity: bool,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    /// Gateway session id -> Claude session id actually used.
    sessions: Arc<NativeSessionCache>,
}

impl ClaudeCliBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            command: config.command(BackendKind::Claude),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            session_continuity: config.session_continuity,
            env: backend_env(BackendKind::Claude, &config.env_allow),
            working_dir: config.working_dir.clone(),
            sessions: Arc::new(NativeSessionCache::new()),
        }
    }

    /// Claude session id for this turn and whether it resumes an existing one.
    ///
    /// A fresh turn seeds `--session-id` with the gateway id the first time it
    /// is seen. Claude refuses to reuse an id, so a fresh turn for an id this
    /// adapter already seeded gets a new random id instead.
    fn claude_session(&self, request: &SpawnRequest) -> Option<(String, bool)> {
        if !self.session_continuity {
            return None;
        }
        let seeded = session_uuid(&request.session_id);
        if !request.is_new_conversation {
            let id = self.sessions.get(&request.session_id).unwrap_or(seeded);
            return Some((id, true));
        }
        let id = if self.sessions.contains(&request.session_id) {
            Uuid::new_v4().to_string()
        } else {
            seeded
        };
        self.sessions.insert(&request.session_id, &id);
        Some((id, false))
    }

    fn build_args(&self, request: &SpawnRequest, session: Option<&(String, bool)>) -> Vec<String> {
        let resuming = matches!(session, Some((_, true)));
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let mut args = vec![
            "-p".to_string(),
            build_prompt(&request.messages, resuming),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            model,
        ];

        match session {
            Some((id, true)) => args.extend(["--resume".to_string(), id.clone()]),
            Some((id, false)) => args.extend(["--session-id".to_string(), id.clone()]),
            None => {}
        }

        if let Some(system_prompt) = &request.system_prompt {
            args.extend(["--system-prompt".to_string(), system_prompt.clone()]);
        }

        // Tool use is a trust boundary: bypass only on explicit opt-in.
        if request.tools_enabled {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.extend(["--tools".to_string(), String::new()]);
        }

        args
    }
}

#[async_trait]
impl Backend for ClaudeCliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo::new(BackendKind::Claude, "opus", "Claude Opus", "anthropic"),
            ModelInfo::new(BackendKind::Claude, "sonnet", "Claude Sonnet", "anthropic"),
            ModelInfo::new(BackendKind::Claude, "haiku", "Claude Haiku", "anthropic"),
        ]
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    async fn check_installed(&self) -> InstallStatus {
        check_cli_installed(&self.command).await
    }

    fn detect(&self) -> bool {
        cli_on_path(&self.command)
    }

    fn run(&self, request: SpawnRequest) -> BackendRun {
        if request.temperature.is_some() || request.max_tokens.is_some() {
            log::debug!("claude: temperature/max_tokens are not supported by the CLI, ignoring");
        }

        let session = self.claude_session(&request);
        let mut spec = ProcessSpec::new("claude", self.command.clone());
        spec.args = self.build_args(&request, session.as_ref());
        spec.env = self.env.clone();
        spec.cwd = self.working_dir.clone();

        log::info!(
            "claude turn: session={} resume={} model={}",
            request.session_id,
            matches!(session, Some((_, true))),
            request.model
        );

        let parser = ClaudeParser {
            gateway_id: request.session_id.clone(),
            sessions: Arc::clone(&self.sessions),
            native_id: session.map(|(id, _)| id),
        };
        spawn_piped(spec, Box::new(parser), &request.cancel)
    }
}

/// Maps `stream-json` lines to canonical chunks for one turn.
struct ClaudeParser {
    gateway_id: String,
    sessions: Arc<NativeSessionCache>,
    native_id: Option<String>,
}

impl ClaudeParser {
    fn remember_session(&mut self, session_id: Option<String>) {
        if let Some(sid) = session_id {
            self.sessions.insert(&self.gateway_id, &sid);
            self.native_id = Some(sid);
        }
    }
}

impl LineParser for ClaudeParser {
    fn parse_line(&mut self, line: &str) -> Vec<ChatChunk> {
        let event = match serde_json::from_str::<CliEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("[claude] Skipping unparseable line: {}", e);
                return Vec::new();
            }
        };

        match event {
            CliEvent::System(system) => {
                if system.subtype == "init" {
                    self.remember_session(system.session_id);
                }
                Vec::new()
            }
            CliEvent::Assistant(assistant) => assistant
                .message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        Some(ChatChunk::content(text))
                    }
                    _ => None,
                })
                .collect(),
            CliEvent::Result(result) => {
                if result.is_failure() {
                    let message = result
                        .error_message()
                        .unwrap_or_else(|| "Claude CLI returned an error".to_string());
                    return vec![ChatChunk::error(message)];
                }
                self.remember_session(result.session_id.clone());
                let usage = result.usage.as_ref().map(|u| u.to_canonical());
                vec![ChatChunk::done(usage, self.native_id.clone())]
            }
            CliEvent::User(_) | CliEvent::Unknown => Vec::new(),
        }
    }
}
