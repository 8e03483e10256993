//! Gemini CLI backend adapter.
//!
//! Gemini only emits `stream-json` when attached to a terminal, so each turn
//! runs inside a pseudo-terminal. The system prompt travels through a
//! temporary file named by `GEMINI_SYSTEM_MD`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

use super::events::{translate_event, GeminiEvent, MarkerFilter, Translated};
use crate::backends::native_sessions::NativeSessionCache;
use crate::backends::process::{
    check_cli_installed, cli_on_path, failed_run, spawn_pty, LineParser, ProcessSpec,
};
use crate::backends::prompt::build_prompt;
use crate::backends::types::{
    Backend, BackendKind, BackendRun, ChatChunk, InstallStatus, ModelInfo, SpawnRequest,
};
use crate::config::{backend_env, BackendConfig};

const DEFAULT_MODEL: &str = "gemini-2.5-pro";
const SYSTEM_PROMPT_ENV: &str = "GEMINI_SYSTEM_MD";

pub struct GeminiBackend {
    command: String,
    default_model: String,
    session_continuity: bool,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    sessions: Arc<NativeSessionCache>,
}

impl GeminiBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            command: config.command(BackendKind::Gemini),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            session_continuity: config.session_continuity,
            env: backend_env(BackendKind::Gemini, &config.env_allow),
            working_dir: config.working_dir.clone(),
            sessions: Arc::new(NativeSessionCache::new()),
        }
    }

    fn resume_session(&self, request: &SpawnRequest) -> Option<String> {
        if !self.session_continuity || request.is_new_conversation {
            return None;
        }
        let native = self.sessions.get(&request.session_id);
        if native.is_none() {
            log::info!(
                "gemini: no cached session for {}, sending transcript",
                request.session_id
            );
        }
        native
    }

    fn build_args(&self, request: &SpawnRequest, resume: Option<&str>) -> Vec<String> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            model,
        ];
        if request.tools_enabled {
            args.push("--yolo".to_string());
        } else {
            args.extend(["--approval-mode".to_string(), "default".to_string()]);
        }
        if let Some(session) = resume {
            args.extend(["--resume".to_string(), session.to_string()]);
        }
        args.extend([
            "--prompt".to_string(),
            build_prompt(&request.messages, resume.is_some()),
        ]);
        args
    }
}

/// Writes the system prompt to a file that is removed when dropped.
fn write_system_prompt(prompt: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("cligate-system-")
        .suffix(".md")
        .tempfile()?;
    file.write_all(prompt.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[async_trait]
impl Backend for GeminiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo::new(BackendKind::Gemini, "gemini-2.5-pro", "Gemini 2.5 Pro", "google"),
            ModelInfo::new(BackendKind::Gemini, "gemini-2.5-flash", "Gemini 2.5 Flash", "google"),
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
        let resume = self.resume_session(&request);

        let mut spec = ProcessSpec::new("gemini", self.command.clone());
        spec.args = self.build_args(&request, resume.as_deref());
        spec.env = self.env.clone();
        spec.cwd = self.working_dir.clone();

        if let Some(prompt) = &request.system_prompt {
            match write_system_prompt(prompt) {
                Ok(file) => {
                    spec.env.insert(
                        SYSTEM_PROMPT_ENV.to_string(),
                        file.path().display().to_string(),
                    );
                    spec.temp_files.push(file);
                }
                Err(e) => return failed_run("gemini", format!("system prompt file: {}", e)),
            }
        }

        log::info!(
            "gemini turn: session={} native={:?} model={}",
            request.session_id,
            resume,
            request.model
        );

        let parser = GeminiParser {
            gateway_id: request.session_id.clone(),
            sessions: Arc::clone(&self.sessions),
            native_id: resume,
            markers: MarkerFilter::new(),
        };
        spawn_pty(spec, Box::new(parser), &request.cancel)
    }
}

struct GeminiParser {
    gateway_id: String,
    sessions: Arc<NativeSessionCache>,
    native_id: Option<String>,
    markers: MarkerFilter,
}

impl LineParser for GeminiParser {
    fn parse_line(&mut self, line: &str) -> Vec<ChatChunk> {
        // The terminal echoes banners and prompts; only JSON objects are events.
        if !line.starts_with('{') {
            return Vec::new();
        }
        let event = match serde_json::from_str::<GeminiEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("[gemini] Skipping unparseable line: {}", e);
                return Vec::new();
            }
        };

        match translate_event(event, &mut self.markers) {
            Translated::Chunks(chunks) => chunks,
            Translated::SessionStarted(id) => {
                self.sessions.insert(&self.gateway_id, &id);
                self.native_id = Some(id);
                Vec::new()
            }
            Translated::Completed(usage) => {
                let mut chunks = self.markers.drain();
                chunks.push(ChatChunk::done(usage, self.native_id.clone()));
                chunks
            }
        }
    }
}
