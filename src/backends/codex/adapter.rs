use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::events::{translate_event, CodexEvent, Translated};
use crate::backends::native_sessions::NativeSessionCache;
use crate::backends::process::{check_cli_installed, cli_on_path, spawn_piped, LineParser, ProcessSpec};
use crate::backends::prompt::build_prompt;
use crate::backends::types::{
    Backend, BackendKind, BackendRun, ChatChunk, InstallStatus, ModelInfo, SpawnRequest,
};
use crate::config::{backend_env, BackendConfig};

const DEFAULT_MODEL: &str = "gpt-5-codex";

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Drives `codex exec --json`, one process per turn.
///
/// Codex issues its own thread ids, so continuation depends on the thread id
/// cached from an earlier turn's `thread.started` event.
pub struct CodexBackend {
    command: String,
    default_model: String,
    session_continuity: bool,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    threads: Arc<NativeSessionCache>,
}

impl CodexBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            command: config.command(BackendKind::Codex),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            session_continuity: config.session_continuity,
            env: backend_env(BackendKind::Codex, &config.env_allow),
            working_dir: config.working_dir.clone(),
            threads: Arc::new(NativeSessionCache::new()),
        }
    }

    /// Thread to resume, if this is a continuation and a thread id was cached.
    fn resume_thread(&self, request: &SpawnRequest) -> Option<String> {
        if !self.session_continuity || request.is_new_conversation {
            return None;
        }
        let thread = self.threads.get(&request.session_id);
        if thread.is_none() {
            log::info!(
                "codex: no cached thread for session {}, starting fresh",
                request.session_id
            );
        }
        thread
    }

    fn sandbox_args(tools_enabled: bool) -> Vec<String> {
        if tools_enabled {
            vec!["--dangerously-bypass-approvals-and-sandbox".to_string()]
        } else {
            vec!["--sandbox".to_string(), "read-only".to_string()]
        }
    }

    fn build_args(&self, request: &SpawnRequest, resume_thread: Option<&str>) -> Vec<String> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
            "--model".to_string(),
            model,
        ];
        args.extend(Self::sandbox_args(request.tools_enabled));

        if let Some(system_prompt) = &request.system_prompt {
            // `-c` values are TOML; a JSON string literal is a valid TOML basic string.
            let value = serde_json::Value::String(system_prompt.clone()).to_string();
            args.extend(["-c".to_string(), format!("developer_instructions={}", value)]);
        }

        if let Some(thread_id) = resume_thread {
            args.extend(["resume".to_string(), thread_id.to_string()]);
        }
        args.push(build_prompt(&request.messages, resume_thread.is_some()));
        args
    }
}

#[async_trait]
impl Backend for CodexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo::new(BackendKind::Codex, "gpt-5-codex", "GPT-5 Codex", "openai"),
            ModelInfo::new(BackendKind::Codex, "gpt-5", "GPT-5", "openai"),
            ModelInfo::new(BackendKind::Codex, "gpt-5-codex-mini", "GPT-5 Codex Mini", "openai"),
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
        let resume_thread = self.resume_thread(&request);

        let mut spec = ProcessSpec::new("codex", self.command.clone());
        spec.args = self.build_args(&request, resume_thread.as_deref());
        spec.env = self.env.clone();
        spec.cwd = self.working_dir.clone();

        log::info!(
            "codex turn: session={} thread={:?} model={}",
            request.session_id,
            resume_thread,
            request.model
        );

        let parser = CodexParser {
            gateway_id: request.session_id.clone(),
            threads: Arc::clone(&self.threads),
            thread_id: resume_thread,
        };
        spawn_piped(spec, Box::new(parser), &request.cancel)
    }
}

// ---------------------------------------------------------------------------
// Stdout parser
// ---------------------------------------------------------------------------

struct CodexParser {
    gateway_id: String,
    threads: Arc<NativeSessionCache>,
    thread_id: Option<String>,
}

impl LineParser for CodexParser {
    fn parse_line(&mut self, line: &str) -> Vec<ChatChunk> {
        let event = match serde_json::from_str::<CodexEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("[codex] Skipping unparseable line: {}", e);
                return Vec::new();
            }
        };

        match translate_event(event) {
            Translated::Chunks(chunks) => chunks,
            Translated::ThreadStarted(thread_id) => {
                self.threads.insert(&self.gateway_id, &thread_id);
                self.thread_id = Some(thread_id);
                Vec::new()
            }
            Translated::Completed(usage) => vec![ChatChunk::done(usage, self.thread_id.clone())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::types::{ChatMessage, UsageInfo};

    fn backend() -> CodexBackend {
        CodexBackend::new(&BackendConfig::default())
    }

    fn request(is_new: bool) -> SpawnRequest {
        let mut request = SpawnRequest::new(
            "gpt-5",
            vec![
                ChatMessage::new("user", "2+2?"),
                ChatMessage::new("assistant", "4"),
                ChatMessage::new("user", "and 3+3?"),
            ],
            "sess-1",
        );
        request.is_new_conversation = is_new;
        request
    }

    #[test]
    fn models_are_prefixed() {
        let backend = backend();
        assert_eq!(backend.kind(), BackendKind::Codex);
        assert!(backend.list_models().iter().all(|m| m.id.starts_with("codex/")));
        assert_eq!(backend.default_model(), "gpt-5-codex");
    }

    #[test]
    fn continuation_without_cached_thread_degrades_to_fresh() {
        let backend = backend();
        let request = request(false);
        assert!(backend.resume_thread(&request).is_none());
        let args = backend.build_args(&request, None);
        assert!(!args.contains(&"resume".to_string()));
        assert!(args.last().unwrap().starts_with("<user>"));
    }

    #[test]
    fn continuation_with_cached_thread_resumes() {
        let backend = backend();
        backend.threads.insert("sess-1", "th_42");
        let request = request(false);
        let thread = backend.resume_thread(&request);
        assert_eq!(thread.as_deref(), Some("th_42"));

        let args = backend.build_args(&request, thread.as_deref());
        let pos = args.iter().position(|a| a == "resume").unwrap();
        assert_eq!(args[pos + 1], "th_42");
        assert_eq!(args.last().map(String::as_str), Some("and 3+3?"));
    }

    #[test]
    fn new_conversation_ignores_cached_thread() {
        let backend = backend();
        backend.threads.insert("sess-1", "th_42");
        assert!(backend.resume_thread(&request(true)).is_none());
    }

    #[test]
    fn sandbox_mapping() {
        assert_eq!(CodexBackend::sandbox_args(false), vec!["--sandbox", "read-only"]);
        assert_eq!(
            CodexBackend::sandbox_args(true),
            vec!["--dangerously-bypass-approvals-and-sandbox"]
        );
    }

    #[test]
    fn system_prompt_is_passed_as_toml_string() {
        let backend = backend();
        let mut request = request(true);
        request.system_prompt = Some("Say \"hi\"\nthen stop".to_string());
        let args = backend.build_args(&request, None);
        assert!(args.contains(&r#"developer_instructions="Say \"hi\"\nthen stop""#.to_string()));
    }

    #[test]
    fn parser_caches_thread_and_reports_it_on_done() {
        let threads = Arc::new(NativeSessionCache::new());
        let mut parser = CodexParser {
            gateway_id: "sess-9".to_string(),
            threads: Arc::clone(&threads),
            thread_id: None,
        };

        assert!(parser
            .parse_line(r#"{"type":"thread.started","thread_id":"th_9"}"#)
            .is_empty());
        assert_eq!(threads.get("sess-9").as_deref(), Some("th_9"));

        assert!(parser.parse_line("{not json").is_empty());
        assert_eq!(
            parser.parse_line(r#"{"type":"item.completed","item":{"id":"a","type":"agent_message","text":"hi"}}"#),
            vec![ChatChunk::content("hi")]
        );
        assert_eq!(
            parser.parse_line(r#"{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":1}}"#),
            vec![ChatChunk::done(Some(UsageInfo::new(5, 1, None)), Some("th_9".to_string()))]
        );
    }
}
