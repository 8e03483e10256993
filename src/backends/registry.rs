//! Backend registry: which tools are available and how model names route to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::claude::ClaudeCliBackend;
use super::codex::CodexBackend;
use super::gemini::GeminiBackend;
use super::retry::RetryingBackend;
use super::types::{Backend, BackendKind, ModelInfo};
use crate::config::{BackendConfig, GatewayConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Backend {0} is not available")]
    Unavailable(BackendKind),
}

struct Registered {
    backend: Arc<dyn Backend>,
    tools_enabled: bool,
}

/// Registry of available backends, keyed by kind.
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Registered>,
    default: BackendKind,
}

impl BackendRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default: BackendKind::Claude,
        }
    }

    /// Builds the adapter for `kind`, wrapped in retry when configured.
    pub fn build_backend(kind: BackendKind, config: &BackendConfig) -> Arc<dyn Backend> {
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Claude => Arc::new(ClaudeCliBackend::new(config)),
            BackendKind::Codex => Arc::new(CodexBackend::new(config)),
            BackendKind::Gemini => Arc::new(GeminiBackend::new(config)),
        };
        let retries = config.max_retries(kind);
        if retries == 0 {
            return backend;
        }
        Arc::new(RetryingBackend::new(
            backend,
            retries,
            Duration::from_millis(config.retry_delay_ms),
        ))
    }

    /// Registers every enabled backend whose CLI is found on this machine.
    ///
    /// A missing tool is logged and skipped; it never fails startup.
    pub async fn detect(config: &GatewayConfig) -> Self {
        let mut registry = Self::new();
        for kind in BackendKind::ALL {
            let backend_config = config.backend(kind);
            if !backend_config.enabled {
                log::info!("{} backend disabled by config", kind);
                continue;
            }
            let backend = Self::build_backend(kind, &backend_config);
            if !backend.detect() {
                log::warn!(
                    "{} CLI not found ({}), backend unavailable",
                    kind,
                    backend_config.command(kind)
                );
                continue;
            }
            let status = backend.check_installed().await;
            log::info!(
                "{} backend ready: path={} version={}",
                kind,
                status.path.as_deref().unwrap_or("?"),
                status.version.as_deref().unwrap_or("unknown")
            );
            registry.register(backend, backend_config.tools_enabled);
        }

        if let Some(first) = BackendKind::ALL
            .into_iter()
            .find(|kind| registry.backends.contains_key(kind))
        {
            registry.set_default(first);
        }
        registry
    }

    /// Registers a backend.
    pub fn register(&mut self, backend: Arc<dyn Backend>, tools_enabled: bool) {
        self.backends.insert(
            backend.kind(),
            Registered {
                backend,
                tools_enabled,
            },
        );
    }

    /// Gets a backend by kind.
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).map(|r| Arc::clone(&r.backend))
    }

    pub fn tools_enabled(&self, kind: BackendKind) -> bool {
        self.backends.get(&kind).is_some_and(|r| r.tools_enabled)
    }

    pub fn set_default(&mut self, kind: BackendKind) {
        self.default = kind;
    }

    /// Returns all registered backend kinds, in a stable order.
    pub fn available_backends(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.backends.contains_key(kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Models of every registered backend.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.available_backends()
            .into_iter()
            .filter_map(|kind| self.get(kind))
            .flat_map(|backend| backend.list_models())
            .collect()
    }

    /// Routes a model string to a backend and the tool-level model name.
    ///
    /// Accepts `backend/model`, a bare backend id (its default model), a bare
    /// model id listed by some backend, or an empty string (default backend).
    pub fn resolve(&self, model: &str) -> Result<(Arc<dyn Backend>, String), RouteError> {
        let model = model.trim();

        if model.is_empty() {
            let backend = self
                .get(self.default)
                .ok_or(RouteError::Unavailable(self.default))?;
            let default_model = backend.default_model();
            return Ok((backend, default_model));
        }

        if let Some((prefix, name)) = model.split_once('/') {
            if let Ok(kind) = prefix.parse::<BackendKind>() {
                let backend = self.get(kind).ok_or(RouteError::Unavailable(kind))?;
                let name = if name.is_empty() {
                    backend.default_model()
                } else {
                    name.to_string()
                };
                return Ok((backend, name));
            }
        }

        if let Ok(kind) = model.parse::<BackendKind>() {
            let backend = self.get(kind).ok_or(RouteError::Unavailable(kind))?;
            let default_model = backend.default_model();
            return Ok((backend, default_model));
        }

        for kind in self.available_backends() {
            let Some(backend) = self.get(kind) else {
                continue;
            };
            let listed = backend
                .list_models()
                .iter()
                .any(|info| info.id.split_once('/').map(|(_, m)| m) == Some(model));
            if listed {
                return Ok((backend, model.to_string()));
            }
        }

        Err(RouteError::UnknownModel(model.to_string()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
