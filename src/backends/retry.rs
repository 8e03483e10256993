//! Transparent retry for tools that fail transiently before producing output.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::bridge::OutputBridge;
use super::types::{
    Backend, BackendKind, BackendRun, ChatChunk, InstallStatus, ModelInfo, SpawnRequest,
};

/// Wraps a backend and re-runs a turn whose attempt fails before any content
/// reached the consumer.
///
/// The consumer never sees a failed attempt or the backoff between attempts.
/// Once content has been delivered, errors pass through and are never retried.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        self.inner.list_models()
    }

    fn default_model(&self) -> String {
        self.inner.default_model()
    }

    async fn check_installed(&self) -> InstallStatus {
        self.inner.check_installed().await
    }

    fn detect(&self) -> bool {
        self.inner.detect()
    }

    fn run(&self, request: SpawnRequest) -> BackendRun {
        let bridge = OutputBridge::new();
        let kill = request.cancel.child_token();
        tokio::spawn(drive_attempts(
            Arc::clone(&self.inner),
            request,
            bridge.clone(),
            kill.clone(),
            self.max_retries,
            self.base_delay,
        ));
        BackendRun::new(bridge.into_stream(), kill)
    }
}

enum AttemptEnd {
    Failed(String),
    /// The attempt's sequence ended without a terminal chunk.
    Ended,
    Cancelled,
}

fn annotate(message: String, attempts: u32) -> String {
    if attempts == 1 {
        format!("{} (after 1 attempt)", message)
    } else {
        format!("{} (after {} attempts)", message, attempts)
    }
}

async fn drive_attempts(
    inner: Arc<dyn Backend>,
    request: SpawnRequest,
    bridge: OutputBridge,
    kill: CancellationToken,
    max_retries: u32,
    base_delay: Duration,
) {
    let kind = inner.kind();
    let mut delivered = false;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let (mut events, attempt_kill) = inner.run(request.with_cancel(kill.child_token())).into_parts();

        let end = loop {
            let next = tokio::select! {
                _ = kill.cancelled() => break AttemptEnd::Cancelled,
                next = events.next() => next,
            };
            match next {
                Some(chunk @ ChatChunk::Content { .. }) => {
                    delivered = true;
                    bridge.push(chunk);
                }
                Some(chunk @ ChatChunk::Done { .. }) => {
                    bridge.push(chunk);
                    bridge.finish();
                    return;
                }
                Some(ChatChunk::Error { message }) => break AttemptEnd::Failed(message),
                None => break AttemptEnd::Ended,
            }
        };

        let message = match end {
            AttemptEnd::Failed(message) => message,
            AttemptEnd::Ended | AttemptEnd::Cancelled => {
                attempt_kill.cancel();
                bridge.close();
                return;
            }
        };
        attempt_kill.cancel();

        if delivered || attempt > max_retries || kill.is_cancelled() {
            bridge.push(ChatChunk::error(annotate(message, attempt)));
            bridge.finish();
            return;
        }

        let delay = base_delay * attempt;
        log::warn!(
            "{} attempt {}/{} failed before output: {}; retrying in {:?}",
            kind,
            attempt,
            max_retries + 1,
            message,
            delay
        );
        tokio::select! {
            _ = kill.cancelled() => {
                bridge.close();
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
