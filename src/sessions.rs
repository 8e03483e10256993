//! Gateway-level session identity and the TTL-bounded session store.
//!
//! A session id either comes from the client or is derived from the first
//! turn's content, so a client that replays its history lands on the same id
//! without storing anything. The store only remembers which ids are live and
//! which backend they belong to; conversation content stays with the tools.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backends::BackendKind;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {session_id} belongs to backend {existing}, not {requested}")]
    BackendMismatch {
        session_id: String,
        existing: BackendKind,
        requested: BackendKind,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn uuid_from_parts(parts: &[&str]) -> Uuid {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Returns `explicit` verbatim when given; otherwise derives a stable,
/// UUID-shaped id from the system prompt and the first user message.
pub fn resolve_session_id(
    explicit: Option<&str>,
    system_prompt: Option<&str>,
    first_user_message: &str,
) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    uuid_from_parts(&[system_prompt.unwrap_or_default(), first_user_message]).to_string()
}

/// UUID form of a gateway session id, for tools that only accept UUIDs.
///
/// A UUID is returned in canonical form; anything else is hashed.
pub fn session_uuid(session_id: &str) -> String {
    match Uuid::parse_str(session_id) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => uuid_from_parts(&[session_id]).to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    sessions: Vec<SessionEntry>,
}

/// Shared, TTL-bounded map of live sessions.
pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            path: None,
        }
    }

    /// Store backed by `path`. Existing, unexpired entries are loaded; a missing file is fine.
    pub fn with_persistence(ttl: Duration, path: PathBuf) -> Result<Self, SessionError> {
        let store = Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            path: Some(path.clone()),
        };
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: SessionFile = serde_json::from_str(&content)?;
            let mut entries = store.entries.write();
            for entry in file.sessions {
                entries.insert(entry.session_id.clone(), entry);
            }
            drop(entries);
            let expired = store.prune_expired();
            log::info!(
                "Loaded {} sessions from {} ({} expired)",
                store.len(),
                path.display(),
                expired
            );
        }
        Ok(store)
    }

    fn is_expired(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        (now - entry.last_used).to_std().unwrap_or_default() > self.ttl
    }

    /// Live entry for `session_id`, if any.
    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        let now = Utc::now();
        self.entries
            .read()
            .get(session_id)
            .filter(|entry| !self.is_expired(entry, now))
            .cloned()
    }

    /// True when no live entry exists. Message count plays no part.
    pub fn is_new_conversation(&self, session_id: &str) -> bool {
        self.get(session_id).is_none()
    }

    /// Fails if a live entry for `session_id` belongs to another backend.
    pub fn check_backend(&self, session_id: &str, backend: BackendKind) -> Result<(), SessionError> {
        match self.get(session_id) {
            Some(entry) if entry.backend != backend => Err(SessionError::BackendMismatch {
                session_id: session_id.to_string(),
                existing: entry.backend,
                requested: backend,
            }),
            _ => Ok(()),
        }
    }

    /// Upserts a session after a completed turn.
    ///
    /// `created_at` is set on first write only. An expired entry is replaced
    /// outright; a live entry for a different backend is left untouched.
    pub fn track_session(
        &self,
        session_id: &str,
        backend: BackendKind,
        message_count: usize,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let live = entries
            .get(session_id)
            .filter(|entry| !self.is_expired(entry, now))
            .cloned();

        match live {
            Some(existing) if existing.backend != backend => Err(SessionError::BackendMismatch {
                session_id: session_id.to_string(),
                existing: existing.backend,
                requested: backend,
            }),
            Some(existing) => {
                entries.insert(
                    session_id.to_string(),
                    SessionEntry {
                        last_used: now,
                        message_count,
                        ..existing
                    },
                );
                Ok(())
            }
            None => {
                log::debug!("New session {} on {}", session_id, backend);
                entries.insert(
                    session_id.to_string(),
                    SessionEntry {
                        session_id: session_id.to_string(),
                        backend,
                        created_at: now,
                        last_used: now,
                        message_count,
                    },
                );
                Ok(())
            }
        }
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes the store to its file, if it has one.
    pub fn flush(&self) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut sessions: Vec<SessionEntry> = self.entries.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        save_file(path, &SessionFile { sessions })
    }

    /// Runs [`flush`](Self::flush) on the blocking pool so file IO never stalls a runtime worker.
    pub async fn persist(self: Arc<Self>) -> Result<(), SessionError> {
        if self.path.is_none() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || self.flush())
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?
    }

    /// Prunes on a fixed interval until `shutdown` fires, persisting after each sweep.
    pub fn spawn_pruner(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = self.prune_expired();
                if removed > 0 {
                    log::info!("Pruned {} expired sessions", removed);
                }
                if let Err(e) = Arc::clone(&self).persist().await {
                    log::warn!("Failed to persist sessions: {}", e);
                }
            }
        })
    }
}

fn save_file(path: &Path, data: &SessionFile) -> Result<(), SessionError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let content = serde_json::to_string_pretty(data)?;

    // Write to temp file, then atomic rename
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.persist(path).map_err(|e| SessionError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn age(store: &SessionStore, session_id: &str, by: chrono::Duration) {
        let mut entries = store.entries.write();
        let entry = entries.get_mut(session_id).unwrap();
        entry.last_used = entry.last_used - by;
    }

    #[test]
    fn explicit_id_short_circuits() {
        assert_eq!(resolve_session_id(Some("abc"), Some("sys"), "hi"), "abc");
        assert_eq!(resolve_session_id(Some("abc"), None, "other"), "abc");
    }

    #[test]
    fn derived_id_is_stable_and_uuid_shaped() {
        let a = resolve_session_id(None, Some("Be terse."), "2+2?");
        let b = resolve_session_id(None, Some("Be terse."), "2+2?");
        assert_eq!(a, b);

        let parsed = Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);

        assert_ne!(a, resolve_session_id(None, Some("Be verbose."), "2+2?"));
        assert_ne!(a, resolve_session_id(None, Some("Be terse."), "3+3?"));
        assert_eq!(
            resolve_session_id(None, None, "hi"),
            resolve_session_id(None, Some(""), "hi")
        );
    }

    #[test]
    fn session_uuid_normalizes_or_hashes() {
        assert_eq!(
            session_uuid("5F0C6A52-7C1E-4B55-9A51-8D2C1C1F8E10"),
            "5f0c6a52-7c1e-4b55-9a51-8d2c1c1f8e10"
        );
        let hashed = session_uuid("my-chat");
        assert!(Uuid::parse_str(&hashed).is_ok());
        assert_eq!(hashed, session_uuid("my-chat"));
    }

    #[test]
    fn tracking_ends_newness() {
        let store = SessionStore::new(DAY);
        assert!(store.is_new_conversation("s1"));
        store.track_session("s1", BackendKind::Claude, 2).unwrap();
        assert!(!store.is_new_conversation("s1"));
        assert_eq!(store.get("s1").unwrap().message_count, 2);
    }

    #[test]
    fn expired_entry_counts_as_new() {
        let store = SessionStore::new(DAY);
        store.track_session("s1", BackendKind::Claude, 2).unwrap();
        age(&store, "s1", chrono::Duration::hours(25));
        assert!(store.is_new_conversation("s1"));
    }

    #[test]
    fn upsert_preserves_created_at() {
        let store = SessionStore::new(DAY);
        store.track_session("s1", BackendKind::Codex, 2).unwrap();
        let first = store.get("s1").unwrap();
        age(&store, "s1", chrono::Duration::minutes(5));

        store.track_session("s1", BackendKind::Codex, 4).unwrap();
        let second = store.get("s1").unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_used >= first.last_used);
        assert_eq!(second.message_count, 4);
    }

    #[test]
    fn backend_switch_is_rejected_while_live() {
        let store = SessionStore::new(DAY);
        store.track_session("s1", BackendKind::Claude, 2).unwrap();
        assert!(store.check_backend("s1", BackendKind::Claude).is_ok());
        assert!(matches!(
            store.check_backend("s1", BackendKind::Gemini),
            Err(SessionError::BackendMismatch { existing: BackendKind::Claude, .. })
        ));
        assert!(store.track_session("s1", BackendKind::Gemini, 4).is_err());
        assert_eq!(store.get("s1").unwrap().backend, BackendKind::Claude);

        age(&store, "s1", chrono::Duration::days(2));
        assert!(store.check_backend("s1", BackendKind::Gemini).is_ok());
        store.track_session("s1", BackendKind::Gemini, 2).unwrap();
        assert_eq!(store.get("s1").unwrap().backend, BackendKind::Gemini);
    }

    #[test]
    fn prune_is_idempotent() {
        let store = SessionStore::new(DAY);
        for id in ["a", "b", "c"] {
            store.track_session(id, BackendKind::Claude, 2).unwrap();
        }
        age(&store, "a", chrono::Duration::days(2));
        age(&store, "c", chrono::Duration::days(3));

        assert_eq!(store.prune_expired(), 2);
        assert_eq!(store.prune_expired(), 0);
        assert_eq!(store.len(), 1);
        assert!(!store.is_new_conversation("b"));
    }

    #[test]
    fn concurrent_tracking_is_safe() {
        let store = Arc::new(SessionStore::new(DAY));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        store
                            .track_session(&format!("s{}", i % 4), BackendKind::Codex, n)
                            .unwrap();
                        store.is_new_conversation("s0");
                        store.prune_expired();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn persistence_round_trips_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let store = SessionStore::with_persistence(DAY, path.clone()).unwrap();
        store.track_session("keep", BackendKind::Gemini, 3).unwrap();
        store.track_session("drop", BackendKind::Claude, 1).unwrap();
        age(&store, "drop", chrono::Duration::days(2));
        store.flush().unwrap();

        let reloaded = SessionStore::with_persistence(DAY, path).unwrap();
        assert_eq!(reloaded.len(), 1);
        let entry = reloaded.get("keep").unwrap();
        assert_eq!(entry.backend, BackendKind::Gemini);
        assert_eq!(entry.message_count, 3);
    }

    #[test]
    fn flush_without_path_is_a_no_op() {
        let store = SessionStore::new(DAY);
        store.track_session("s1", BackendKind::Claude, 1).unwrap();
        store.flush().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_sweeps_until_shutdown() {
        let store = Arc::new(SessionStore::new(DAY));
        store.track_session("old", BackendKind::Claude, 1).unwrap();
        age(&store, "old", chrono::Duration::days(2));

        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&store).spawn_pruner(Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_writes_the_swept_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = Arc::new(SessionStore::with_persistence(DAY, path.clone()).unwrap());
        store.track_session("live", BackendKind::Codex, 2).unwrap();
        store.track_session("old", BackendKind::Claude, 1).unwrap();
        age(&store, "old", chrono::Duration::days(2));

        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&store).spawn_pruner(Duration::from_secs(60), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let saved: SessionFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let ids: Vec<&str> = saved.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["live"]);
    }

    #[tokio::test]
    async fn persist_without_path_is_a_no_op() {
        let store = Arc::new(SessionStore::new(DAY));
        store.track_session("s1", BackendKind::Claude, 1).unwrap();
        store.persist().await.unwrap();
    }
}
