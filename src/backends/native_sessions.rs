//! Adapter-local map from gateway session id to a tool's own conversation id.
//!
//! This is a cache, not a source of truth: losing an entry only turns the next
//! continuation into a fresh conversation.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct NativeSessionCache {
    entries: Mutex<HashMap<String, String>>,
}

impl NativeSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, gateway_id: &str) -> Option<String> {
        self.entries.lock().get(gateway_id).cloned()
    }

    pub fn insert(&self, gateway_id: &str, native_id: &str) {
        let previous = self
            .entries
            .lock()
            .insert(gateway_id.to_string(), native_id.to_string());
        if previous.as_deref() != Some(native_id) {
            log::debug!("Native session for {}: {}", gateway_id, native_id);
        }
    }

    pub fn contains(&self, gateway_id: &str) -> bool {
        self.entries.lock().contains_key(gateway_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stores_latest_native_id() {
        let cache = NativeSessionCache::new();
        assert!(cache.get("s1").is_none());
        cache.insert("s1", "thread-a");
        cache.insert("s1", "thread-b");
        assert_eq!(cache.get("s1").as_deref(), Some("thread-b"));
        assert!(cache.contains("s1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn separate_instances_do_not_share_entries() {
        let a = NativeSessionCache::new();
        let b = NativeSessionCache::new();
        a.insert("s1", "x");
        assert!(b.is_empty());
    }

    #[test]
    fn concurrent_writers_to_distinct_ids() {
        let cache = Arc::new(NativeSessionCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.insert(&format!("s{i}"), &format!("n{i}")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
    }
}
