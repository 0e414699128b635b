use bifrost_common::model::CachedModule;
use dashmap::DashMap;

/// Fast key→(content, hash) cache with invalidation (C3). Must be coherent
/// with the text index: after a successful `put+upsert`, the cache
/// reflects the new bytes before the write call returns.
pub trait ModuleCache: Send + Sync {
    fn set(&self, path: &str, content: Vec<u8>, content_hash: String);
    fn get(&self, path: &str) -> Option<CachedModule>;
    fn invalidate(&self, path: &str);
}

#[derive(Default)]
pub struct InMemoryModuleCache {
    entries: DashMap<String, CachedModule>,
}

impl InMemoryModuleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModuleCache for InMemoryModuleCache {
    fn set(&self, path: &str, content: Vec<u8>, content_hash: String) {
        self.entries
            .insert(path.to_string(), CachedModule { content, content_hash });
    }

    fn get(&self, path: &str) -> Option<CachedModule> {
        self.entries.get(path).map(|entry| entry.clone())
    }

    fn invalidate(&self, path: &str) {
        self.entries.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_is_coherent() {
        let cache = InMemoryModuleCache::new();
        cache.set("wf/a.py", b"code".to_vec(), "hash1".to_string());
        let module = cache.get("wf/a.py").unwrap();
        assert_eq!(module.content, b"code");
        assert_eq!(module.content_hash, "hash1");
    }

    #[test]
    fn invalidate_clears_entry() {
        let cache = InMemoryModuleCache::new();
        cache.set("wf/a.py", b"code".to_vec(), "hash1".to_string());
        cache.invalidate("wf/a.py");
        assert!(cache.get("wf/a.py").is_none());
    }
}
