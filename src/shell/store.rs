// shell/store.rs
use super::Asset;
use dashmap::DashMap;

/// Named generations of cached shell assets, keyed by request URL.
#[derive(Default)]
pub struct CacheStorage {
    buckets: DashMap<String, DashMap<String, Asset>>,
}

impl CacheStorage {
    pub fn open(&self, generation: &str) {
        self.buckets.entry(generation.to_string()).or_default();
    }

    pub fn put(&self, generation: &str, key: &str, asset: Asset) {
        self.buckets
            .entry(generation.to_string())
            .or_default()
            .insert(key.to_string(), asset);
    }

    pub fn lookup(&self, generation: &str, key: &str) -> Option<Asset> {
        self.buckets
            .get(generation)
            .and_then(|bucket| bucket.get(key).map(|asset| asset.value().clone()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.iter().map(|b| b.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn delete(&self, generation: &str) -> bool {
        self.buckets.remove(generation).is_some()
    }

    pub fn len(&self, generation: &str) -> usize {
        self.buckets.get(generation).map_or(0, |bucket| bucket.len())
    }
}
