use rq_lib::path;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct ListCacheEntry {
    fetched_at: Instant,
    names: Vec<String>,
}

/// Short-TTL cache of remote folder listings, keyed by parent path. Entries
/// are rehydrated by the overlay via `open` on each name, so only the name
/// set is cached.
pub struct ContentListCache {
    ttl: Duration,
    map: Mutex<HashMap<String, ListCacheEntry>>,
}

impl ContentListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, parent: &str) -> Option<Vec<String>> {
        let mut map = self.map.lock().unwrap();
        match map.get(parent) {
            Some(entry) if entry.fetched_at.elapsed() <= self.ttl => Some(entry.names.clone()),
            Some(_) => {
                map.remove(parent);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, parent: &str, names: Vec<String>) {
        self.map.lock().unwrap().insert(
            parent.to_string(),
            ListCacheEntry {
                fetched_at: Instant::now(),
                names,
            },
        );
    }

    /// Drops the entry for `tree_path`; with `deep`, also every descendant
    /// entry.
    pub fn invalidate(&self, tree_path: &str, deep: bool) {
        let mut map = self.map.lock().unwrap();
        map.remove(tree_path);
        if deep {
            map.retain(|k, _| !path::is_descendant(tree_path, k));
        }
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache = ContentListCache::new(Duration::from_secs(30));
        cache.put("/a", vec!["x".into(), "y".into()]);
        assert_eq!(cache.get("/a").unwrap(), vec!["x", "y"]);
        assert!(cache.get("/b").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = ContentListCache::new(Duration::from_millis(10));
        cache.put("/a", vec!["x".into()]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("/a").is_none());
    }

    #[test]
    fn test_invalidate_shallow_and_deep() {
        let cache = ContentListCache::new(Duration::from_secs(30));
        cache.put("/a", vec![]);
        cache.put("/a/b", vec![]);
        cache.put("/a/b/c", vec![]);
        cache.put("/ab", vec![]);

        cache.invalidate("/a", false);
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/a/b").is_some());

        cache.put("/a", vec![]);
        cache.invalidate("/a", true);
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/a/b").is_none());
        assert!(cache.get("/a/b/c").is_none());
        // Sibling with a shared name prefix survives.
        assert!(cache.get("/ab").is_some());
    }
}
