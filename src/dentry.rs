//! Dentry cache: absolute path -> inode number, with negative entries for
//! lookups that found nothing. Advisory only; a miss falls back to the
//! directory walk, and namespace mutations invalidate by path prefix.

use std::collections::HashMap;

#[derive(Default, Debug)]
pub struct DentryCache {
    // None records a negative lookup
    entries: HashMap<String, Option<u32>>,
}

impl DentryCache {
    pub fn new() -> Self {
        DentryCache {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: &str, ino: u32) {
        self.entries.insert(path.to_string(), Some(ino));
    }

    pub fn insert_negative(&mut self, path: &str) {
        self.entries.insert(path.to_string(), None);
    }

    /// Outer `None` = miss; `Some(None)` = cached negative result.
    pub fn lookup(&self, path: &str) -> Option<Option<u32>> {
        self.entries.get(path).copied()
    }

    pub fn invalidate(&mut self, path: &str) {
        self.entries.remove(path);
    }

    /// Drop `dir_path` and every path beneath it. Called for any mutation of
    /// `dir_path`'s entries so stale hits are impossible.
    pub fn invalidate_prefix(&mut self, dir_path: &str) {
        let prefix = if dir_path.ends_with('/') {
            dir_path.to_string()
        } else {
            format!("{dir_path}/")
        };
        self.entries
            .retain(|path, _| path != dir_path && !path.starts_with(&prefix));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_and_negative_entries() {
        let mut cache = DentryCache::new();
        cache.insert("/a/b", 7);
        cache.insert_negative("/a/missing");

        assert_eq!(cache.lookup("/a/b"), Some(Some(7)));
        assert_eq!(cache.lookup("/a/missing"), Some(None));
        assert_eq!(cache.lookup("/nope"), None);
    }

    #[test]
    fn test_prefix_invalidation() {
        let mut cache = DentryCache::new();
        cache.insert("/d", 2);
        cache.insert("/d/x", 3);
        cache.insert("/d/x/y", 4);
        cache.insert("/data", 5); // shares a string prefix, not a path prefix

        cache.invalidate_prefix("/d");
        assert_eq!(cache.lookup("/d"), None);
        assert_eq!(cache.lookup("/d/x"), None);
        assert_eq!(cache.lookup("/d/x/y"), None);
        assert_eq!(cache.lookup("/data"), Some(Some(5)));
    }

    #[test]
    fn test_root_prefix_invalidation_drops_everything() {
        let mut cache = DentryCache::new();
        cache.insert("/a", 2);
        cache.insert("/b/c", 3);
        cache.invalidate_prefix("/");
        assert_eq!(cache.lookup("/a"), None);
        assert_eq!(cache.lookup("/b/c"), None);
    }
}
