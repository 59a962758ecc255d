//! Bounded cache of room codes that recently failed a student lookup.
//!
//! Bounded by wholesale clearing rather than per-entry eviction; the observable effect
//! is the same for repeat offenders, who just pay for one more registry lookup.

use std::collections::HashSet;
use tracing::debug;

#[derive(Debug)]
pub struct RejectedCodes {
    codes: HashSet<String>,
    max_entries: usize,
}

impl RejectedCodes {
    pub fn new(max_entries: usize) -> Self {
        Self {
            codes: HashSet::new(),
            max_entries,
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn insert(&mut self, code: &str) {
        if self.codes.len() >= self.max_entries {
            debug!(entries = self.codes.len(), "Rejected-code cache full, clearing");
            self.codes.clear();
        }
        self.codes.insert(code.to_string());
    }

    /// Forget a code, e.g. because a host has just opened a room under it.
    pub fn remove(&mut self, code: &str) -> bool {
        self.codes.remove(code)
    }

    /// Periodic cleanup: clears everything once the cache has grown past half its
    /// capacity. Returns the number of entries dropped.
    pub fn sweep(&mut self) -> usize {
        let len = self.codes.len();
        if len > self.max_entries / 2 {
            self.codes.clear();
            return len;
        }
        0
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_clears_when_full() {
        let mut cache = RejectedCodes::new(3);
        cache.insert("10000");
        cache.insert("10001");
        cache.insert("10002");
        assert_eq!(cache.len(), 3);

        cache.insert("10003");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("10003"));
        assert!(!cache.contains("10000"));
    }

    #[test]
    fn test_sweep_threshold() {
        let mut cache = RejectedCodes::new(10);
        for code in ["10000", "10001", "10002", "10003", "10004"] {
            cache.insert(code);
        }
        assert_eq!(cache.sweep(), 0);

        cache.insert("10005");
        assert_eq!(cache.sweep(), 6);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut cache = RejectedCodes::new(10);
        cache.insert("12345");
        assert!(cache.remove("12345"));
        assert!(!cache.contains("12345"));
    }
}
