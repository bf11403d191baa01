//! Time-bounded set of recently seen handshake keys

use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Rejects a key presented twice within the TTL window.
///
/// Expired entries are swept before every check.
#[derive(Debug)]
pub struct ReplayCache {
    items: DashMap<Vec<u8>, i64>,
    ttl_secs: i64,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: DashMap::new(),
            ttl_secs: ttl.as_secs() as i64,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Record `key`; returns false when it was already seen within the TTL
    pub fn check(&self, key: &[u8]) -> bool {
        self.check_at(key, chrono::Utc::now().timestamp())
    }

    /// [`check`](Self::check) with an explicit clock, in Unix seconds
    pub fn check_at(&self, key: &[u8], now: i64) -> bool {
        let expire_before = now - self.ttl_secs;
        self.items.retain(|_, seen| *seen >= expire_before);

        match self.items.entry(key.to_vec()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("Replayed handshake key rejected");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_ttl_rejected() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        assert!(cache.check_at(b"mac-1", 1000));
        assert!(!cache.check_at(b"mac-1", 1010));
        assert!(cache.check_at(b"mac-2", 1010));
    }

    #[test]
    fn test_expired_entry_is_swept() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        assert!(cache.check_at(b"mac-1", 1000));
        assert!(cache.check_at(b"other", 1031));
        assert_eq!(cache.len(), 1);
        assert!(cache.check_at(b"mac-1", 1031));
    }

    #[test]
    fn test_boundary_is_still_live() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        assert!(cache.check_at(b"k", 1000));
        assert!(!cache.check_at(b"k", 1030));
    }

    #[test]
    fn test_concurrent_checks_admit_one() {
        use std::sync::Arc;

        let cache = Arc::new(ReplayCache::new(Duration::from_secs(30)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.check_at(b"same", 5000))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
