use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

#[derive(Clone)]
struct MemoryEntry {
    data: Bytes,
    expires_at: Option<i64>,
}

/// Local Store の前段に置く読み出しアクセラレータ。
/// 正本は常にストア側にあり、ここは再構築可能なコピーしか持たない。
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 期限内のエントリのみ返す。期限切れはその場で落とす。
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(key)?.clone();
        match entry.expires_at {
            Some(at) if at <= Utc::now().timestamp() => {
                entries.pop(key);
                None
            }
            _ => Some(entry.data),
        }
    }

    pub async fn insert(&self, key: String, data: Bytes, expires_at: Option<i64>) {
        let mut entries = self.entries.lock().await;
        entries.put(key, MemoryEntry { data, expires_at });
    }

    pub async fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.pop(key);
    }

    pub async fn remove_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().await;
        let keys: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            entries.pop(&key);
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = MemoryCache::new(8);
        cache
            .insert("a".into(), Bytes::from_static(b"payload"), None)
            .await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"payload")));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let cache = MemoryCache::new(8);
        let past = Utc::now().timestamp() - 10;
        cache
            .insert("a".into(), Bytes::from_static(b"x"), Some(past))
            .await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_bound_evicts_lru() {
        let cache = MemoryCache::new(2);
        cache.insert("a".into(), Bytes::from_static(b"1"), None).await;
        cache.insert("b".into(), Bytes::from_static(b"2"), None).await;
        // a に触れて b を最古にする
        cache.get("a").await;
        cache.insert("c".into(), Bytes::from_static(b"3"), None).await;

        assert_eq!(cache.get("b").await, None);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let cache = MemoryCache::new(8);
        cache.insert("drafts:1".into(), Bytes::from_static(b"1"), None).await;
        cache.insert("drafts:2".into(), Bytes::from_static(b"2"), None).await;
        cache.insert("images:1".into(), Bytes::from_static(b"3"), None).await;

        cache.remove_prefix("drafts:").await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get("images:1").await.is_some());
    }
}
