use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::memory_cache::MemoryCache;
use crate::modules::database::DbPool;
use crate::shared::config::CacheConfig;
use crate::shared::error::{EngineError, Result};

/// `fetch_with_cache` の呼び出しオプション。
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// 未指定なら設定の既定 TTL を使う。
    pub ttl: Option<Duration>,
    /// キャッシュヒットを無視してリモートを叩き、結果で上書きする。
    pub force_refresh: bool,
}

/// キャッシュ経由で取得したペイロード。
/// `served_stale` はリモート失敗により期限切れデータを返したことを示す。
#[derive(Debug, Clone)]
pub struct CachedPayload {
    pub data: Bytes,
    pub served_stale: bool,
}

/// TTL 付き二層キャッシュ。メモリ層は読み出し高速化のためだけに使い、
/// 正本は常に Local Store の `cache` テーブル。
pub struct TtlCache {
    pool: DbPool,
    memory: MemoryCache,
    config: CacheConfig,
}

impl TtlCache {
    pub fn new(pool: DbPool, config: CacheConfig) -> Self {
        let memory = MemoryCache::new(config.max_entries);
        Self {
            pool,
            memory,
            config,
        }
    }

    /// キーに対応する有効なペイロードを返す。期限切れは不在扱い。
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(data) = self.memory.get(key).await {
            return Ok(Some(data));
        }

        let row: Option<(Vec<u8>, Option<i64>)> =
            sqlx::query_as("SELECT data, expires_at FROM cache WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((data, expires_at)) = row else {
            return Ok(None);
        };

        if matches!(expires_at, Some(at) if at <= Utc::now().timestamp()) {
            return Ok(None);
        }

        let data = Bytes::from(data);
        self.memory
            .insert(key.to_string(), data.clone(), expires_at)
            .await;
        Ok(Some(data))
    }

    /// 期限を無視して読む。リモート失敗時のステイルフォールバック専用。
    pub async fn get_stale(&self, key: &str) -> Result<Option<Bytes>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM cache WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(data,)| Bytes::from(data)))
    }

    pub async fn set(&self, key: &str, data: Bytes) -> Result<()> {
        self.set_with_ttl(key, data, Duration::from_secs(self.config.default_ttl))
            .await
    }

    pub async fn set_with_ttl(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        let now = Utc::now().timestamp();
        let expires_at = Some(now + ttl.as_secs() as i64);

        self.enforce_quota(data.len() as u64).await?;

        let written = sqlx::query(
            r#"
            INSERT INTO cache (key, data, timestamp, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                timestamp = excluded.timestamp,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(data.as_ref())
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        if let Err(err) = written {
            // ストアへ書けなくてもこのエントリはメモリ運用に落として生かす
            warn!(
                target: "cache",
                key,
                error = %err,
                "cache write failed, keeping entry memory-only"
            );
        }

        self.memory.insert(key.to_string(), data, expires_at).await;
        Ok(())
    }

    /// ペイロード合計が上限を超えるなら古い順に退避し、一度だけ再判定する。
    async fn enforce_quota(&self, incoming: u64) -> Result<()> {
        if self.used_bytes().await? + incoming <= self.config.max_total_bytes {
            return Ok(());
        }

        loop {
            let evicted = sqlx::query(
                r#"
                DELETE FROM cache WHERE key IN (
                    SELECT key FROM cache ORDER BY timestamp ASC LIMIT 16
                )
                "#,
            )
            .execute(&self.pool)
            .await?
            .rows_affected();

            if evicted == 0 {
                break;
            }
            debug!(target: "cache", evicted, "evicted old cache rows for quota");
            if self.used_bytes().await? + incoming <= self.config.max_total_bytes {
                self.memory.clear().await;
                return Ok(());
            }
        }

        Err(EngineError::Quota(format!(
            "payload of {incoming} bytes does not fit within {} bytes",
            self.config.max_total_bytes
        )))
    }

    /// キャッシュ読み出しの主経路。
    ///
    /// 1. `force_refresh` でなければキャッシュヒットを即座に返す
    /// 2. ミス時はリモートを呼び、成功したら書き込んで返す
    /// 3. リモート失敗時は期限切れエントリへフォールバックし、
    ///    それも無ければ元のエラーを伝播する
    pub async fn fetch_with_cache<F, Fut>(
        &self,
        key: &str,
        options: FetchOptions,
        remote_call: F,
    ) -> Result<CachedPayload>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        if !options.force_refresh {
            if let Some(data) = self.get(key).await? {
                return Ok(CachedPayload {
                    data,
                    served_stale: false,
                });
            }
        }

        match remote_call().await {
            Ok(data) => {
                let ttl = options
                    .ttl
                    .unwrap_or(Duration::from_secs(self.config.default_ttl));
                if let Err(err) = self.set_with_ttl(key, data.clone(), ttl).await {
                    // 取得自体は成功しているので書き込み失敗で呼び出しは落とさない
                    warn!(target: "cache", key, error = %err, "failed to store fetched payload");
                }
                Ok(CachedPayload {
                    data,
                    served_stale: false,
                })
            }
            Err(err) => match self.get_stale(key).await? {
                Some(data) => {
                    warn!(
                        target: "cache",
                        key,
                        error = %err,
                        "remote fetch failed, serving stale cache"
                    );
                    Ok(CachedPayload {
                        data,
                        served_stale: true,
                    })
                }
                None => Err(err),
            },
        }
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        self.memory.remove(key).await;
        Ok(())
    }

    /// namespace 前置き（`drafts:` など）でまとめて無効化する。
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM cache WHERE key LIKE ?1 || '%'")
            .bind(prefix)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.memory.remove_prefix(prefix).await;
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        self.memory.clear().await;
        Ok(())
    }

    /// 期限切れ行の掃除。初期化時に一度だけ走らせる。
    /// `get` が期限切れを不在として扱うため常駐タイマーは不要。
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let removed = sqlx::query(
            "DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at < ?1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        let (used,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM cache")
                .fetch_one(&self.pool)
                .await?;
        Ok(used as u64)
    }

    /// namespace ごとのエントリ数。オフラインステータスの集計に使う。
    pub async fn count_by_namespace(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT substr(key, 1, instr(key, ':') - 1) AS ns, COUNT(*)
            FROM cache
            WHERE instr(key, ':') > 0
            GROUP BY ns
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::database::Database;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_cache(config: CacheConfig) -> TtlCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Database::create_schema(&pool).await.unwrap();
        TtlCache::new(pool, config)
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            default_ttl: 600,
            max_entries: 64,
            max_total_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let cache = setup_cache(test_config()).await;
        let payload = Bytes::from_static(b"[{\"id\":\"p1\"}]");

        cache
            .set_with_ttl("posts:p1", payload.clone(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(cache.get("posts:p1").await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_for_plain_get() {
        let cache = setup_cache(test_config()).await;
        cache
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        // ステイル読みでは残っている
        assert_eq!(
            cache.get_stale("k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test]
    async fn test_fetch_with_cache_returns_hit_without_remote_call() {
        let cache = setup_cache(test_config()).await;
        cache.set("k", Bytes::from_static(b"cached")).await.unwrap();

        let result = cache
            .fetch_with_cache("k", FetchOptions::default(), || async {
                panic!("remote must not be called on a cache hit")
            })
            .await
            .unwrap();

        assert_eq!(result.data, Bytes::from_static(b"cached"));
        assert!(!result.served_stale);
    }

    #[tokio::test]
    async fn test_fetch_with_cache_stores_remote_result_on_miss() {
        let cache = setup_cache(test_config()).await;

        let result = cache
            .fetch_with_cache("k", FetchOptions::default(), || async {
                Ok(Bytes::from_static(b"fresh"))
            })
            .await
            .unwrap();

        assert_eq!(result.data, Bytes::from_static(b"fresh"));
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(Bytes::from_static(b"fresh"))
        );
    }

    #[tokio::test]
    async fn test_fetch_with_cache_serves_stale_on_remote_failure() {
        let cache = setup_cache(test_config()).await;
        cache
            .set_with_ttl("k", Bytes::from_static(b"old"), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let result = cache
            .fetch_with_cache("k", FetchOptions::default(), || async {
                Err(EngineError::Network("connection refused".into()))
            })
            .await
            .unwrap();

        assert_eq!(result.data, Bytes::from_static(b"old"));
        assert!(result.served_stale);
    }

    #[tokio::test]
    async fn test_fetch_with_cache_propagates_error_without_fallback() {
        let cache = setup_cache(test_config()).await;

        let result = cache
            .fetch_with_cache("missing", FetchOptions::default(), || async {
                Err(EngineError::Network("connection refused".into()))
            })
            .await;

        assert!(matches!(result, Err(EngineError::Network(_))));
    }

    #[tokio::test]
    async fn test_force_refresh_overwrites_valid_entry() {
        let cache = setup_cache(test_config()).await;
        cache.set("k", Bytes::from_static(b"old")).await.unwrap();

        let options = FetchOptions {
            force_refresh: true,
            ..Default::default()
        };
        let result = cache
            .fetch_with_cache("k", options, || async { Ok(Bytes::from_static(b"new")) })
            .await
            .unwrap();

        assert_eq!(result.data, Bytes::from_static(b"new"));
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(Bytes::from_static(b"new"))
        );
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_only_dead_rows() {
        let cache = setup_cache(test_config()).await;
        cache
            .set_with_ttl("dead", Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set_with_ttl("alive", Bytes::from_static(b"y"), Duration::from_secs(600))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let removed = cache.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            cache.get_stale("alive").await.unwrap(),
            Some(Bytes::from_static(b"y"))
        );
        assert_eq!(cache.get_stale("dead").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_evicts_oldest_then_retries() {
        let mut config = test_config();
        config.max_total_bytes = 32;
        let cache = setup_cache(config).await;

        cache
            .set("a:1", Bytes::from(vec![0u8; 16]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache
            .set("a:2", Bytes::from(vec![0u8; 16]))
            .await
            .unwrap();

        // 3 つ目は最古の行を押し出して入る
        cache
            .set("a:3", Bytes::from(vec![0u8; 16]))
            .await
            .unwrap();

        assert_eq!(cache.get_stale("a:1").await.unwrap(), None);
        assert!(cache.get_stale("a:3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_quota_error_when_payload_never_fits() {
        let mut config = test_config();
        config.max_total_bytes = 8;
        let cache = setup_cache(config).await;

        let result = cache.set("k", Bytes::from(vec![0u8; 64])).await;
        assert!(matches!(result, Err(EngineError::Quota(_))));
    }

    #[tokio::test]
    async fn test_invalidate_prefix_and_namespace_counts() {
        let cache = setup_cache(test_config()).await;
        cache.set("drafts:a", Bytes::from_static(b"1")).await.unwrap();
        cache.set("drafts:b", Bytes::from_static(b"2")).await.unwrap();
        cache.set("images:a", Bytes::from_static(b"3")).await.unwrap();

        let counts = cache.count_by_namespace().await.unwrap();
        assert_eq!(counts.get("drafts"), Some(&2));
        assert_eq!(counts.get("images"), Some(&1));

        let removed = cache.invalidate_prefix("drafts:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("drafts:a").await.unwrap(), None);
        assert!(cache.get("images:a").await.unwrap().is_some());
    }
}
