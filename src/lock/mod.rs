use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cli::config::LockSettings;

/// Backend primitive for distributed locks: an atomic set-if-absent with
/// expiry, plus compare-and-act release and extend.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with the given TTL only if the key is absent.
    /// Returns true when the key was set.
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it still holds `token`. Returns true on delete.
    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool>;

    /// Re-arm the TTL of `key` only if it still holds `token`.
    async fn extend_if_held(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Whether any holder currently owns `key`.
    async fn is_held(&self, key: &str) -> Result<bool>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lock primitive. SET NX PX gives atomic acquire-with-expiry;
/// release and extend go through Lua so the ownership check and the mutation
/// happen in one step.
pub struct RedisLockBackend {
    conn: Arc<Mutex<MultiplexedConnection>>,
    release_script: redis::Script,
    extend_script: redis::Script,
}

impl RedisLockBackend {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        })
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().await;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .context("Failed to run SET NX PX")?;

        Ok(reply.is_some())
    }

    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;

        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to run lock release script")?;

        Ok(deleted == 1)
    }

    async fn extend_if_held(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().await;

        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to run lock extend script")?;

        Ok(extended == 1)
    }

    async fn is_held(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;

        let exists: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context("Failed to run EXISTS")?;

        Ok(exists == 1)
    }
}

/// Process-local lock primitive for single-node deployments and tests.
/// Expired entries are treated as absent and overwritten on acquire.
#[derive(Default)]
pub struct MemoryLockBackend {
    entries: std::sync::Mutex<std::collections::HashMap<String, (String, std::time::Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = std::time::Instant::now();

        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some((held, expires)) if held == token && *expires > std::time::Instant::now() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_if_held(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = std::time::Instant::now();

        match entries.get_mut(key) {
            Some((held, expires)) if held == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, expires)) => Ok(*expires > std::time::Instant::now()),
            None => Ok(false),
        }
    }
}

/// Factory for creating a LockBackend implementation
pub struct LockBackendFactory;

impl LockBackendFactory {
    /// Create a new LockBackend instance based on the settings
    pub async fn create(settings: &LockSettings) -> Result<Arc<dyn LockBackend>> {
        match settings.backend.as_str() {
            "redis" => {
                let backend = RedisLockBackend::new(&settings.redis_url).await?;
                Ok(Arc::new(backend))
            }
            "memory" => Ok(Arc::new(MemoryLockBackend::new())),
            other => {
                anyhow::bail!("Unsupported lock backend: {}", other)
            }
        }
    }
}

/// Named mutual-exclusion locks over a LockBackend.
///
/// Each successful acquire returns an opaque holder token; release and
/// extend only act when the caller still owns the lock, so a holder whose
/// TTL lapsed cannot disturb the next owner. Backend errors are treated as
/// "not acquired" so a flaky store can never hand out the same lock twice.
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    prefix: String,
    retry_base: Duration,
}

impl LockService {
    pub fn new(backend: Arc<dyn LockBackend>, prefix: &str) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            retry_base: Duration::from_millis(100),
        }
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// Try to acquire the named lock. Non-blocking callers get an immediate
    /// answer; blocking callers retry with jittered backoff until acquired
    /// or `blocking_timeout` elapses. Returns the holder token on success.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        blocking: bool,
        blocking_timeout: Duration,
    ) -> Option<String> {
        let key = self.key_for(name);
        let deadline = tokio::time::Instant::now() + blocking_timeout;
        let mut attempt: u32 = 0;

        loop {
            let token = Uuid::new_v4().to_string();

            match self.backend.try_set(&key, &token, ttl).await {
                Ok(true) => {
                    debug!("Acquired lock {} with token {}", key, token);
                    return Some(token);
                }
                Ok(false) => {
                    if !blocking {
                        debug!("Lock {} is held elsewhere, not waiting", key);
                        return None;
                    }
                }
                Err(e) => {
                    // Unknown store state: assume the lock is held.
                    warn!("Lock store error acquiring {}, treating as held: {e:#}", key);
                    if !blocking {
                        return None;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                debug!("Gave up waiting for lock {}", key);
                return None;
            }

            let backoff = self.retry_base * 2u32.pow(attempt.min(4));
            let jitter = rand::thread_rng().gen_range(0..backoff.as_millis().max(1) as u64);
            tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            attempt += 1;
        }
    }

    /// Release the named lock if `token` still owns it.
    pub async fn release(&self, name: &str, token: &str) -> bool {
        let key = self.key_for(name);

        match self.backend.release_if_held(&key, token).await {
            Ok(released) => {
                if !released {
                    debug!("Lock {} no longer held by this token, nothing released", key);
                }
                released
            }
            Err(e) => {
                warn!("Lock store error releasing {}: {e:#}", key);
                false
            }
        }
    }

    /// Re-arm the TTL of the named lock if `token` still owns it. The new
    /// TTL is measured from now, not appended to the old one.
    pub async fn extend(&self, name: &str, token: &str, ttl: Duration) -> bool {
        let key = self.key_for(name);

        match self.backend.extend_if_held(&key, token, ttl).await {
            Ok(extended) => extended,
            Err(e) => {
                warn!("Lock store error extending {}: {e:#}", key);
                false
            }
        }
    }

    /// Whether anyone currently holds the named lock.
    pub async fn is_held(&self, name: &str) -> bool {
        let key = self.key_for(name);

        match self.backend.is_held(&key).await {
            Ok(held) => held,
            Err(e) => {
                // Fail closed: an unreadable store reports the lock as held.
                warn!("Lock store error checking {}, reporting held: {e:#}", key);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> LockService {
        LockService::new(Arc::new(MemoryLockBackend::new()), "lock")
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let locks = service();
        let ttl = Duration::from_secs(10);

        let token = locks
            .acquire("schedule:1", ttl, false, Duration::ZERO)
            .await
            .unwrap();
        assert!(locks
            .acquire("schedule:1", ttl, false, Duration::ZERO)
            .await
            .is_none());

        assert!(locks.release("schedule:1", &token).await);
        assert!(locks
            .acquire("schedule:1", ttl, false, Duration::ZERO)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let locks = service();
        let ttl = Duration::from_secs(10);

        assert!(locks.acquire("a", ttl, false, Duration::ZERO).await.is_some());
        assert!(locks.acquire("b", ttl, false, Duration::ZERO).await.is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_or_extend() {
        let locks = service();
        let ttl = Duration::from_millis(20);

        let stale = locks
            .acquire("job", ttl, false, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // TTL lapsed and a new holder took over.
        let fresh = locks
            .acquire("job", Duration::from_secs(10), false, Duration::ZERO)
            .await
            .unwrap();
        assert_ne!(stale, fresh);

        assert!(!locks.release("job", &stale).await);
        assert!(!locks.extend("job", &stale, Duration::from_secs(10)).await);
        assert!(locks.is_held("job").await);
    }

    #[tokio::test]
    async fn extend_rearms_ttl_from_now() {
        let locks = service();

        let token = locks
            .acquire("keepalive", Duration::from_millis(50), false, Duration::ZERO)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(locks.extend("keepalive", &token, Duration::from_millis(100)).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Without the extend this would have expired at 50ms.
        assert!(locks.is_held("keepalive").await);
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let locks = Arc::new(service());
        let ttl = Duration::from_secs(10);

        let token = locks
            .acquire("busy", ttl, false, Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire("busy", ttl, true, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locks.release("busy", &token).await);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() {
        let locks = service();
        let ttl = Duration::from_secs(10);

        locks.acquire("stuck", ttl, false, Duration::ZERO).await.unwrap();
        let got = locks
            .acquire("stuck", ttl, true, Duration::from_millis(150))
            .await;
        assert!(got.is_none());
    }
}
