use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis unavailable: {0}")]
    Redis(String),
}

/// Serializes runs for the same seller inside this process.
#[derive(Clone, Default)]
pub struct RunLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl RunLocks {
    pub async fn acquire(&self, seller_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut guard = self.locks.lock().await;
            // Entries nobody holds or waits on are only referenced by the map.
            guard.retain(|_, lock| Arc::strong_count(lock) > 1);
            guard.entry(seller_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Cross-replica lock held in Redis with `SET NX EX`.
#[derive(Clone)]
pub struct RedisRunLock {
    client: redis::Client,
    ttl_secs: u64,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
end
return 0
"#;

impl RedisRunLock {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok()?;
        let client = redis::Client::open(url).ok()?;
        let ttl_secs = std::env::var("RUN_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(900);
        Some(Self { client, ttl_secs })
    }

    fn key(seller_id: i64) -> String {
        format!("logistics_watch:run:{seller_id}")
    }

    /// `Ok(false)` when another holder owns the lock.
    pub async fn try_acquire(&self, seller_id: i64, owner: &str) -> Result<bool, LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LockError::Redis(err.to_string()))?;
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(self.ttl_secs));
        let reply: Option<String> = conn
            .set_options(Self::key(seller_id), owner, opts)
            .await
            .map_err(|err| LockError::Redis(err.to_string()))?;
        Ok(reply.is_some())
    }

    pub async fn release(&self, seller_id: i64, owner: &str) -> Result<(), LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LockError::Redis(err.to_string()))?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(seller_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| LockError::Redis(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_seller_runs_are_serialized() {
        let locks = RunLocks::default();
        let held = locks.acquire(1).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("released")
            .expect("task");
    }

    #[tokio::test]
    async fn idle_seller_locks_are_pruned() {
        let locks = RunLocks::default();
        drop(locks.acquire(1).await);
        drop(locks.acquire(2).await);
        let held = locks.acquire(3).await;
        let tracked: Vec<i64> = locks.locks.lock().await.keys().copied().collect();
        assert_eq!(tracked, vec![3]);
        drop(held);
    }

    #[tokio::test]
    async fn pruning_keeps_contended_locks() {
        let locks = RunLocks::default();
        let held = locks.acquire(1).await;
        let _other = locks.acquire(2).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("released")
            .expect("task");
    }

    #[tokio::test]
    async fn different_sellers_do_not_block() {
        let locks = RunLocks::default();
        let _first = locks.acquire(1).await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire(2))
            .await
            .expect("independent lock");
    }
}
