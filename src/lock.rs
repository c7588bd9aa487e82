use crate::config::LockConfig;
use crate::error::{EngineError, EngineResult};
use crate::redis_client::RedisClient;
use rand::Rng;
use redis::Script;
use std::time::Duration;
use tracing::warn;

// Lua scripts run server-side so the check-and-act pair is atomic even
// under concurrent callers hammering the same key.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return 1
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Sorts and dedups a multi-key request into the global lock-acquisition
/// order. Two callers with overlapping key sets always walk their
/// shared keys in the same relative order, which is what rules out
/// circular waits.
fn sorted_unique_keys(keys: &[String]) -> Vec<String> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// A single held lock, released automatically is NOT implied -- callers
/// must call [`DistributedLock::release`] (or `release_all`) explicitly,
/// same as the teacher's circuit breaker being explicit about state.
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// Redis-backed mutual exclusion for seat groups. One key per seat,
/// `seat:{seat_id}`, acquired in sorted order across a
/// multi-seat request to avoid the classic lock-order deadlock.
#[derive(Clone)]
pub struct DistributedLock {
    redis: RedisClient,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(redis: RedisClient, config: LockConfig) -> Self {
        Self { redis, config }
    }

    pub fn seat_key(seat_id: i64) -> String {
        format!("seat:{}", seat_id)
    }

    /// Acquire a single key with bounded retries and jittered backoff.
    /// Returns `LockTimeout` once `max_wait_ms` has elapsed without success.
    pub async fn acquire(&self, key: &str) -> EngineResult<LockGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        let script = Script::new(ACQUIRE_SCRIPT);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        let mut conn = self.redis.conn.clone();

        loop {
            let acquired: i32 = script
                .key(key)
                .arg(&token)
                .arg(self.config.timeout_seconds * 1000)
                .invoke_async(&mut conn)
                .await
                .map_err(EngineError::Cache)?;

            if acquired == 1 {
                return Ok(LockGuard {
                    key: key.to_string(),
                    token,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::LockTimeout(key.to_string()));
            }

            let jitter = rand::thread_rng().gen_range(0..self.config.retry_interval_ms.max(1));
            tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms + jitter)).await;
        }
    }

    /// Acquire every key in `keys`, sorted lexicographically first so two
    /// callers racing over overlapping seat sets always request locks in
    /// the same order. Releases whatever it already holds before returning
    /// the first failure.
    pub async fn acquire_all(&self, keys: &[String]) -> EngineResult<Vec<LockGuard>> {
        let sorted = sorted_unique_keys(keys);

        let mut guards = Vec::with_capacity(sorted.len());
        for key in &sorted {
            match self.acquire(key).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    self.release_all(&guards).await;
                    return Err(err);
                }
            }
        }
        Ok(guards)
    }

    pub async fn release(&self, guard: &LockGuard) {
        let script = Script::new(RELEASE_SCRIPT);
        let mut conn = self.redis.conn.clone();
        let result: redis::RedisResult<i32> = script
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(key = %guard.key, error = %err, "failed to release distributed lock");
        }
    }

    pub async fn release_all(&self, guards: &[LockGuard]) {
        for guard in guards {
            self.release(guard).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::{Fake, Faker};
    use proptest::prelude::*;

    #[test]
    fn seat_key_is_stable_and_namespaced() {
        assert_eq!(DistributedLock::seat_key(42), "seat:42");
    }

    #[test]
    fn acquire_all_sorts_and_dedups_keys() {
        let keys = vec![
            "seat:3".to_string(),
            "seat:1".to_string(),
            "seat:3".to_string(),
            "seat:2".to_string(),
        ];
        assert_eq!(
            sorted_unique_keys(&keys),
            vec!["seat:1".to_string(), "seat:2".to_string(), "seat:3".to_string()]
        );
    }

    #[test]
    fn acquire_all_tolerates_arbitrary_string_keys() {
        // Exercises the sort path against non-numeric keys too, e.g. a
        // caller locking by some other namespaced identifier.
        let keys: Vec<String> = (0..5).map(|_| Faker.fake::<String>()).collect();
        let sorted = sorted_unique_keys(&keys);
        let mut expect = keys.clone();
        expect.sort();
        expect.dedup();
        assert_eq!(sorted, expect);
    }

    proptest! {
        /// Two callers racing over overlapping key sets never deadlock
        /// because the sorted-acquire rule imposes one global order --
        /// any two sorted key lists agree on the relative order of
        /// whatever keys they share.
        #[test]
        fn sorted_acquire_order_is_globally_consistent(
            a in prop::collection::vec(1i64..50, 1..12),
            b in prop::collection::vec(1i64..50, 1..12),
        ) {
            let keys_a = sorted_unique_keys(&a.iter().map(|id| DistributedLock::seat_key(*id)).collect::<Vec<_>>());
            let keys_b = sorted_unique_keys(&b.iter().map(|id| DistributedLock::seat_key(*id)).collect::<Vec<_>>());

            let shared: Vec<&String> = keys_a.iter().filter(|k| keys_b.contains(k)).collect();
            let shared_in_b: Vec<&String> = keys_b.iter().filter(|k| shared.contains(k)).collect();
            let shared_in_a: Vec<&String> = keys_a.iter().filter(|k| shared.contains(k)).collect();

            prop_assert_eq!(shared_in_a, shared_in_b);
        }

        /// Sorting is idempotent and never grows the key set -- dedup only
        /// ever removes, acquisition order never introduces a phantom key.
        #[test]
        fn sorting_is_idempotent_and_shrinks_or_holds(keys in prop::collection::vec(1i64..20, 0..16)) {
            let raw: Vec<String> = keys.iter().map(|id| DistributedLock::seat_key(*id)).collect();
            let once = sorted_unique_keys(&raw);
            let twice = sorted_unique_keys(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.len() <= raw.len());
        }
    }
}
