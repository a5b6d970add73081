//! Distributed mutual exclusion over the key-value store.
//!
//! A lock is a single key holding a holder-unique token, created with
//! `SET key token NX EX ttl` — one atomic operation. Release runs a
//! compare-and-delete script on the server: the key is deleted only if it
//! still holds the caller's token. Without the compare, a holder whose TTL
//! expired could delete a lock that has since been re-acquired by someone
//! else, breaking mutual exclusion.
//!
//! Acquisition failure is a normal contention outcome, not an error; there
//! is no built-in blocking. Callers choose their own policy: the cache
//! mutex strategy retries with backoff, the order pipeline rejects
//! immediately.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use voucherflow_redis::lock::RedisLock;
//!
//! # async fn example(conn: redis::aio::ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let lock = RedisLock::new(conn, "order:42", Duration::from_secs(5));
//! if lock.try_lock().await? {
//!     // critical section
//!     lock.unlock().await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::keys::LOCK_PREFIX;
use redis::aio::ConnectionManager;
use thiserror::Error;
use uuid::Uuid;

/// Compare-and-delete: remove the lock key only if it still holds the
/// caller's token. Runs atomically on the server.
const UNLOCK_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
";

/// Errors raised by lock operations.
///
/// Contention (`try_lock` returning `false`) is not an error.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key-value store could not be reached.
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// A handle on one distributed lock key.
///
/// Each handle carries its own uuid holder token, so a handle can only
/// release what it acquired. The TTL is a safety valve against a crashed
/// holder; it must exceed the expected critical-section duration with
/// margin.
pub struct RedisLock {
    conn: ConnectionManager,
    key: String,
    token: String,
    ttl_seconds: u64,
}

impl RedisLock {
    /// Create a handle for the lock named `name` (stored under
    /// `lock:{name}`).
    #[must_use]
    pub fn new(conn: ConnectionManager, name: &str, ttl: std::time::Duration) -> Self {
        Self {
            conn,
            key: format!("{LOCK_PREFIX}{name}"),
            token: Uuid::new_v4().to_string(),
            ttl_seconds: ttl.as_secs().max(1),
        }
    }

    /// The full store key of this lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// Returns `true` if this handle now holds the lock. `false` means
    /// another holder has it — a normal outcome under contention.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the store cannot be reached.
    pub async fn try_lock(&self) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        // SET NX EX returns OK on success and nil when the key exists,
        // which the client maps to a bool.
        let acquired: bool = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        if acquired {
            tracing::debug!(key = %self.key, ttl_seconds = self.ttl_seconds, "lock acquired");
        }

        Ok(acquired)
    }

    /// Release the lock if this handle still holds it.
    ///
    /// Returns `true` if the lock was deleted, `false` if it had already
    /// expired or belongs to a different holder (in which case nothing is
    /// touched).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the store cannot be reached.
    pub async fn unlock(&self) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        if deleted == 0 {
            tracing::warn!(
                key = %self.key,
                "unlock was a no-op: lock expired or held by another token"
            );
        }

        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_namespaced() {
        assert_eq!(format!("{LOCK_PREFIX}order:42"), "lock:order:42");
    }

    #[test]
    fn unlock_script_compares_before_deleting() {
        assert!(UNLOCK_SCRIPT.contains("get"));
        assert!(UNLOCK_SCRIPT.contains("del"));
    }
}
