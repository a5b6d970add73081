//! Composite unique ID generation.
//!
//! An ID is a 64-bit value: the upper bits carry a second-granularity
//! offset from a fixed epoch shifted left by 32, the lower 32 bits a
//! counter obtained from the store's atomic `INCR`. Uniqueness therefore
//! comes from the store, not from local state, so independent processes
//! sharing one store never collide.
//!
//! Counter keys are scoped per prefix and per calendar day
//! (`icr:{prefix}:{yyyy:MM:dd}`), which bounds counter growth; day
//! rollover is handled by the natural key change, with no reset logic.

use crate::keys::ID_COUNTER_PREFIX;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

/// Number of low bits occupied by the daily counter.
const COUNTER_BITS: u32 = 32;

/// Default ID epoch: 2025-01-01T00:00:00Z.
pub const DEFAULT_EPOCH_SECONDS: i64 = 1_735_689_600;

/// Errors raised by ID generation.
#[derive(Debug, Error)]
pub enum IdError {
    /// The counter store could not be reached.
    #[error("id counter unavailable: {0}")]
    Unavailable(String),

    /// The wall clock reads earlier than the configured epoch.
    #[error("system clock reads earlier than the id epoch")]
    ClockBeforeEpoch,
}

/// Pack a second offset and a counter value into one ID.
///
/// The counter occupies the low [`COUNTER_BITS`] bits. Should a single
/// day's counter ever exceed 32 bits it bleeds into the time component;
/// IDs stay unique because the counter keeps increasing, they just stop
/// sorting by wall clock for that prefix until the next day key.
#[must_use]
pub const fn compose(seconds_since_epoch: u64, counter: u64) -> u64 {
    (seconds_since_epoch << COUNTER_BITS) | counter
}

/// Store-backed unique ID generator.
///
/// # Example
///
/// ```no_run
/// use voucherflow_redis::id::IdGenerator;
///
/// # async fn example(conn: redis::aio::ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
/// let ids = IdGenerator::new(conn);
/// let order_id = ids.next_id("order").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct IdGenerator {
    conn: ConnectionManager,
    epoch_seconds: i64,
}

impl IdGenerator {
    /// Create a generator with the default epoch.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            epoch_seconds: DEFAULT_EPOCH_SECONDS,
        }
    }

    /// Override the epoch offset. All cooperating processes must agree on
    /// it, since it shapes the time component of every ID.
    #[must_use]
    pub const fn with_epoch(mut self, epoch_seconds: i64) -> Self {
        self.epoch_seconds = epoch_seconds;
        self
    }

    /// Generate the next ID for `prefix`.
    ///
    /// IDs are unique across all callers sharing the store and
    /// non-decreasing within a second bucket for a fixed prefix and day.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Unavailable`] if the store cannot be reached and
    /// [`IdError::ClockBeforeEpoch`] if the local clock is misconfigured.
    pub async fn next_id(&self, prefix: &str) -> Result<u64, IdError> {
        let now = Utc::now();

        let seconds = u64::try_from(now.timestamp() - self.epoch_seconds)
            .map_err(|_| IdError::ClockBeforeEpoch)?;

        let day = now.format("%Y:%m:%d");
        let counter_key = format!("{ID_COUNTER_PREFIX}{prefix}:{day}");

        let mut conn = self.conn.clone();
        let counter: u64 = conn
            .incr(&counter_key, 1_u64)
            .await
            .map_err(|e| IdError::Unavailable(e.to_string()))?;

        Ok(compose(seconds, counter))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compose_packs_counter_into_low_bits() {
        assert_eq!(compose(0, 1), 1);
        assert_eq!(compose(1, 0), 1 << 32);
        assert_eq!(compose(1, 1), (1 << 32) | 1);
    }

    #[test]
    fn counter_key_is_scoped_per_day() {
        let day = Utc::now().format("%Y:%m:%d").to_string();
        let key = format!("{ID_COUNTER_PREFIX}order:{day}");
        assert!(key.starts_with("icr:order:"));
        assert_eq!(key.matches(':').count(), 4);
    }

    proptest! {
        /// IDs from a later second bucket always sort after IDs from an
        /// earlier one, regardless of counter values.
        #[test]
        fn later_seconds_always_sort_higher(
            earlier in 0_u64..(1 << 31),
            later_offset in 1_u64..1024,
            counter_a in 0_u64..u64::from(u32::MAX),
            counter_b in 0_u64..u64::from(u32::MAX),
        ) {
            let later = earlier + later_offset;
            prop_assert!(compose(earlier, counter_a) < compose(later, counter_b));
        }

        /// Within one second bucket, ordering follows the counter.
        #[test]
        fn same_second_orders_by_counter(
            seconds in 0_u64..(1 << 31),
            counter in 0_u64..u64::from(u32::MAX - 1),
        ) {
            prop_assert!(compose(seconds, counter) < compose(seconds, counter + 1));
        }
    }
}
