//! Flash-sale order admission.
//!
//! Admission is decided entirely in the key-value store, where the
//! check-and-reserve can run as one atomic unit; the relational write
//! happens later, asynchronously, off the buyer's critical path.
//!
//! The decision itself is a server-side Lua script taking the voucher's
//! stock counter, its order-marker set and the order stream:
//!
//! 1. stock counter ≤ 0 → status `1` (out of stock);
//! 2. user already in the marker set → status `2` (duplicate order);
//! 3. otherwise decrement stock, add the user to the marker set, append
//!    the admission message to the stream, and return `0`.
//!
//! Because the three steps execute atomically, no two concurrent calls
//! can both pass both checks: oversell and double-admission are ruled out
//! at this layer even though the authoritative row is written later.
//!
//! The sale window is validated before the script from state seeded by
//! [`SeckillAdmission::publish_voucher`] — still touching only the
//! key-value store, so the admission path never performs a relational
//! round trip.

use crate::id::{IdError, IdGenerator};
use crate::keys::{ORDER_STREAM_KEY, order_marker_key, stock_key, window_key};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
use voucherflow_core::{OrderId, SeckillVoucher, UserId, VoucherId};

/// Atomic check-and-reserve. KEYS: stock counter, order-marker set,
/// order stream. ARGV: user id, order id, voucher id.
const ADMISSION_SCRIPT: &str = r"
local stock = tonumber(redis.call('get', KEYS[1]))
if stock == nil or stock <= 0 then
    return 1
end
if redis.call('sismember', KEYS[2], ARGV[1]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('sadd', KEYS[2], ARGV[1])
redis.call('xadd', KEYS[3], '*', 'id', ARGV[2], 'user_id', ARGV[1], 'voucher_id', ARGV[3])
return 0
";

/// Outcome of one admission attempt.
///
/// Everything except [`Admission::Admitted`] is a contention outcome, not
/// an error; the caller surfaces it to the buyer directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved; the order will materialize asynchronously.
    Admitted {
        /// The pre-generated identity of the order being materialized.
        order_id: OrderId,
    },

    /// The stock counter is exhausted.
    SoldOut,

    /// This user already holds an admission for this voucher.
    AlreadyOrdered,

    /// The sale window has not opened yet.
    NotStarted,

    /// The sale window has closed.
    Ended,
}

/// Errors raised by the admission path.
#[derive(Debug, Error)]
pub enum SeckillError {
    /// The key-value store could not be reached.
    #[error("admission store unavailable: {0}")]
    Unavailable(String),

    /// No sale window was seeded for this voucher; it was never published
    /// to the fast store.
    #[error("voucher {0} has not been published for admission")]
    VoucherNotPublished(VoucherId),

    /// The admission script returned a status outside its contract.
    #[error("admission script returned unknown status {0}")]
    ScriptContract(i64),

    /// Order ID generation failed.
    #[error(transparent)]
    Id(#[from] IdError),
}

/// The admission front end: sale-window gate, ID pre-generation and the
/// atomic script invocation.
///
/// # Example
///
/// ```no_run
/// use voucherflow_redis::seckill::{Admission, SeckillAdmission};
/// use voucherflow_core::{UserId, VoucherId};
///
/// # async fn example(conn: redis::aio::ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
/// let admission = SeckillAdmission::new(conn);
///
/// match admission.admit(VoucherId(1), UserId(42)).await? {
///     Admission::Admitted { order_id } => println!("admitted as {order_id}"),
///     other => println!("rejected: {other:?}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SeckillAdmission {
    conn: ConnectionManager,
    ids: IdGenerator,
    stream_key: String,
}

impl SeckillAdmission {
    /// Create an admission front end writing to the default order stream.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        let ids = IdGenerator::new(conn.clone());
        Self {
            conn,
            ids,
            stream_key: ORDER_STREAM_KEY.to_string(),
        }
    }

    /// Override the order stream key.
    #[must_use]
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self
    }

    /// Override the ID generator (e.g. to change its epoch).
    #[must_use]
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Seed the fast-store admission state for a voucher: its remaining
    /// stock counter and its sale window. Must run before any admission
    /// for that voucher; typically invoked by the administrative path that
    /// creates the voucher row.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::Unavailable`] if the store cannot be
    /// reached.
    pub async fn publish_voucher(&self, voucher: &SeckillVoucher) -> Result<(), SeckillError> {
        let mut conn = self.conn.clone();
        let window = window_key(voucher.voucher_id);

        let _: () = redis::pipe()
            .atomic()
            .set(stock_key(voucher.voucher_id), voucher.stock)
            .hset(&window, "begin", voucher.begin_time.timestamp())
            .hset(&window, "end", voucher.end_time.timestamp())
            .query_async(&mut conn)
            .await
            .map_err(|e| SeckillError::Unavailable(e.to_string()))?;

        tracing::info!(
            voucher_id = %voucher.voucher_id,
            stock = voucher.stock,
            begin = %voucher.begin_time,
            end = %voucher.end_time,
            "voucher published for admission"
        );

        Ok(())
    }

    /// Decide one buyer's admission for one voucher.
    ///
    /// Generates the order ID up front so the admitted message already
    /// carries it, then runs the atomic script. The returned
    /// [`Admission`] is definitive: an admitted buyer's order is
    /// guaranteed to materialize (the stream is durable), a rejected buyer
    /// consumed nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::VoucherNotPublished`] if no window was
    /// seeded, or store/ID failures.
    pub async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<Admission, SeckillError> {
        let mut conn = self.conn.clone();

        let (begin, end): (Option<i64>, Option<i64>) = conn
            .hget(window_key(voucher_id), &["begin", "end"])
            .await
            .map_err(|e| SeckillError::Unavailable(e.to_string()))?;

        let (Some(begin), Some(end)) = (begin, end) else {
            return Err(SeckillError::VoucherNotPublished(voucher_id));
        };

        let now = Utc::now().timestamp();
        if now < begin {
            return Ok(Admission::NotStarted);
        }
        if now > end {
            return Ok(Admission::Ended);
        }

        let order_id = OrderId(self.ids.next_id("order").await?);

        let status: i64 = redis::Script::new(ADMISSION_SCRIPT)
            .key(stock_key(voucher_id))
            .key(order_marker_key(voucher_id))
            .key(&self.stream_key)
            .arg(user_id.0)
            .arg(order_id.0)
            .arg(voucher_id.0)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SeckillError::Unavailable(e.to_string()))?;

        let outcome = match status {
            0 => {
                tracing::debug!(
                    %voucher_id,
                    %user_id,
                    %order_id,
                    "admission granted, order enqueued"
                );
                metrics::counter!("seckill.admitted").increment(1);
                Admission::Admitted { order_id }
            }
            1 => {
                metrics::counter!("seckill.sold_out").increment(1);
                Admission::SoldOut
            }
            2 => {
                metrics::counter!("seckill.duplicates").increment(1);
                Admission::AlreadyOrdered
            }
            other => return Err(SeckillError::ScriptContract(other)),
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_checks_before_reserving() {
        let get = ADMISSION_SCRIPT.find("get").unwrap_or(usize::MAX);
        let sismember = ADMISSION_SCRIPT.find("sismember").unwrap_or(usize::MAX);
        let incrby = ADMISSION_SCRIPT.find("incrby").unwrap_or(usize::MAX);
        let xadd = ADMISSION_SCRIPT.find("xadd").unwrap_or(usize::MAX);

        assert!(get < sismember);
        assert!(sismember < incrby);
        assert!(incrby < xadd);
    }

    #[test]
    fn stream_fields_match_the_message_schema() {
        for field in ["'id'", "'user_id'", "'voucher_id'"] {
            assert!(ADMISSION_SCRIPT.contains(field));
        }
    }
}
