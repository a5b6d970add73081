//! Key namespaces and default TTLs.
//!
//! Every key written by this crate lives under one of these prefixes:
//!
//! - `cache:<entity>:<id>` — cache entries
//! - `lock:<entity>:<id>` — cache rebuild locks
//! - `lock:order:<user>` — per-user order serialization
//! - `icr:<prefix>:<yyyy:MM:dd>` — daily ID counters
//! - `seckill:stock:<voucher>` / `seckill:order:<voucher>` /
//!   `seckill:window:<voucher>` — flash-sale admission state
//! - `stream.orders` — the durable admission stream

use std::time::Duration;
use voucherflow_core::{UserId, VoucherId};

/// Prefix for every distributed-lock key.
pub const LOCK_PREFIX: &str = "lock:";

/// Prefix for ID-generator counter keys.
pub const ID_COUNTER_PREFIX: &str = "icr:";

/// Prefix for cache entry keys.
pub const CACHE_PREFIX: &str = "cache:";

/// Prefix of the per-voucher remaining-stock counter.
pub const SECKILL_STOCK_PREFIX: &str = "seckill:stock:";

/// Prefix of the per-voucher order-marker set.
pub const SECKILL_ORDER_PREFIX: &str = "seckill:order:";

/// Prefix of the per-voucher sale-window hash.
pub const SECKILL_WINDOW_PREFIX: &str = "seckill:window:";

/// The durable admission stream.
pub const ORDER_STREAM_KEY: &str = "stream.orders";

/// Consumer group of the order materialization pipeline. Stable across
/// restarts so the pending range survives a crash.
pub const ORDER_GROUP: &str = "order-workers";

/// Default consumer name within [`ORDER_GROUP`].
pub const ORDER_CONSUMER: &str = "worker-1";

/// TTL of the empty sentinel written for confirmed-absent keys.
pub const NULL_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

/// Default TTL of regular cache entries.
pub const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL of cache rebuild locks. A safety valve against a crashed rebuild
/// worker, so it only needs to exceed one source-of-truth round trip.
pub const REBUILD_LOCK_TTL: Duration = Duration::from_secs(10);

/// Default TTL of per-user order locks. Must exceed the expected
/// relational write duration with margin.
pub const ORDER_LOCK_TTL: Duration = Duration::from_secs(5);

/// Key of a cache entry.
#[must_use]
pub fn cache_key(entity: &str, id: &str) -> String {
    format!("{CACHE_PREFIX}{entity}:{id}")
}

/// Lock name (without the `lock:` prefix) guarding a cache rebuild.
#[must_use]
pub fn rebuild_lock_name(entity: &str, id: &str) -> String {
    format!("{entity}:{id}")
}

/// Lock name (without the `lock:` prefix) serializing one user's orders.
#[must_use]
pub fn order_lock_name(user_id: UserId) -> String {
    format!("order:{user_id}")
}

/// Key of the remaining-stock counter for a voucher.
#[must_use]
pub fn stock_key(voucher_id: VoucherId) -> String {
    format!("{SECKILL_STOCK_PREFIX}{voucher_id}")
}

/// Key of the order-marker set for a voucher.
#[must_use]
pub fn order_marker_key(voucher_id: VoucherId) -> String {
    format!("{SECKILL_ORDER_PREFIX}{voucher_id}")
}

/// Key of the sale-window hash for a voucher.
#[must_use]
pub fn window_key(voucher_id: VoucherId) -> String {
    format!("{SECKILL_WINDOW_PREFIX}{voucher_id}")
}
