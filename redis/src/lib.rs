//! Redis-backed infrastructure for the voucherflow order-admission platform.
//!
//! This crate implements every fast-store concern of the platform against a
//! single Redis deployment:
//!
//! - [`cache::CacheClient`] — read-through caching with stampede protection
//!   (null-sentinel penetration guard, mutex rebuild, logical expiry with a
//!   bounded background [`rebuild::RebuildPool`])
//! - [`lock::RedisLock`] — distributed mutual exclusion with holder tokens
//!   and compare-and-delete release
//! - [`id::IdGenerator`] — composite time-plus-counter unique IDs backed by
//!   the store's atomic increment
//! - [`seckill::SeckillAdmission`] — the atomic flash-sale admission script
//!   (stock check, duplicate check, reservation and enqueue in one unit)
//! - [`stream::OrderQueue`] — the durable order stream consumed by the
//!   materialization pipeline, with pending-list recovery
//!
//! # Connections
//!
//! Every component takes a [`redis::aio::ConnectionManager`], which
//! multiplexes one connection and reconnects transparently. Managers are
//! cheap to clone; construct one at startup with [`connect`] and hand
//! clones to each component.
//!
//! # Example
//!
//! ```no_run
//! use voucherflow_redis::{connect, seckill::SeckillAdmission};
//! use voucherflow_core::{UserId, VoucherId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let admission = SeckillAdmission::new(conn);
//! let outcome = admission.admit(VoucherId(1), UserId(42)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod id;
pub mod keys;
pub mod lock;
pub mod rebuild;
pub mod seckill;
pub mod stream;

use redis::aio::ConnectionManager;

/// Open a managed connection to the key-value store.
///
/// # Errors
///
/// Returns the underlying [`redis::RedisError`] if the URL is invalid or
/// the initial connection cannot be established.
pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!(url, "connected to key-value store");

    Ok(manager)
}
