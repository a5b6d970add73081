//! Voucher orders, admission messages and the authoritative store seam.
//!
//! An [`AdmissionMessage`] is produced by the atomic admission script the
//! moment a buyer wins a slot; it travels over the durable order stream with
//! at-least-once delivery. The materialization pipeline turns it into a
//! [`VoucherOrder`] row through a [`VoucherOrderStore`], whose
//! implementation must make reprocessing idempotent: the in-transaction
//! uniqueness check plus the conditional stock decrement turn duplicate
//! deliveries into no-ops.

use crate::ids::{OrderId, UserId, VoucherId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The message enqueued by the admission script for one admitted order.
///
/// On the wire this is a flat field map (`id`, `user_id`, `voucher_id`),
/// so it can be written by a server-side script without any serialization
/// library on the store side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionMessage {
    /// Pre-generated order identity.
    pub id: OrderId,

    /// The admitted buyer.
    pub user_id: UserId,

    /// The voucher a slot was reserved for.
    pub voucher_id: VoucherId,
}

impl AdmissionMessage {
    /// Materialize this message into an order entity stamped at `now`.
    #[must_use]
    pub const fn into_order(self, now: DateTime<Utc>) -> VoucherOrder {
        VoucherOrder {
            id: self.id,
            user_id: self.user_id,
            voucher_id: self.voucher_id,
            created_at: now,
        }
    }
}

/// The authoritative order row.
///
/// Created at most once per `(user_id, voucher_id)` pair and immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    /// Order identity, generated before admission.
    pub id: OrderId,

    /// The buyer.
    pub user_id: UserId,

    /// The voucher bought.
    pub voucher_id: VoucherId,

    /// When the order row was materialized.
    pub created_at: DateTime<Utc>,
}

/// Outcome of one materialization attempt.
///
/// All three values are definitive: the message that produced them must be
/// acknowledged. Only an [`OrderStoreError`] leaves a message eligible for
/// redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// The order row was written and stock decremented.
    Created,

    /// A row for this `(user, voucher)` pair already exists; nothing was
    /// written. Expected under at-least-once redelivery.
    AlreadyOrdered,

    /// The conditional decrement affected zero rows; nothing was written.
    /// The admission script should make this unreachable, so an occurrence
    /// is a lost admission to surface via monitoring.
    OutOfStock,
}

/// Errors raised by a [`VoucherOrderStore`].
///
/// Every variant is a transient infrastructure fault: the caller must treat
/// the attempt as retryable and leave the triggering message
/// un-acknowledged.
#[derive(Debug, Error)]
pub enum OrderStoreError {
    /// The store could not be reached or the transaction failed mid-flight.
    #[error("order store unavailable: {0}")]
    Unavailable(String),

    /// A value read from the store did not fit the expected shape.
    #[error("order store returned malformed data: {0}")]
    Malformed(String),
}

/// Authoritative sink for admitted orders.
///
/// Implementations perform, inside a single transaction:
///
/// 1. a `(user_id, voucher_id)` uniqueness re-check — defense against the
///    fast-store marker being lost or bypassed;
/// 2. the conditional stock decrement — the durable oversell guard;
/// 3. the order-row insert.
///
/// # Implementations
///
/// - `PgVoucherOrderStore` in `voucherflow-postgres` for production
/// - `InMemoryVoucherOrderStore` in `voucherflow-testing` for tests
#[async_trait]
pub trait VoucherOrderStore: Send + Sync {
    /// Attempt to write `order` as the authoritative record.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] only for transient infrastructure
    /// faults; business aborts are [`MaterializeOutcome`] values.
    async fn materialize(&self, order: &VoucherOrder)
    -> Result<MaterializeOutcome, OrderStoreError>;
}
