//! Testing utilities for the voucherflow workspace.
//!
//! Provides an in-memory [`VoucherOrderStore`] with the same observable
//! semantics as the `PostgreSQL` implementation (per-pair uniqueness,
//! conditional stock decrement) plus transient-failure injection, so the
//! materialization pipeline can be exercised without a database.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use voucherflow_core::{
    MaterializeOutcome, OrderStoreError, UserId, VoucherId, VoucherOrder, VoucherOrderStore,
};

/// Initialize tracing for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Inner {
    stock: std::collections::HashMap<VoucherId, i32>,
    orders: Vec<VoucherOrder>,
}

/// In-memory [`VoucherOrderStore`] mirroring the relational semantics.
///
/// # Example
///
/// ```
/// use voucherflow_core::VoucherId;
/// use voucherflow_testing::InMemoryVoucherOrderStore;
///
/// let store = InMemoryVoucherOrderStore::new();
/// store.stock_voucher(VoucherId(1), 100);
/// ```
#[derive(Default)]
pub struct InMemoryVoucherOrderStore {
    inner: Mutex<Inner>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemoryVoucherOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the relational stock for a voucher.
    pub fn stock_voucher(&self, voucher_id: VoucherId, stock: i32) {
        self.lock_inner().stock.insert(voucher_id, stock);
    }

    /// Make the next `count` materialization attempts fail with a
    /// transient [`OrderStoreError::Unavailable`].
    pub fn fail_next_materializations(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total materialization attempts observed, including injected
    /// failures.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Snapshot of the materialized orders.
    #[must_use]
    pub fn orders(&self) -> Vec<VoucherOrder> {
        self.lock_inner().orders.clone()
    }

    /// Remaining relational stock for a voucher.
    #[must_use]
    pub fn remaining_stock(&self, voucher_id: VoucherId) -> Option<i32> {
        self.lock_inner().stock.get(&voucher_id).copied()
    }

    /// Number of orders for one `(user, voucher)` pair.
    #[must_use]
    pub fn order_count(&self, user_id: UserId, voucher_id: VoucherId) -> usize {
        self.lock_inner()
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl VoucherOrderStore for InMemoryVoucherOrderStore {
    async fn materialize(
        &self,
        order: &VoucherOrder,
    ) -> Result<MaterializeOutcome, OrderStoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        // Injected transient failures come before any state change, like
        // a connection error would.
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(OrderStoreError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }

        let mut inner = self.lock_inner();

        let duplicate = inner
            .orders
            .iter()
            .any(|o| o.user_id == order.user_id && o.voucher_id == order.voucher_id);
        if duplicate {
            return Ok(MaterializeOutcome::AlreadyOrdered);
        }

        match inner.stock.get_mut(&order.voucher_id) {
            Some(stock) if *stock > 0 => *stock -= 1,
            _ => return Ok(MaterializeOutcome::OutOfStock),
        }

        inner.orders.push(*order);
        Ok(MaterializeOutcome::Created)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use voucherflow_core::OrderId;

    fn order(id: u64, user: u64, voucher: u64) -> VoucherOrder {
        VoucherOrder {
            id: OrderId(id),
            user_id: UserId(user),
            voucher_id: VoucherId(voucher),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enforces_per_pair_uniqueness() {
        let store = InMemoryVoucherOrderStore::new();
        store.stock_voucher(VoucherId(1), 10);

        let first = store.materialize(&order(1, 42, 1)).await.unwrap();
        let second = store.materialize(&order(2, 42, 1)).await.unwrap();

        assert_eq!(first, MaterializeOutcome::Created);
        assert_eq!(second, MaterializeOutcome::AlreadyOrdered);
        assert_eq!(store.order_count(UserId(42), VoucherId(1)), 1);
        assert_eq!(store.remaining_stock(VoucherId(1)), Some(9));
    }

    #[tokio::test]
    async fn refuses_to_oversell() {
        let store = InMemoryVoucherOrderStore::new();
        store.stock_voucher(VoucherId(1), 1);

        assert_eq!(
            store.materialize(&order(1, 1, 1)).await.unwrap(),
            MaterializeOutcome::Created
        );
        assert_eq!(
            store.materialize(&order(2, 2, 1)).await.unwrap(),
            MaterializeOutcome::OutOfStock
        );
        assert_eq!(store.remaining_stock(VoucherId(1)), Some(0));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryVoucherOrderStore::new();
        store.stock_voucher(VoucherId(1), 1);
        store.fail_next_materializations(1);

        assert!(store.materialize(&order(1, 1, 1)).await.is_err());
        assert_eq!(
            store.materialize(&order(1, 1, 1)).await.unwrap(),
            MaterializeOutcome::Created
        );
        assert_eq!(store.attempts(), 2);
    }
}
