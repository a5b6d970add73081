//! `PostgreSQL`-backed authoritative order store.
//!
//! This crate implements [`VoucherOrderStore`] over two tables:
//!
//! ```sql
//! CREATE TABLE tb_seckill_voucher (
//!     voucher_id BIGINT PRIMARY KEY,
//!     begin_time TIMESTAMPTZ NOT NULL,
//!     end_time   TIMESTAMPTZ NOT NULL,
//!     stock      INT NOT NULL
//! );
//!
//! CREATE TABLE tb_voucher_order (
//!     id         BIGINT PRIMARY KEY,
//!     user_id    BIGINT NOT NULL,
//!     voucher_id BIGINT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! A materialization attempt is one transaction:
//!
//! 1. re-check `(user_id, voucher_id)` uniqueness — defense against the
//!    fast-store order marker being lost or bypassed;
//! 2. `UPDATE tb_seckill_voucher SET stock = stock - 1 WHERE voucher_id =
//!    $1 AND stock > 0` — the row lock taken by this conditional update is
//!    the durable oversell guard; zero affected rows aborts the attempt;
//! 3. insert the order row.
//!
//! Both aborts commit nothing and are reported as definitive
//! [`MaterializeOutcome`] values, which is what makes reprocessing under
//! at-least-once delivery idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use voucherflow_core::{
    MaterializeOutcome, OrderId, OrderStoreError, SeckillVoucher, UserId, VoucherId, VoucherOrder,
    VoucherOrderStore,
};

/// `PostgreSQL` implementation of [`VoucherOrderStore`].
///
/// # Example
///
/// ```no_run
/// use voucherflow_postgres::PgVoucherOrderStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PgVoucherOrderStore::connect("postgres://localhost/voucherflow").await?;
/// store.ensure_schema().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgVoucherOrderStore {
    pool: PgPool,
}

impl PgVoucherOrderStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url` with a small dedicated pool.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Unavailable`] if the connection cannot
    /// be established.
    pub async fn connect(url: &str) -> Result<Self, OrderStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        tracing::info!("connected to relational store");

        Ok(Self::new(pool))
    }

    /// The underlying pool, for callers that need raw access in tests.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the voucher and order tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Unavailable`] on database failure.
    pub async fn ensure_schema(&self) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tb_seckill_voucher (
                voucher_id BIGINT PRIMARY KEY,
                begin_time TIMESTAMPTZ NOT NULL,
                end_time   TIMESTAMPTZ NOT NULL,
                stock      INT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tb_voucher_order (
                id         BIGINT PRIMARY KEY,
                user_id    BIGINT NOT NULL,
                voucher_id BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_voucher_order_pair
             ON tb_voucher_order (user_id, voucher_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        Ok(())
    }

    /// Insert or update the voucher row. Administrative path; the fast
    /// store is seeded separately at publication time.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on database failure or id overflow.
    pub async fn upsert_voucher(&self, voucher: &SeckillVoucher) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            INSERT INTO tb_seckill_voucher (voucher_id, begin_time, end_time, stock)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (voucher_id) DO UPDATE
            SET begin_time = EXCLUDED.begin_time,
                end_time   = EXCLUDED.end_time,
                stock      = EXCLUDED.stock
            ",
        )
        .bind(db_id(voucher.voucher_id.0)?)
        .bind(voucher.begin_time)
        .bind(voucher.end_time)
        .bind(voucher.stock)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        Ok(())
    }

    /// Remaining stock for a voucher, or `None` if the row is missing.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on database failure or id overflow.
    pub async fn remaining_stock(
        &self,
        voucher_id: VoucherId,
    ) -> Result<Option<i32>, OrderStoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT stock FROM tb_seckill_voucher WHERE voucher_id = $1")
                .bind(db_id(voucher_id.0)?)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        Ok(row.map(|(stock,)| stock))
    }

    /// The order row for a `(user, voucher)` pair, if any.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on database failure or id overflow.
    pub async fn order_for(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<Option<VoucherOrder>, OrderStoreError> {
        let row: Option<(i64, i64, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, user_id, voucher_id, created_at
             FROM tb_voucher_order
             WHERE user_id = $1 AND voucher_id = $2",
        )
        .bind(db_id(user_id.0)?)
        .bind(db_id(voucher_id.0)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        row.map(|(id, user, voucher, created_at)| {
            Ok(VoucherOrder {
                id: OrderId(domain_id(id)?),
                user_id: UserId(domain_id(user)?),
                voucher_id: VoucherId(domain_id(voucher)?),
                created_at,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl VoucherOrderStore for PgVoucherOrderStore {
    async fn materialize(
        &self,
        order: &VoucherOrder,
    ) -> Result<MaterializeOutcome, OrderStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        let (existing,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tb_voucher_order
             WHERE user_id = $1 AND voucher_id = $2",
        )
        .bind(db_id(order.user_id.0)?)
        .bind(db_id(order.voucher_id.0)?)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        if existing > 0 {
            tx.rollback()
                .await
                .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;
            return Ok(MaterializeOutcome::AlreadyOrdered);
        }

        // The conditional update takes a row lock, so concurrent
        // materializations of the same voucher serialize here.
        let decremented = sqlx::query(
            "UPDATE tb_seckill_voucher
             SET stock = stock - 1
             WHERE voucher_id = $1 AND stock > 0",
        )
        .bind(db_id(order.voucher_id.0)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        if decremented.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;
            return Ok(MaterializeOutcome::OutOfStock);
        }

        sqlx::query(
            "INSERT INTO tb_voucher_order (id, user_id, voucher_id, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(db_id(order.id.0)?)
        .bind(db_id(order.user_id.0)?)
        .bind(db_id(order.voucher_id.0)?)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| OrderStoreError::Unavailable(e.to_string()))?;

        Ok(MaterializeOutcome::Created)
    }
}

/// Map a domain id onto the BIGINT column type.
fn db_id(raw: u64) -> Result<i64, OrderStoreError> {
    i64::try_from(raw)
        .map_err(|_| OrderStoreError::Malformed(format!("id {raw} exceeds the BIGINT range")))
}

/// Map a BIGINT column value back onto a domain id.
fn domain_id(raw: i64) -> Result<u64, OrderStoreError> {
    u64::try_from(raw)
        .map_err(|_| OrderStoreError::Malformed(format!("negative id {raw} in the store")))
}
