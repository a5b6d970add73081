//! Asynchronous order materialization.
//!
//! A single dedicated worker drains admitted-order messages from the
//! durable stream and writes the authoritative order rows. The buyer
//! already received their outcome at admission time; this pipeline has no
//! caller-visible error channel and instead retries through the stream's
//! pending list until the infrastructure recovers.
//!
//! # Per-message state machine
//!
//! ```text
//! read ──► parse ──► lock(user) ──► validate + write ──► ack ──► unlock
//!            │            │                │
//!            │ malformed  │ busy           │ transient fault
//!            ▼            ▼                ▼
//!          log+ack      log+ack      leave un-acked ──► pending drain
//! ```
//!
//! - A malformed entry can never succeed; it is logged and acknowledged.
//! - A busy per-user lock means a same-user duplicate is already in
//!   flight; the message is logged and acknowledged.
//! - The store write returns a definitive [`MaterializeOutcome`]
//!   (created / already ordered / out of stock) — all acknowledged — or a
//!   transient [`OrderStoreError`], which leaves the entry pending.
//!
//! # Recovery
//!
//! After any transient fault the loop switches to the pending-list drain:
//! it re-reads this consumer's own delivered-but-unacknowledged entries
//! from the start of the range and reprocesses them with the same state
//! machine, returning to normal polling once the range is empty. Combined
//! with the store's uniqueness check and conditional decrement this gives
//! effectively-exactly-once materialization over at-least-once delivery.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voucherflow_worker::OrderMaterializer;
//! # async fn example(
//! #     conn: redis::aio::ConnectionManager,
//! #     store: Arc<dyn voucherflow_core::VoucherOrderStore>,
//! # ) {
//! let worker = OrderMaterializer::new(conn, store).spawn();
//! // ... serve traffic ...
//! worker.shutdown().await;
//! # }
//! ```

use chrono::Utc;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use voucherflow_core::{MaterializeOutcome, OrderStoreError, VoucherOrderStore};
use voucherflow_redis::keys::{ORDER_LOCK_TTL, order_lock_name};
use voucherflow_redis::lock::{LockError, RedisLock};
use voucherflow_redis::stream::{OrderQueue, QueueError, QueuedOrder};

/// Default sleep between retries while the pending drain is failing.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that mark a message as transiently failed.
///
/// Any of these leaves the triggering entry un-acknowledged so the
/// pending-list drain retries it.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Stream read or acknowledgement failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Per-user lock operations failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The authoritative store failed mid-write.
    #[error(transparent)]
    Store(#[from] OrderStoreError),
}

/// The order materialization worker.
///
/// Construct with [`new`](Self::new), adjust via the `with_*` methods,
/// then [`spawn`](Self::spawn) the background loop.
pub struct OrderMaterializer {
    queue: OrderQueue,
    store: Arc<dyn VoucherOrderStore>,
    conn: ConnectionManager,
    lock_ttl: Duration,
    retry_delay: Duration,
}

impl OrderMaterializer {
    /// Create a worker reading the default queue and writing through
    /// `store`.
    #[must_use]
    pub fn new(conn: ConnectionManager, store: Arc<dyn VoucherOrderStore>) -> Self {
        let queue = OrderQueue::new(conn.clone());
        Self {
            queue,
            store,
            conn,
            lock_ttl: ORDER_LOCK_TTL,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the queue handle (stream key, group, batch size, block
    /// timeout).
    #[must_use]
    pub fn with_queue(mut self, queue: OrderQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Override the per-user lock TTL. Must exceed the expected
    /// relational write duration with margin.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override the sleep between failing recovery retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start the background loop and return its handle.
    #[must_use]
    pub fn spawn(self) -> MaterializerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));

        MaterializerHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(error) = self.queue.ensure_group().await {
            tracing::error!(%error, "consumer group creation failed; reads will retry");
        }

        tracing::info!("order materializer started");

        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.queue.read_new() => batch,
            };

            match batch {
                Ok(entries) => {
                    if !self.process_batch(entries, &shutdown).await {
                        self.drain_pending(&shutdown).await;
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "stream read failed; draining pending list");
                    self.drain_pending(&shutdown).await;
                }
            }
        }

        tracing::info!("order materializer stopped");
    }

    /// Process one delivered batch. Returns `false` when a transient
    /// fault occurred; the entries behind the fault stay pending.
    async fn process_batch(
        &self,
        entries: Vec<QueuedOrder>,
        shutdown: &watch::Receiver<bool>,
    ) -> bool {
        for entry in entries {
            if *shutdown.borrow() {
                // Remaining entries stay in the pending range for the
                // next incarnation of this consumer.
                return true;
            }

            if let Err(error) = self.process(&entry).await {
                tracing::error!(
                    entry_id = %entry.entry_id,
                    %error,
                    "order processing failed"
                );
                return false;
            }
        }

        true
    }

    /// Run the per-message state machine for one entry.
    ///
    /// `Ok(())` means the entry reached a definitive outcome and was
    /// acknowledged; `Err` means a transient fault left it pending.
    async fn process(&self, entry: &QueuedOrder) -> Result<(), WorkerError> {
        let message = match &entry.payload {
            Ok(message) => *message,
            Err(reason) => {
                // Replaying a malformed entry can never succeed.
                tracing::warn!(
                    entry_id = %entry.entry_id,
                    reason = %reason,
                    "discarding malformed order message"
                );
                metrics::counter!("orders.poison").increment(1);
                self.queue.ack(&entry.entry_id).await?;
                return Ok(());
            }
        };

        let lock = RedisLock::new(
            self.conn.clone(),
            &order_lock_name(message.user_id),
            self.lock_ttl,
        );

        if !lock.try_lock().await? {
            // Another worker already holds this user's order lock; the
            // duplicate in flight will settle the pair.
            tracing::warn!(
                user_id = %message.user_id,
                voucher_id = %message.voucher_id,
                "another order for this user is in flight, dropping message"
            );
            self.queue.ack(&entry.entry_id).await?;
            return Ok(());
        }

        let order = message.into_order(Utc::now());
        let written = self.store.materialize(&order).await;

        let outcome = match written {
            Ok(outcome) => outcome,
            Err(error) => {
                // Transient: leave the entry pending for the drain.
                self.release(&lock).await;
                return Err(WorkerError::Store(error));
            }
        };

        match outcome {
            MaterializeOutcome::Created => {
                tracing::debug!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "order materialized"
                );
                metrics::counter!("orders.materialized").increment(1);
            }
            MaterializeOutcome::AlreadyOrdered => {
                tracing::debug!(
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "duplicate delivery ignored"
                );
                metrics::counter!("orders.replayed").increment(1);
            }
            MaterializeOutcome::OutOfStock => {
                // The admission script should make this unreachable; an
                // occurrence is a lost admission for monitoring to catch.
                tracing::error!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "relational stock guard tripped after admission"
                );
                metrics::counter!("orders.lost_admissions").increment(1);
            }
        }

        let acked = self.queue.ack(&entry.entry_id).await;
        self.release(&lock).await;
        acked?;

        Ok(())
    }

    /// Reprocess this consumer's pending range until it is empty.
    ///
    /// Keeps retrying through store outages: each failed pass sleeps
    /// briefly and re-reads from the start of the range. Aborts early on
    /// shutdown; whatever remains pending is picked up after restart.
    async fn drain_pending(&self, shutdown: &watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.queue.read_pending().await {
                Ok(entries) if entries.is_empty() => {
                    tracing::debug!("pending list drained");
                    return;
                }
                Ok(entries) => {
                    for entry in entries {
                        if *shutdown.borrow() {
                            return;
                        }
                        if let Err(error) = self.process(&entry).await {
                            tracing::warn!(
                                entry_id = %entry.entry_id,
                                %error,
                                "pending entry reprocessing failed"
                            );
                            tokio::time::sleep(self.retry_delay).await;
                            break;
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "pending list read failed");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn release(&self, lock: &RedisLock) {
        if let Err(error) = lock.unlock().await {
            tracing::warn!(
                key = lock.key(),
                %error,
                "unlock failed; TTL will reclaim the lock"
            );
        }
    }
}

/// Handle on a spawned [`OrderMaterializer`].
pub struct MaterializerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaterializerHandle {
    /// Signal the worker to stop and wait for it to finish its current
    /// message.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        if let Err(error) = self.task.await {
            tracing::error!(%error, "materializer task failed to join");
        }
    }
}
