//! # Voucherflow Core
//!
//! Core domain types and store traits for the voucherflow order-admission
//! platform.
//!
//! This crate defines the vocabulary shared by the infrastructure crates:
//! identifier newtypes, the flash-sale voucher and order entities, the
//! admission message that travels over the durable order stream, and the
//! [`order::VoucherOrderStore`] trait that the materialization pipeline
//! writes through.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   atomic script    ┌────────────────┐
//! │  Admission   │───────────────────►│  Order stream  │
//! │  (KV store)  │  reserve + enqueue │  (KV store)    │
//! └──────────────┘                    └───────┬────────┘
//!                                             │ at-least-once
//!                                             ▼
//!                                     ┌────────────────┐
//!                                     │  Materializer  │
//!                                     │  (worker loop) │
//!                                     └───────┬────────┘
//!                                             │ VoucherOrderStore
//!                                             ▼
//!                                     ┌────────────────┐
//!                                     │   Relational   │◄── source of truth
//!                                     │     store      │
//!                                     └────────────────┘
//! ```
//!
//! ## Key Principles
//!
//! - **Admission is decided in the fast store**: the relational write is
//!   asynchronous and idempotent, never on the buyer's critical path.
//! - **Contention is data, not errors**: sold-out, duplicate-order and
//!   lock-busy outcomes are enum values; error types are reserved for
//!   infrastructure faults.
//! - **Traits at the seams**: the pipeline depends on
//!   [`order::VoucherOrderStore`], not on a concrete database client, so
//!   tests can drive it against an in-memory implementation.

pub mod ids;
pub mod order;
pub mod voucher;

pub use ids::{OrderId, UserId, VoucherId};
pub use order::{
    AdmissionMessage, MaterializeOutcome, OrderStoreError, VoucherOrder, VoucherOrderStore,
};
pub use voucher::SeckillVoucher;
