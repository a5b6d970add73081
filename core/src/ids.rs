//! Identifier newtypes shared across the platform core.
//!
//! All identifiers are 64-bit values. Order identifiers are produced by the
//! composite ID generator in `voucherflow-redis`; user and voucher
//! identifiers are issued by the surrounding application and only flow
//! through this core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A buyer's identity, as issued by the account system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// A flash-sale voucher identity, as issued by the listing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoucherId(pub u64);

/// A generated order identity.
///
/// The upper 32 bits carry a second-granularity offset from a fixed epoch,
/// the lower 32 bits a store-side daily counter, so identifiers sort by
/// creation time within a second bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VoucherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for UserId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<u64> for VoucherId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<u64> for OrderId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let id = OrderId(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");

        let back: OrderId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_display_as_raw_numbers() {
        assert_eq!(UserId(7).to_string(), "7");
        assert_eq!(VoucherId(13).to_string(), "13");
    }
}
