//! Flash-sale voucher entity.

use crate::ids::VoucherId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A voucher offered through the flash-sale channel.
///
/// The relational store owns the authoritative `stock` column; it is only
/// ever decremented through the conditional
/// `stock = stock - 1 WHERE voucher_id = ? AND stock > 0` update, which is
/// the durable-layer oversell guard. The fast-store stock counter seeded at
/// publication time is the primary guard and is mutated exclusively by the
/// atomic admission script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    /// Identity of the voucher.
    pub voucher_id: VoucherId,

    /// When the sale window opens.
    pub begin_time: DateTime<Utc>,

    /// When the sale window closes.
    pub end_time: DateTime<Utc>,

    /// Remaining units available for sale.
    pub stock: i32,
}

impl SeckillVoucher {
    /// Whether the sale window is open at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.begin_time <= now && now <= self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn window_bounds_are_inclusive() {
        let now = Utc::now();
        let voucher = SeckillVoucher {
            voucher_id: VoucherId(1),
            begin_time: now,
            end_time: now + Duration::hours(1),
            stock: 100,
        };

        assert!(voucher.is_open_at(now));
        assert!(voucher.is_open_at(now + Duration::hours(1)));
        assert!(!voucher.is_open_at(now - Duration::seconds(1)));
        assert!(!voucher.is_open_at(now + Duration::hours(2)));
    }
}
