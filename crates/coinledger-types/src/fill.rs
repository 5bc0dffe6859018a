//! Fill records produced by the continuous matcher.
//!
//! A [`Fill`] is the immutable record of one match between an incoming
//! (taker) order and a resting (maker) order at the maker's price.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, OrderId, OrderSide};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Monotonic fill sequence number across the whole book.
    pub seq: u64,
    pub taker_order_id: OrderId,
    pub maker_order_id: OrderId,
    pub buyer: AccountId,
    pub seller: AccountId,
    /// Executed quantity in native coin.
    pub amount: Decimal,
    /// Execution price, always the resting order's price.
    pub price: Decimal,
    /// Bitcoin paid to the seller: `amount × price`, truncated.
    pub bitcoin_amount: Decimal,
    /// Which side the incoming order was on.
    pub taker_side: OrderSide,
    pub executed_at: DateTime<Utc>,
}

impl Fill {
    #[must_use]
    pub fn taker_is_buyer(&self) -> bool {
        self.taker_side == OrderSide::Buy
    }
}

impl std::fmt::Display for Fill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fill[{}] {} {} @ {} = {}",
            self.seq, self.taker_side, self.amount, self.price, self.bitcoin_amount,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_display_and_side() {
        let fill = Fill {
            seq: 3,
            taker_order_id: OrderId::new(),
            maker_order_id: OrderId::new(),
            buyer: AccountId(1),
            seller: AccountId(2),
            amount: Decimal::new(10, 0),
            price: Decimal::new(5, 0),
            bitcoin_amount: Decimal::new(50, 0),
            taker_side: OrderSide::Buy,
            executed_at: Utc::now(),
        };
        assert!(fill.taker_is_buyer());
        let s = fill.to_string();
        assert!(s.contains("Fill[3]"));
        assert!(s.contains("BUY"));
        assert!(s.contains("@ 5"));
    }
}
