//! Order types for the coin/bitcoin book.
//!
//! Every order enters the book with its funds already reserved: native coin
//! for sells, `quantity × price` bitcoin for buys. `reserved` tracks what is
//! still held for the unfilled part.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, Bucket, OrderId};

/// Which side of the book this order is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The bucket funds are reserved from when placing on this side.
    #[must_use]
    pub fn reserve_bucket(self) -> Bucket {
        match self {
            Self::Buy => Bucket::Bitcoin,
            Self::Sell => Bucket::Native,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle status of an order.
///
/// `Open` and `PartiallyFilled` are the only states with `remaining > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A limit order on the coin/bitcoin book. Prices are in bitcoin per coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner: AccountId,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: Decimal,
    pub quantity: Decimal,
    pub remaining: Decimal,
    /// Funds still held for this order in [`OrderSide::reserve_bucket`].
    pub reserved: Decimal,
    /// Book arrival sequence; the time-priority tie-break.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Whether this order trades against a counter-order priced at `price`.
    #[must_use]
    pub fn crosses(&self, price: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => self.price >= price,
            OrderSide::Sell => self.price <= price,
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.remaining.is_zero()
    }

    #[must_use]
    pub fn filled_qty(&self) -> Decimal {
        self.quantity - self.remaining
    }

    /// Apply a fill of `qty`, updating status and timestamp.
    pub fn apply_fill(&mut self, qty: Decimal, now: DateTime<Utc>) {
        self.remaining -= qty;
        self.status = if self.remaining.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Order {
    pub fn dummy_limit(owner: AccountId, side: OrderSide, price: Decimal, qty: Decimal) -> Self {
        let reserved = match side {
            OrderSide::Buy => crate::amount::notional(qty, price),
            OrderSide::Sell => qty,
        };
        Self {
            id: OrderId::new(),
            owner,
            side,
            status: OrderStatus::Open,
            price,
            quantity: qty,
            remaining: qty,
            reserved,
            sequence: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
