//! The coin/bitcoin order book.
//!
//! Each side is a `BTreeMap` of price levels, best price first (bids keyed
//! by `Reverse(price)`). Inside a level, orders queue by arrival. An index
//! from order id to `(side, price)` finds any resting order without a scan
//! of the book.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use coinledger_types::{AccountId, CoinledgerError, Order, OrderId, OrderSide, Result};
use rust_decimal::Decimal;

/// Aggregated quantity at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub orders: usize,
}

/// Orders resting at one price, earliest first.
#[derive(Debug)]
struct Level {
    price: Decimal,
    queue: VecDeque<Order>,
}

impl Level {
    fn position(&self, order_id: &OrderId) -> Option<usize> {
        self.queue.iter().position(|o| o.id == *order_id)
    }

    fn summary(&self) -> DepthLevel {
        DepthLevel {
            price: self.price,
            quantity: self.queue.iter().map(|o| o.remaining).sum(),
            orders: self.queue.len(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<Reverse<Decimal>, Level>,
    asks: BTreeMap<Decimal, Level>,
    index: HashMap<OrderId, (OrderSide, Decimal)>,
}

impl OrderBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn level(&self, side: OrderSide, price: Decimal) -> Option<&Level> {
        match side {
            OrderSide::Buy => self.bids.get(&Reverse(price)),
            OrderSide::Sell => self.asks.get(&price),
        }
    }

    fn level_mut(&mut self, side: OrderSide, price: Decimal) -> Option<&mut Level> {
        match side {
            OrderSide::Buy => self.bids.get_mut(&Reverse(price)),
            OrderSide::Sell => self.asks.get_mut(&price),
        }
    }

    /// Levels of `side`, best price first.
    fn levels(&self, side: OrderSide) -> Box<dyn Iterator<Item = &Level> + '_> {
        match side {
            OrderSide::Buy => Box::new(self.bids.values()),
            OrderSide::Sell => Box::new(self.asks.values()),
        }
    }

    // =================================================================
    // Mutation
    // =================================================================

    /// Queue an order behind everything already resting at its price.
    pub fn insert_order(&mut self, order: Order) -> Result<()> {
        if self.index.contains_key(&order.id) {
            return Err(CoinledgerError::invalid(format!(
                "order {} already rests in the book",
                order.id
            )));
        }
        let (side, price) = (order.side, order.price);
        self.index.insert(order.id, (side, price));
        let empty = || Level {
            price,
            queue: VecDeque::new(),
        };
        let level = match side {
            OrderSide::Buy => self.bids.entry(Reverse(price)).or_insert_with(empty),
            OrderSide::Sell => self.asks.entry(price).or_insert_with(empty),
        };
        level.queue.push_back(order);
        Ok(())
    }

    /// Take an order out of the book. A level that empties goes with it.
    pub fn remove_order(&mut self, order_id: &OrderId) -> Result<Order> {
        let missing = || CoinledgerError::not_found(format!("order {order_id}"));
        let (side, price) = self.index.remove(order_id).ok_or_else(missing)?;
        let level = self.level_mut(side, price).ok_or_else(missing)?;
        let at = level.position(order_id).ok_or_else(missing)?;
        let order = level.queue.remove(at).ok_or_else(missing)?;
        if level.queue.is_empty() {
            match side {
                OrderSide::Buy => self.bids.remove(&Reverse(price)),
                OrderSide::Sell => self.asks.remove(&price),
            };
        }
        Ok(order)
    }

    // =================================================================
    // Queries
    // =================================================================

    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        let (side, price) = *self.index.get(order_id)?;
        let level = self.level(side, price)?;
        level.queue.iter().find(|o| o.id == *order_id)
    }

    pub fn get_mut(&mut self, order_id: &OrderId) -> Option<&mut Order> {
        let (side, price) = *self.index.get(order_id)?;
        let level = self.level_mut(side, price)?;
        level.queue.iter_mut().find(|o| o.id == *order_id)
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|r| r.0)
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Every resting order of `owner`, bids first, each side in priority order.
    pub fn orders_of(&self, owner: AccountId) -> impl Iterator<Item = &Order> {
        self.resting(OrderSide::Buy)
            .chain(self.resting(OrderSide::Sell))
            .filter(move |o| o.owner == owner)
    }

    /// Resting orders of one side in priority order.
    pub fn resting(&self, side: OrderSide) -> impl Iterator<Item = &Order> {
        self.levels(side).flat_map(|l| l.queue.iter())
    }

    /// Aggregated top `levels` of one side, best first.
    #[must_use]
    pub fn depth(&self, side: OrderSide, levels: usize) -> Vec<DepthLevel> {
        self.levels(side).take(levels).map(Level::summary).collect()
    }

    /// Resting orders an incoming `side` order limited at `limit` may trade
    /// against, in price-time priority.
    pub fn matchable(&self, side: OrderSide, limit: Decimal) -> impl Iterator<Item = &Order> {
        self.levels(side.opposite())
            .take_while(move |l| match side {
                OrderSide::Buy => l.price <= limit,
                OrderSide::Sell => l.price >= limit,
            })
            .flat_map(|l| l.queue.iter())
    }
}
