//! Continuous matching over a single coin/bitcoin book.
//!
//! ## Placement
//!
//! 1. Validate amount and price, compute the reservation.
//! 2. Walk the opposite side in price-time priority while it crosses,
//!    planning each leg at the **resting** order's price.
//! 3. Commit the reservation and every leg in one ledger batch over the
//!    taker and all makers. If the reservation cannot be debited nothing
//!    in the book changes.
//! 4. Apply the legs to the book, append fills, rest any remainder.
//!
//! ## Reservation accounting
//!
//! A buy reserves `notional(quantity, price)` bitcoin. Each leg charges the
//! buyer `notional(amount, own price)` out of that reserve, or everything
//! still reserved on the leg that completes the order. The seller receives
//! `notional(amount, trade price)`; the difference goes back to the buyer.
//! A sell reserves its quantity in native coin and releases exactly the
//! filled amount to the buyer on each leg.
//!
//! The book lock is always taken before any account lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use coinledger_ledger::Ledger;
use coinledger_types::{
    AccountId, Bucket, CoinledgerError, Fill, MarketConfig, OpTag, Order, OrderId, OrderSide,
    OrderStatus, Result,
    amount::{notional, require_positive},
};
use rust_decimal::Decimal;

use crate::{
    fill_tape,
    orderbook::{DepthLevel, OrderBook},
};

/// Result of placing an order.
#[derive(Debug, Clone)]
pub struct Placement {
    /// The incoming order after matching.
    pub order: Order,
    pub fills: Vec<Fill>,
    /// Bitcoin returned to the incoming buyer because it traded below its limit.
    pub refunded: Decimal,
}

impl Placement {
    #[must_use]
    pub fn filled_qty(&self) -> Decimal {
        self.fills.iter().map(|f| f.amount).sum()
    }
}

/// One planned match between the incoming order and a resting order.
#[derive(Debug, Clone)]
struct Leg {
    maker_id: OrderId,
    buyer: AccountId,
    seller: AccountId,
    amount: Decimal,
    price: Decimal,
    bitcoin: Decimal,
    /// Bitcoin taken out of the buyer's reservation for this leg.
    buyer_charge: Decimal,
    /// Reservation released from the incoming order.
    taker_release: Decimal,
    /// Reservation released from the resting order.
    maker_release: Decimal,
}

impl Leg {
    fn refund(&self) -> Decimal {
        self.buyer_charge - self.bitcoin
    }
}

#[derive(Debug, Default)]
struct BookState {
    book: OrderBook,
    /// Filled and cancelled orders, kept for lookups.
    closed: HashMap<OrderId, Order>,
    fills: Vec<Fill>,
    next_sequence: u64,
}

pub struct MatchingEngine {
    ledger: Arc<Ledger>,
    config: MarketConfig,
    state: Mutex<BookState>,
}

impl MatchingEngine {
    #[must_use]
    pub fn new(ledger: Arc<Ledger>, config: MarketConfig) -> Self {
        Self {
            ledger,
            config,
            state: Mutex::new(BookState::default()),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =================================================================
    // Placement
    // =================================================================

    /// Reserve funds for a limit order, match it, and rest the remainder.
    ///
    /// # Errors
    /// - [`CoinledgerError::InvalidArgument`] for a non-positive or
    ///   over-precise amount/price, or an order below the minimum size.
    /// - [`CoinledgerError::InsufficientFunds`] if the reservation fails.
    /// - [`CoinledgerError::OrderLimitExceeded`] when the owner is at the cap.
    pub fn place_order(
        &self,
        owner: AccountId,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> Result<Placement> {
        require_positive("amount", amount)?;
        require_positive("price", price)?;
        if amount < self.config.min_order_amount {
            return Err(CoinledgerError::invalid(format!(
                "amount {amount} is below the minimum order size {}",
                self.config.min_order_amount
            )));
        }
        let reserve = match side {
            OrderSide::Sell => amount,
            OrderSide::Buy => notional(amount, price),
        };
        if reserve.is_zero() {
            return Err(CoinledgerError::invalid(format!(
                "order value {amount} x {price} rounds to zero"
            )));
        }

        let mut state = self.state();
        let limit = self.config.max_open_orders_per_account;
        if limit > 0 && state.book.orders_of(owner).count() >= limit {
            return Err(CoinledgerError::OrderLimitExceeded { account: owner, limit });
        }

        let now = Utc::now();
        let mut taker = Order {
            id: OrderId::new(),
            owner,
            side,
            status: OrderStatus::Open,
            price,
            quantity: amount,
            remaining: amount,
            reserved: reserve,
            sequence: state.next_sequence,
            created_at: now,
            updated_at: now,
        };

        let legs = plan_legs(&state.book, &taker);
        let mut ids = vec![owner];
        ids.extend(legs.iter().flat_map(|l| [l.buyer, l.seller]));

        self.ledger.batch(&ids, |b| {
            b.set_reference(taker.id.to_string());
            b.debit(owner, side.reserve_bucket(), reserve, OpTag::OrderReserve)?;
            for leg in &legs {
                b.credit(leg.buyer, Bucket::Native, leg.amount, OpTag::OrderFill)?;
                b.credit(leg.seller, Bucket::Bitcoin, leg.bitcoin, OpTag::OrderFill)?;
                b.credit(leg.buyer, Bucket::Bitcoin, leg.refund(), OpTag::OrderRefund)?;
            }
            Ok(())
        })?;

        // Committed. From here on only the in-memory book changes.
        state.next_sequence += 1;
        let mut fills = Vec::with_capacity(legs.len());
        let mut refunded = Decimal::ZERO;
        for leg in &legs {
            state.settle_maker(leg, now);
            taker.apply_fill(leg.amount, now);
            taker.reserved -= leg.taker_release;
            if side == OrderSide::Buy {
                refunded += leg.refund();
            }

            let fill = Fill {
                seq: state.fills.len() as u64,
                taker_order_id: taker.id,
                maker_order_id: leg.maker_id,
                buyer: leg.buyer,
                seller: leg.seller,
                amount: leg.amount,
                price: leg.price,
                bitcoin_amount: leg.bitcoin,
                taker_side: side,
                executed_at: now,
            };
            tracing::info!(%fill, buyer = %fill.buyer, seller = %fill.seller, "fill");
            state.fills.push(fill.clone());
            fills.push(fill);
        }

        if taker.is_filled() {
            state.closed.insert(taker.id, taker.clone());
        } else {
            state.book.insert_order(taker.clone())?;
        }
        tracing::debug!(
            order = %taker.id,
            account = %owner,
            %side,
            %amount,
            %price,
            fills = fills.len(),
            remaining = %taker.remaining,
            "order placed"
        );

        Ok(Placement {
            order: taker,
            fills,
            refunded,
        })
    }

    // =================================================================
    // Cancellation
    // =================================================================

    /// Cancel a live order of `owner`, returning its unused reservation.
    ///
    /// # Errors
    /// [`CoinledgerError::NotFound`] when the order does not exist, belongs
    /// to someone else, or is already filled or cancelled. Nothing is
    /// refunded in those cases.
    pub fn cancel_order(&self, owner: AccountId, order_id: OrderId) -> Result<Order> {
        let mut state = self.state();
        let Some(resting) = state.book.get(&order_id).filter(|o| o.owner == owner) else {
            return Err(match state.closed.get(&order_id) {
                Some(o) if o.owner == owner => {
                    CoinledgerError::not_found(format!("order {order_id} is {}", o.status))
                }
                _ => CoinledgerError::not_found(format!("order {order_id}")),
            });
        };

        let bucket = resting.side.reserve_bucket();
        let refund = resting.reserved;
        self.ledger.batch(&[owner], |b| {
            b.set_reference(order_id.to_string());
            b.credit(owner, bucket, refund, OpTag::OrderCancel)
        })?;

        let mut order = state.book.remove_order(&order_id)?;
        order.reserved = Decimal::ZERO;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        state.closed.insert(order.id, order.clone());
        tracing::info!(order = %order_id, account = %owner, %refund, %bucket, "order cancelled");
        Ok(order)
    }

    // =================================================================
    // Queries
    // =================================================================

    /// Any order ever placed, live or terminal.
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        let state = self.state();
        state
            .book
            .get(&order_id)
            .or_else(|| state.closed.get(&order_id))
            .cloned()
    }

    /// Live orders of one account.
    #[must_use]
    pub fn open_orders(&self, owner: AccountId) -> Vec<Order> {
        self.state().book.orders_of(owner).cloned().collect()
    }

    #[must_use]
    pub fn fills(&self) -> Vec<Fill> {
        self.state().fills.clone()
    }

    /// Fills in which `account` bought or sold.
    #[must_use]
    pub fn fills_for(&self, account: AccountId) -> Vec<Fill> {
        self.state()
            .fills
            .iter()
            .filter(|f| f.buyer == account || f.seller == account)
            .cloned()
            .collect()
    }

    /// Hex digest of the whole fill tape.
    #[must_use]
    pub fn fill_root(&self) -> String {
        fill_tape::fill_root_hex(&self.state().fills)
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.state().book.best_bid()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.state().book.best_ask()
    }

    #[must_use]
    pub fn depth(&self, side: OrderSide, levels: usize) -> Vec<DepthLevel> {
        self.state().book.depth(side, levels)
    }

    /// Σ reservations of resting orders held out of `bucket`. Matches the
    /// ledger's held total for the bucket when the book is the only holder.
    #[must_use]
    pub fn reserved(&self, bucket: Bucket) -> Decimal {
        let state = self.state();
        [OrderSide::Buy, OrderSide::Sell]
            .into_iter()
            .filter(|s| s.reserve_bucket() == bucket)
            .flat_map(|s| state.book.resting(s))
            .map(|o| o.reserved)
            .sum()
    }
}

impl BookState {
    /// Apply one leg to its resting order, closing it when filled.
    fn settle_maker(&mut self, leg: &Leg, now: DateTime<Utc>) {
        let Some(maker) = self.book.get_mut(&leg.maker_id) else {
            tracing::error!(order = %leg.maker_id, "resting order vanished during settlement");
            return;
        };
        maker.apply_fill(leg.amount, now);
        maker.reserved -= leg.maker_release;
        if !maker.is_filled() {
            return;
        }
        match self.book.remove_order(&leg.maker_id) {
            Ok(done) => {
                self.closed.insert(done.id, done);
            }
            Err(e) => tracing::error!(order = %leg.maker_id, error = %e, "failed to close filled order"),
        }
    }
}

/// Plan the legs an incoming order would execute against `book`.
fn plan_legs(book: &OrderBook, taker: &Order) -> Vec<Leg> {
    let mut legs = Vec::new();
    let mut remaining = taker.remaining;
    let mut taker_reserved = taker.reserved;

    for maker in book.matchable(taker.side, taker.price) {
        if remaining.is_zero() {
            break;
        }
        let amount = remaining.min(maker.remaining);
        let price = maker.price;
        let bitcoin = notional(amount, price);
        if amount.is_zero() || bitcoin.is_zero() {
            continue;
        }
        remaining -= amount;

        let leg = match taker.side {
            OrderSide::Buy => {
                let charge = if remaining.is_zero() {
                    taker_reserved
                } else {
                    notional(amount, taker.price)
                };
                taker_reserved -= charge;
                Leg {
                    maker_id: maker.id,
                    buyer: taker.owner,
                    seller: maker.owner,
                    amount,
                    price,
                    bitcoin,
                    buyer_charge: charge,
                    taker_release: charge,
                    maker_release: amount,
                }
            }
            OrderSide::Sell => {
                let charge = if amount == maker.remaining {
                    maker.reserved
                } else {
                    notional(amount, maker.price)
                };
                taker_reserved -= amount;
                Leg {
                    maker_id: maker.id,
                    buyer: maker.owner,
                    seller: taker.owner,
                    amount,
                    price,
                    bitcoin,
                    buyer_charge: charge,
                    taker_release: amount,
                    maker_release: charge,
                }
            }
        };
        legs.push(leg);
    }
    legs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn setup() -> (MatchingEngine, AccountId, AccountId) {
        let ledger = Arc::new(Ledger::default());
        let (alice, bob) = (AccountId(1), AccountId(2));
        for id in [alice, bob] {
            ledger.open_account(id);
            ledger.credit(id, Bucket::Native, d(1_000), OpTag::Deposit).unwrap();
            ledger.credit(id, Bucket::Bitcoin, d(1_000), OpTag::Deposit).unwrap();
        }
        (MatchingEngine::new(ledger, MarketConfig::default()), alice, bob)
    }

    fn bal(engine: &MatchingEngine, id: AccountId, bucket: Bucket) -> Decimal {
        engine.ledger().balance(id, bucket).unwrap()
    }

    #[test]
    fn sell_without_cross_reserves_amount() {
        let (engine, alice, _) = setup();
        let placed = engine.place_order(alice, OrderSide::Sell, d(7), d(3)).unwrap();
        assert!(placed.fills.is_empty());
        assert_eq!(placed.order.status, OrderStatus::Open);
        assert_eq!(bal(&engine, alice, Bucket::Native), d(993));
        assert_eq!(bal(&engine, alice, Bucket::Bitcoin), d(1_000));
        assert_eq!(engine.best_ask(), Some(d(3)));
        assert_eq!(engine.open_orders(alice).len(), 1);
    }

    #[test]
    fn resting_bid_price_wins() {
        let (engine, alice, bob) = setup();
        let bid = engine.place_order(alice, OrderSide::Buy, d(4), d(100)).unwrap();
        let ask = engine.place_order(bob, OrderSide::Sell, d(4), d(90)).unwrap();

        assert_eq!(ask.fills.len(), 1);
        assert_eq!(ask.fills[0].price, d(100));
        assert_eq!(ask.order.remaining, Decimal::ZERO);
        let resting = engine.order(bid.order.id).unwrap();
        assert_eq!(resting.remaining, Decimal::ZERO);
        assert_eq!(resting.status, OrderStatus::Filled);
        assert_eq!(resting.reserved, Decimal::ZERO);

        assert_eq!(bal(&engine, bob, Bucket::Bitcoin), d(1_400));
        assert_eq!(bal(&engine, alice, Bucket::Bitcoin), d(600));
        assert_eq!(bal(&engine, alice, Bucket::Native), d(1_004));
        assert!(engine.open_orders(alice).is_empty());
    }

    #[test]
    fn partial_fill_refunds_price_improvement() {
        let (engine, alice, bob) = setup();
        engine.place_order(alice, OrderSide::Sell, d(10), d(5)).unwrap();
        let buy = engine.place_order(bob, OrderSide::Buy, d(15), d(6)).unwrap();

        assert_eq!(buy.filled_qty(), d(10));
        assert_eq!(buy.fills[0].price, d(5));
        assert_eq!(buy.order.remaining, d(5));
        assert_eq!(buy.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(buy.refunded, d(10));
        assert_eq!(buy.order.reserved, d(30));
        // reserved 90, paid 50, refunded 10
        assert_eq!(bal(&engine, bob, Bucket::Bitcoin), d(920));
        assert_eq!(bal(&engine, bob, Bucket::Native), d(1_010));
        assert_eq!(bal(&engine, alice, Bucket::Bitcoin), d(1_050));
        assert_eq!(engine.reserved(Bucket::Bitcoin), d(30));
        engine.ledger().verify_supply().unwrap();
    }

    #[test]
    fn price_time_priority() {
        let (engine, alice, bob) = setup();
        let first = engine.place_order(alice, OrderSide::Sell, d(1), d(5)).unwrap();
        let better = engine.place_order(alice, OrderSide::Sell, d(1), d(4)).unwrap();
        let second = engine.place_order(alice, OrderSide::Sell, d(1), d(5)).unwrap();

        let buy = engine.place_order(bob, OrderSide::Buy, d(2), d(5)).unwrap();
        let makers: Vec<OrderId> = buy.fills.iter().map(|f| f.maker_order_id).collect();
        assert_eq!(makers, vec![better.order.id, first.order.id]);
        assert!(engine.order(second.order.id).unwrap().status.is_live());
    }

    #[test]
    fn fills_for_lists_both_sides_of_each_trade() {
        let (engine, alice, bob) = setup();
        let carol = AccountId(3);
        engine.ledger().open_account(carol);
        engine
            .ledger()
            .credit(carol, Bucket::Bitcoin, d(100), OpTag::Deposit)
            .unwrap();

        engine.place_order(alice, OrderSide::Sell, d(4), d(5)).unwrap();
        engine.place_order(bob, OrderSide::Buy, d(1), d(5)).unwrap();
        assert!(engine.fills_for(carol).is_empty());
        engine.place_order(carol, OrderSide::Buy, d(2), d(5)).unwrap();

        let alice_fills = engine.fills_for(alice);
        assert_eq!(alice_fills.len(), 2);
        assert!(alice_fills.iter().all(|f| f.seller == alice));
        assert!(alice_fills[0].seq < alice_fills[1].seq);
        assert_eq!(engine.fills_for(bob).len(), 1);
        let carol_fills = engine.fills_for(carol);
        assert_eq!(carol_fills.len(), 1);
        assert_eq!(carol_fills[0].buyer, carol);
        assert_eq!(carol_fills[0].amount, d(2));
        assert_eq!(engine.fills().len(), 2);
    }

    #[test]
    fn cancel_refunds_unused_reservation() {
        let (engine, alice, bob) = setup();
        engine.place_order(alice, OrderSide::Sell, d(10), d(5)).unwrap();
        let buy = engine.place_order(bob, OrderSide::Buy, d(15), d(6)).unwrap();

        let cancelled = engine.cancel_order(bob, buy.order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(bal(&engine, bob, Bucket::Bitcoin), d(1_000) - d(50));
        assert_eq!(engine.reserved(Bucket::Bitcoin), Decimal::ZERO);
        engine.ledger().verify_supply().unwrap();
    }

    #[test]
    fn cancelling_terminal_order_is_not_found_without_refund() {
        let (engine, alice, bob) = setup();
        let sell = engine.place_order(alice, OrderSide::Sell, d(2), d(5)).unwrap();
        engine.place_order(bob, OrderSide::Buy, d(2), d(5)).unwrap();
        let before = bal(&engine, alice, Bucket::Native);

        let err = engine.cancel_order(alice, sell.order.id).unwrap_err();
        assert!(matches!(err, CoinledgerError::NotFound { .. }));
        assert!(err.to_string().contains("FILLED"));
        assert_eq!(bal(&engine, alice, Bucket::Native), before);

        let open = engine.place_order(alice, OrderSide::Sell, d(1), d(9)).unwrap();
        engine.cancel_order(alice, open.order.id).unwrap();
        assert!(engine.cancel_order(alice, open.order.id).is_err());
    }

    #[test]
    fn cannot_cancel_someone_elses_order() {
        let (engine, alice, bob) = setup();
        let sell = engine.place_order(alice, OrderSide::Sell, d(2), d(5)).unwrap();
        assert!(matches!(
            engine.cancel_order(bob, sell.order.id),
            Err(CoinledgerError::NotFound { .. })
        ));
        assert!(engine.order(sell.order.id).unwrap().status.is_live());
    }

    #[test]
    fn insufficient_funds_leaves_book_untouched() {
        let (engine, alice, bob) = setup();
        engine.place_order(alice, OrderSide::Sell, d(1), d(5)).unwrap();
        let err = engine.place_order(bob, OrderSide::Buy, d(500), d(5)).unwrap_err();
        assert!(matches!(err, CoinledgerError::InsufficientFunds { .. }));
        assert_eq!(engine.depth(OrderSide::Sell, 10)[0].quantity, d(1));
        assert!(engine.fills().is_empty());
        assert_eq!(bal(&engine, bob, Bucket::Bitcoin), d(1_000));
    }

    #[test]
    fn rejects_bad_arguments() {
        let (engine, alice, _) = setup();
        for (amount, price) in [(d(0), d(1)), (d(-1), d(1)), (d(1), d(0)), (d(1), d(-2))] {
            assert!(matches!(
                engine.place_order(alice, OrderSide::Buy, amount, price),
                Err(CoinledgerError::InvalidArgument { .. })
            ));
        }
        // 0.00000001 x 0.5 rounds to nothing
        assert!(matches!(
            engine.place_order(alice, OrderSide::Buy, Decimal::new(1, 8), Decimal::new(5, 1)),
            Err(CoinledgerError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn open_order_cap_enforced() {
        let ledger = Arc::new(Ledger::default());
        let alice = AccountId(1);
        ledger.open_account(alice);
        ledger.credit(alice, Bucket::Native, d(10), OpTag::Deposit).unwrap();
        let engine = MatchingEngine::new(
            ledger,
            MarketConfig {
                max_open_orders_per_account: 2,
                ..MarketConfig::default()
            },
        );
        engine.place_order(alice, OrderSide::Sell, d(1), d(5)).unwrap();
        engine.place_order(alice, OrderSide::Sell, d(1), d(6)).unwrap();
        assert!(matches!(
            engine.place_order(alice, OrderSide::Sell, d(1), d(7)),
            Err(CoinledgerError::OrderLimitExceeded { limit: 2, .. })
        ));
    }

    #[test]
    fn self_match_is_neutral() {
        let (engine, alice, _) = setup();
        engine.place_order(alice, OrderSide::Sell, d(3), d(2)).unwrap();
        let buy = engine.place_order(alice, OrderSide::Buy, d(3), d(2)).unwrap();
        assert_eq!(buy.fills.len(), 1);
        assert_eq!(bal(&engine, alice, Bucket::Native), d(1_000));
        assert_eq!(bal(&engine, alice, Bucket::Bitcoin), d(1_000));
    }
}
