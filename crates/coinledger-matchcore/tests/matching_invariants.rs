//! Order flow properties checked against the ledger.
//!
//! - Reservations held by resting orders always equal the ledger's held total.
//! - Random order flow (including cancels and self-matches) conserves both
//!   buckets and never leaves a crossed book.
//! - Concurrent placement from several threads keeps the same guarantees.

use std::{sync::Arc, thread};

use coinledger_ledger::Ledger;
use coinledger_matchcore::MatchingEngine;
use coinledger_types::{AccountId, Bucket, MarketConfig, OpTag, OrderSide};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rust_decimal::Decimal;

const ACCOUNTS: i64 = 5;

fn funded_engine() -> MatchingEngine {
    let ledger = Arc::new(Ledger::default());
    for id in 1..=ACCOUNTS {
        let id = AccountId(id);
        ledger.open_account(id);
        ledger.credit(id, Bucket::Native, Decimal::from(10_000), OpTag::Deposit).unwrap();
        ledger.credit(id, Bucket::Bitcoin, Decimal::from(10_000), OpTag::Deposit).unwrap();
    }
    MatchingEngine::new(ledger, MarketConfig::default())
}

fn random_order(rng: &mut StdRng) -> (AccountId, OrderSide, Decimal, Decimal) {
    let owner = AccountId(rng.gen_range(1..=ACCOUNTS));
    let side = if rng.gen_bool(0.5) { OrderSide::Buy } else { OrderSide::Sell };
    // 5 + 4 fractional digits, so notional truncation is exercised
    let amount = Decimal::new(rng.gen_range(1..2_000_000), 5);
    let price = Decimal::new(rng.gen_range(5_000..15_000), 4);
    (owner, side, amount, price)
}

fn assert_consistent(engine: &MatchingEngine) {
    let ledger = engine.ledger();
    ledger.verify_supply().unwrap();
    let supply = ledger.supply();
    for bucket in [Bucket::Native, Bucket::Bitcoin] {
        assert_eq!(engine.reserved(bucket), supply.held(bucket), "{bucket}");
        let total: Decimal = (1..=ACCOUNTS)
            .map(|id| ledger.balance(AccountId(id), bucket).unwrap())
            .sum();
        assert_eq!(total + supply.held(bucket), Decimal::from(10_000 * ACCOUNTS));
    }
    if let (Some(bid), Some(ask)) = (engine.best_bid(), engine.best_ask()) {
        assert!(bid < ask, "crossed book: bid {bid} >= ask {ask}");
    }
}

#[test]
fn random_flow_conserves_value() {
    let engine = funded_engine();
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..400 {
        if rng.gen_bool(0.2) {
            let owner = AccountId(rng.gen_range(1..=ACCOUNTS));
            if let Some(order) = engine.open_orders(owner).first() {
                engine.cancel_order(owner, order.id).unwrap();
            }
        } else {
            let (owner, side, amount, price) = random_order(&mut rng);
            // InsufficientFunds is fine; everything else must succeed
            if let Ok(placed) = engine.place_order(owner, side, amount, price) {
                for fill in &placed.fills {
                    match side {
                        OrderSide::Buy => assert!(fill.price <= price),
                        OrderSide::Sell => assert!(fill.price >= price),
                    }
                }
            }
        }
        assert_consistent(&engine);
    }

    assert!(!engine.fills().is_empty());
    engine.ledger().verify_audit_chain().unwrap();
    assert!(engine.ledger().reconcile().unwrap().is_empty());
}

#[test]
fn cancelling_everything_releases_all_holds() {
    let engine = funded_engine();
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..100 {
        let (owner, side, amount, price) = random_order(&mut rng);
        let _ = engine.place_order(owner, side, amount, price);
    }
    for id in 1..=ACCOUNTS {
        let owner = AccountId(id);
        for order in engine.open_orders(owner) {
            engine.cancel_order(owner, order.id).unwrap();
        }
    }
    let supply = engine.ledger().supply();
    assert_eq!(supply.held(Bucket::Native), Decimal::ZERO);
    assert_eq!(supply.held(Bucket::Bitcoin), Decimal::ZERO);
    assert_consistent(&engine);
}

#[test]
fn concurrent_placement_keeps_books_balanced() {
    let engine = Arc::new(funded_engine());
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t);
                for _ in 0..100 {
                    let (owner, side, amount, price) = random_order(&mut rng);
                    let _ = engine.place_order(owner, side, amount, price);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_consistent(&engine);
    let fills = engine.fills();
    for (i, fill) in fills.iter().enumerate() {
        assert_eq!(fill.seq, i as u64);
    }
    assert_eq!(engine.fill_root().len(), 64);
}
