//! Coin selection, fee computation and broadcast classification.
//!
//! Fees are derived from the size of a trial-signed transaction:
//!
//! ```text
//! fee = rate_per_kb × ceil(signed_bytes / 1024 + 1)
//! ```
//!
//! so a second transaction with the fee applied is built and signed before
//! anything is broadcast. Nothing here touches the ledger.

use coinledger_types::{
    CoinledgerError, GatewayError, OutPoint, Result, SettlementConfig, Utxo, WalletGateway,
    amount::truncate, constants::FEE_SIZE_UNIT_BYTES,
};
use rust_decimal::Decimal;

/// RPC code bitcoind-style daemons use for "insufficient funds".
const RPC_WALLET_INSUFFICIENT_FUNDS: i32 = -6;

/// Which output absorbs the network fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePayer {
    /// Deducted from what the recipient receives.
    Recipient,
    /// Deducted from the change output.
    Change,
}

/// A signed transaction ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hex: String,
    pub inputs: Vec<OutPoint>,
    pub fee: Decimal,
    /// What the recipient output carries.
    pub delivered: Decimal,
}

/// A broadcast the daemon accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub txid: String,
    pub fee: Decimal,
    pub delivered: Decimal,
}

/// How a broadcast ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    Sent(Delivered),
    /// The inputs were gone. Nothing moved; retry with a fresh selection.
    InputsSpent { code: i32 },
    /// The daemon may or may not have applied the transaction.
    Ambiguous { reason: String },
}

fn gateway(wallet: &dyn WalletGateway) -> impl Fn(GatewayError) -> CoinledgerError + '_ {
    move |e| CoinledgerError::from_gateway(&wallet.kind().to_string(), e)
}

fn insufficient(needed: Decimal, available: Decimal) -> CoinledgerError {
    CoinledgerError::WalletRejected {
        code: RPC_WALLET_INSUFFICIENT_FUNDS,
        message: format!("wallet holds {available}, needs {needed}"),
    }
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// The node's estimate, replaced by the fallback when negative and capped
/// when implausibly high.
pub fn fee_rate(wallet: &dyn WalletGateway, config: &SettlementConfig) -> Result<Decimal> {
    let estimate = wallet.estimate_fee(1).map_err(gateway(wallet))?;
    Ok(if estimate < Decimal::ZERO {
        config.fallback_fee_per_kb
    } else if estimate > config.max_sane_fee_per_kb {
        config.capped_fee_per_kb
    } else {
        estimate
    })
}

/// `ceil(bytes / 1024 + 1)` for a hex-encoded signed transaction.
#[must_use]
pub fn size_multiplier(signed_hex: &str) -> u64 {
    let bytes = signed_hex.len() / 2;
    bytes.div_ceil(FEE_SIZE_UNIT_BYTES) as u64 + 1
}

#[must_use]
pub fn fee_for(rate: Decimal, signed_hex: &str) -> Decimal {
    truncate(rate * Decimal::from(size_multiplier(signed_hex)))
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Smallest outputs first until the running sum reaches `target`.
#[must_use]
pub fn select_smallest_first(mut utxos: Vec<Utxo>, target: Decimal) -> Option<(Vec<Utxo>, Decimal)> {
    utxos.sort_by(|a, b| a.amount.cmp(&b.amount).then_with(|| a.outpoint.cmp(&b.outpoint)));
    let mut sum = Decimal::ZERO;
    let mut picked = Vec::new();
    for utxo in utxos {
        if sum >= target {
            break;
        }
        sum += utxo.amount;
        picked.push(utxo);
    }
    (sum >= target && !picked.is_empty()).then_some((picked, sum))
}

/// Take candidates in the given order until the sum reaches `target`.
#[must_use]
pub fn select_in_order(utxos: Vec<Utxo>, target: Decimal) -> Option<(Vec<Utxo>, Decimal)> {
    let mut sum = Decimal::ZERO;
    let mut picked = Vec::new();
    for utxo in utxos {
        if sum >= target {
            break;
        }
        sum += utxo.amount;
        picked.push(utxo);
    }
    (sum >= target && !picked.is_empty()).then_some((picked, sum))
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

fn outputs(recipient: (&str, Decimal), change: Option<(&str, Decimal)>) -> Vec<(String, Decimal)> {
    let mut out = Vec::with_capacity(2);
    if recipient.1 > Decimal::ZERO {
        out.push((recipient.0.to_string(), recipient.1));
    }
    if let Some((address, amount)) = change.filter(|(_, a)| *a > Decimal::ZERO) {
        out.push((address.to_string(), amount));
    }
    out
}

fn sign(wallet: &dyn WalletGateway, inputs: &[OutPoint], outs: &[(String, Decimal)]) -> Result<String> {
    let raw = wallet.create_raw_transaction(inputs, outs).map_err(gateway(wallet))?;
    wallet.sign_raw_transaction(&raw).map_err(gateway(wallet))
}

/// Pay `amount` to `destination` out of `inputs` (worth `input_total`),
/// sending any change to `change_address`.
///
/// # Errors
/// - [`CoinledgerError::WalletRejected`] (code -6) when change would go
///   negative.
/// - [`CoinledgerError::InvalidArgument`] when the fee eats the whole
///   recipient output.
#[allow(clippy::too_many_arguments)]
pub fn build_signed(
    wallet: &dyn WalletGateway,
    config: &SettlementConfig,
    inputs: &[OutPoint],
    input_total: Decimal,
    destination: &str,
    amount: Decimal,
    change_address: &str,
    payer: FeePayer,
) -> Result<SignedTx> {
    if input_total < amount {
        return Err(insufficient(amount, input_total));
    }
    let trial = sign(
        wallet,
        inputs,
        &outputs((destination, amount), Some((change_address, input_total - amount))),
    )?;
    let fee = fee_for(fee_rate(wallet, config)?, &trial);

    let (delivered, change) = match payer {
        FeePayer::Recipient => (amount - fee, input_total - amount),
        FeePayer::Change => (amount, input_total - amount - fee),
    };
    if delivered <= Decimal::ZERO {
        return Err(CoinledgerError::invalid(format!(
            "amount {amount} does not cover the network fee {fee}"
        )));
    }
    if change < Decimal::ZERO {
        return Err(insufficient(amount + fee, input_total));
    }

    let hex = sign(
        wallet,
        inputs,
        &outputs((destination, delivered), Some((change_address, change))),
    )?;
    tracing::debug!(
        wallet = %wallet.kind(),
        inputs = inputs.len(),
        fee = %fee,
        delivered = %delivered,
        "transaction signed"
    );
    Ok(SignedTx {
        hex,
        inputs: inputs.to_vec(),
        fee,
        delivered,
    })
}

/// Broadcast and classify the outcome.
///
/// # Errors
/// Unambiguous failures: the daemon refused the transaction or could not
/// be reached before sending.
pub fn broadcast(wallet: &dyn WalletGateway, tx: &SignedTx) -> Result<Broadcast> {
    match wallet.send_raw_transaction(&tx.hex) {
        Ok(txid) => {
            tracing::info!(wallet = %wallet.kind(), txid = %txid, delivered = %tx.delivered, "broadcast accepted");
            Ok(Broadcast::Sent(Delivered {
                txid,
                fee: tx.fee,
                delivered: tx.delivered,
            }))
        }
        Err(GatewayError::InputsSpent { code }) => {
            tracing::warn!(wallet = %wallet.kind(), code, "inputs already spent");
            Ok(Broadcast::InputsSpent { code })
        }
        Err(GatewayError::Timeout) => Ok(Broadcast::Ambiguous {
            reason: format!("{} wallet broadcast timed out", wallet.kind()),
        }),
        Err(e) => Err(gateway(wallet)(e)),
    }
}

/// Smallest-first payment with the fee taken from change.
///
/// Selection is re-derived from the wallet on every call. If the first
/// selection leaves no room for the fee, one wider selection is tried.
pub fn send_funds(
    wallet: &dyn WalletGateway,
    config: &SettlementConfig,
    min_confirmations: u32,
    destination: &str,
    amount: Decimal,
    change_address: &str,
) -> Result<Broadcast> {
    let utxos = wallet.list_unspent(min_confirmations).map_err(gateway(wallet))?;
    let available: Decimal = utxos.iter().map(|u| u.amount).sum();
    let mut target = amount;
    for _ in 0..2 {
        let (picked, total) = select_smallest_first(utxos.clone(), target)
            .ok_or_else(|| insufficient(target, available))?;
        let inputs: Vec<OutPoint> = picked.into_iter().map(|u| u.outpoint).collect();
        let built = build_signed(
            wallet,
            config,
            &inputs,
            total,
            destination,
            amount,
            change_address,
            FeePayer::Change,
        );
        match built {
            Ok(tx) => return broadcast(wallet, &tx),
            Err(CoinledgerError::WalletRejected { code, .. })
                if code == RPC_WALLET_INSUFFICIENT_FUNDS =>
            {
                target = amount + config.capped_fee_per_kb * Decimal::from(2 + inputs.len() as u64);
            }
            Err(e) => return Err(e),
        }
    }
    Err(insufficient(target, available))
}

#[cfg(test)]
mod tests {
    use coinledger_types::{
        WalletKind,
        mock::{MockWallet, SendFailure},
    };

    use super::*;

    fn d(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn utxo(txid: &str, amount: Decimal) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(txid, 0),
            amount,
            address: None,
        }
    }

    #[test]
    fn multiplier_rounds_up_and_adds_one() {
        assert_eq!(size_multiplier(""), 1);
        assert_eq!(size_multiplier(&"ab".repeat(300)), 2);
        assert_eq!(size_multiplier(&"ab".repeat(1024)), 2);
        assert_eq!(size_multiplier(&"ab".repeat(1025)), 3);
    }

    #[test]
    fn rate_fallback_and_cap() {
        let wallet = MockWallet::new(WalletKind::Native);
        let config = SettlementConfig::default();
        wallet.set_fee_rate(Decimal::new(-1, 0));
        assert_eq!(fee_rate(&wallet, &config).unwrap(), Decimal::new(1, 4));
        wallet.set_fee_rate(Decimal::new(5, 1));
        assert_eq!(fee_rate(&wallet, &config).unwrap(), Decimal::new(9, 4));
        wallet.set_fee_rate(Decimal::new(2, 4));
        assert_eq!(fee_rate(&wallet, &config).unwrap(), Decimal::new(2, 4));
    }

    #[test]
    fn smallest_first_stops_once_covered() {
        let utxos = vec![utxo("c", d(5)), utxo("a", d(1)), utxo("b", d(2))];
        let (picked, sum) = select_smallest_first(utxos.clone(), d(3)).unwrap();
        assert_eq!(sum, d(3));
        assert_eq!(picked.len(), 2);
        assert!(select_smallest_first(utxos, d(9)).is_none());
        assert!(select_smallest_first(Vec::new(), Decimal::ZERO).is_none());
    }

    #[test]
    fn fee_from_recipient() {
        let wallet = MockWallet::new(WalletKind::Masternode);
        let op = wallet.fund(d(10));
        let tx = build_signed(
            &wallet,
            &SettlementConfig::default(),
            &[op],
            d(10),
            "dest",
            d(4),
            "change",
            FeePayer::Recipient,
        )
        .unwrap();
        // 300 signed bytes -> multiplier 2 at 0.0001/kB
        assert_eq!(tx.fee, Decimal::new(2, 4));
        assert_eq!(tx.delivered, d(4) - Decimal::new(2, 4));
    }

    #[test]
    fn fee_from_change_drops_empty_change() {
        let wallet = MockWallet::new(WalletKind::Native);
        let op = wallet.fund(Decimal::new(10_002, 4)); // 1.0002
        let tx = build_signed(
            &wallet,
            &SettlementConfig::default(),
            &[op],
            Decimal::new(10_002, 4),
            "dest",
            Decimal::ONE,
            "change",
            FeePayer::Change,
        )
        .unwrap();
        assert_eq!(tx.delivered, Decimal::ONE);
        broadcast(&wallet, &tx).unwrap();
        let sent = wallet.sent();
        assert_eq!(sent[0].outputs, vec![("dest".to_string(), Decimal::ONE)]);
    }

    #[test]
    fn change_shortfall_is_insufficient() {
        let wallet = MockWallet::new(WalletKind::Native);
        let op = wallet.fund(Decimal::ONE);
        let err = build_signed(
            &wallet,
            &SettlementConfig::default(),
            &[op],
            Decimal::ONE,
            "dest",
            Decimal::ONE,
            "change",
            FeePayer::Change,
        )
        .unwrap_err();
        assert!(matches!(err, CoinledgerError::WalletRejected { code: -6, .. }));
    }

    #[test]
    fn send_funds_widens_selection_for_fee() {
        let wallet = MockWallet::new(WalletKind::Native);
        wallet.fund(Decimal::ONE);
        wallet.fund(d(3));
        let change = wallet.create_address("service").unwrap();
        let out = send_funds(&wallet, &SettlementConfig::default(), 1, "dest", Decimal::ONE, &change)
            .unwrap();
        let Broadcast::Sent(sent) = out else {
            panic!("expected a broadcast, got {out:?}");
        };
        assert_eq!(sent.delivered, Decimal::ONE);
        assert_eq!(wallet.sent()[0].inputs.len(), 2);
    }

    #[test]
    fn broadcast_classification() {
        let wallet = MockWallet::new(WalletKind::Native);
        let op = wallet.fund(d(5));
        let config = SettlementConfig::default();
        let tx = build_signed(&wallet, &config, &[op], d(5), "dest", d(1), "chg", FeePayer::Change).unwrap();

        wallet.fail_next_send(SendFailure::Before(GatewayError::from_rpc(-25, "missing inputs")));
        assert_eq!(broadcast(&wallet, &tx).unwrap(), Broadcast::InputsSpent { code: -25 });

        wallet.fail_next_send(SendFailure::Before(GatewayError::Unavailable("down".into())));
        assert!(matches!(
            broadcast(&wallet, &tx),
            Err(CoinledgerError::ExternalUnavailable { .. })
        ));

        wallet.fail_next_send(SendFailure::TimeoutAfterApply);
        assert!(matches!(broadcast(&wallet, &tx).unwrap(), Broadcast::Ambiguous { .. }));
        assert_eq!(wallet.sent().len(), 1);
    }
}
