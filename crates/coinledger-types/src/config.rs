//! Configuration passed explicitly into each component at construction.
//!
//! Every struct has a `Default` mirroring the production constants, and all
//! fields are optional in JSON (`#[serde(default)]`), so a config file only
//! needs to name what it overrides.

use std::{path::Path, time::Duration};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CoinledgerError, Result, constants};

/// Ledger locking behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Bounded wait for a per-account lock, in milliseconds.
    pub lock_wait_ms: u64,
}

impl LedgerConfig {
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: constants::DEFAULT_LOCK_WAIT_MS,
        }
    }
}

/// Order book limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Smallest accepted order quantity, in native coin.
    pub min_order_amount: Decimal,
    /// Maximum number of live orders per account. `0` disables the check.
    pub max_open_orders_per_account: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_order_amount: Decimal::new(1, 8),
            max_open_orders_per_account: 0,
        }
    }
}

/// Settlement pipeline and treasury parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Flat commission kept on outgoing native transfers and investments.
    pub transaction_commission: Decimal,
    /// Confirmations before a deposit is credited.
    pub confirmations_needed: u32,
    /// Inclusive delay window for masternode withdrawals, in hours.
    pub mn_withdraw_delay_hours: (u32, u32),
    /// Inclusive delay window for pool unstaking, in hours.
    pub unstake_delay_hours: (u32, u32),
    /// Pause between investment transfers, in milliseconds.
    pub invest_pause_ms: u64,
    /// Minimum investment while the account holds little invested balance.
    pub min_first_investment: Decimal,
    /// Invested balance below which `min_first_investment` applies.
    pub small_investor_balance: Decimal,
    /// Fee rate used when the node returns a negative estimate.
    pub fallback_fee_per_kb: Decimal,
    /// Fee rate used when the node estimate exceeds `max_sane_fee_per_kb`.
    pub capped_fee_per_kb: Decimal,
    pub max_sane_fee_per_kb: Decimal,
    /// Collateral is only bought when free funds exceed `price × margin`.
    pub collateral_margin: Decimal,
    /// Blocks to wait after a node reload before starting a masternode.
    pub collateral_confirmations: u64,
    /// Poll period while waiting for blocks, in milliseconds.
    pub block_poll_ms: u64,
    /// Upper bound on block-wait polls before giving up on the start step.
    pub block_poll_limit: u32,
    /// Default worker tick, in milliseconds.
    pub drain_interval_ms: u64,
    pub lottery_ticket_price: Decimal,
    /// Part of each ticket price added to the jackpot; the rest is kept.
    pub lottery_jackpot_share: Decimal,
    /// Blocks between two draws.
    pub lottery_block_interval: u64,
    /// Jackpot size, in tickets, the feeder tops up to before a draw.
    pub lottery_min_jackpot_tickets: u32,
}

impl SettlementConfig {
    /// Minimal spend for an outgoing transfer: twice the commission.
    #[must_use]
    pub fn minimal_spend(&self) -> Decimal {
        self.transaction_commission * Decimal::TWO
    }

    #[must_use]
    pub fn invest_pause(&self) -> Duration {
        Duration::from_millis(self.invest_pause_ms)
    }

    #[must_use]
    pub fn block_poll(&self) -> Duration {
        Duration::from_millis(self.block_poll_ms)
    }

    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Zero pauses and waits; used by tests and dry runs.
    #[must_use]
    pub fn without_pauses(mut self) -> Self {
        self.invest_pause_ms = 0;
        self.block_poll_ms = 0;
        self
    }

    fn validate(&self) -> Result<()> {
        for (name, (lo, hi)) in [
            ("mn_withdraw_delay_hours", self.mn_withdraw_delay_hours),
            ("unstake_delay_hours", self.unstake_delay_hours),
        ] {
            if lo > hi {
                return Err(CoinledgerError::Configuration(format!(
                    "{name}: lower bound {lo} exceeds upper bound {hi}"
                )));
            }
        }
        if self.transaction_commission < Decimal::ZERO {
            return Err(CoinledgerError::Configuration(
                "transaction_commission must not be negative".into(),
            ));
        }
        if self.collateral_margin < Decimal::ONE {
            return Err(CoinledgerError::Configuration(
                "collateral_margin must be at least 1".into(),
            ));
        }
        if self.lottery_ticket_price <= Decimal::ZERO {
            return Err(CoinledgerError::Configuration(
                "lottery_ticket_price must be positive".into(),
            ));
        }
        if self.lottery_jackpot_share <= Decimal::ZERO || self.lottery_jackpot_share > Decimal::ONE {
            return Err(CoinledgerError::Configuration(
                "lottery_jackpot_share must be in (0, 1]".into(),
            ));
        }
        if self.lottery_block_interval == 0 {
            return Err(CoinledgerError::Configuration(
                "lottery_block_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            transaction_commission: Decimal::new(1, 2), // 0.01
            confirmations_needed: constants::DEFAULT_CONFIRMATIONS_NEEDED,
            mn_withdraw_delay_hours: constants::DEFAULT_MN_WITHDRAW_DELAY_HOURS,
            unstake_delay_hours: constants::DEFAULT_UNSTAKE_DELAY_HOURS,
            invest_pause_ms: constants::DEFAULT_INVEST_PAUSE_MS,
            min_first_investment: Decimal::from(constants::MIN_FIRST_INVESTMENT),
            small_investor_balance: Decimal::from(constants::SMALL_INVESTOR_BALANCE),
            fallback_fee_per_kb: Decimal::new(1, 4),  // 0.0001
            capped_fee_per_kb: Decimal::new(9, 4),    // 0.0009
            max_sane_fee_per_kb: Decimal::new(1, 1),  // 0.1
            collateral_margin: Decimal::new(1001, 3), // 1.001
            collateral_confirmations: constants::DEFAULT_COLLATERAL_CONFIRMATIONS,
            block_poll_ms: 60_000,
            block_poll_limit: 120,
            drain_interval_ms: 30_000,
            lottery_ticket_price: Decimal::from(constants::DEFAULT_LOTTERY_TICKET_PRICE),
            lottery_jackpot_share: Decimal::new(95, 2), // 0.95
            lottery_block_interval: 1,
            lottery_min_jackpot_tickets: constants::DEFAULT_LOTTERY_MIN_JACKPOT_TICKETS,
        }
    }
}

/// Everything the engine needs, aggregated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub market: MarketConfig,
    pub settlement: SettlementConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| CoinledgerError::Configuration(e.to_string()))?;
        cfg.settlement.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoinledgerError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_constants() {
        let cfg = SettlementConfig::default();
        assert_eq!(cfg.mn_withdraw_delay_hours, (6, 24));
        assert_eq!(cfg.unstake_delay_hours, (2, 6));
        assert_eq!(cfg.collateral_confirmations, 15);
        assert_eq!(cfg.fallback_fee_per_kb.to_string(), constants::FALLBACK_FEE_PER_KB);
        assert_eq!(cfg.capped_fee_per_kb.to_string(), constants::CAPPED_FEE_PER_KB);
        assert_eq!(cfg.max_sane_fee_per_kb.to_string(), constants::MAX_SANE_FEE_PER_KB);
        assert_eq!(cfg.minimal_spend(), Decimal::new(2, 2));
    }

    #[test]
    fn partial_json_overrides() {
        let cfg = EngineConfig::from_json_str(
            r#"{"ledger": {"lock_wait_ms": 50}, "settlement": {"transaction_commission": "0.5"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.ledger.lock_wait(), Duration::from_millis(50));
        assert_eq!(cfg.settlement.transaction_commission, Decimal::new(5, 1));
        assert_eq!(cfg.settlement.confirmations_needed, 2);
    }

    #[test]
    fn inverted_window_rejected() {
        let err = EngineConfig::from_json_str(r#"{"settlement": {"unstake_delay_hours": [6, 2]}}"#)
            .unwrap_err();
        assert!(matches!(err, CoinledgerError::Configuration(_)));
    }

    #[test]
    fn lottery_settings_are_checked() {
        let cfg = SettlementConfig::default();
        assert_eq!(cfg.lottery_ticket_price, Decimal::TEN);
        assert_eq!(cfg.lottery_min_jackpot_tickets, 10);
        for bad in [
            r#"{"settlement": {"lottery_ticket_price": "0"}}"#,
            r#"{"settlement": {"lottery_jackpot_share": "1.5"}}"#,
            r#"{"settlement": {"lottery_block_interval": 0}}"#,
        ] {
            let err = EngineConfig::from_json_str(bad).unwrap_err();
            assert!(matches!(err, CoinledgerError::Configuration(_)), "{bad}");
        }
    }

    #[test]
    fn malformed_json_is_configuration_error() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(format!("{err}").starts_with("CL_ERR_902"));
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = EngineConfig::from_json_file("/nonexistent/coinledger.json").unwrap_err();
        assert!(matches!(err, CoinledgerError::Configuration(_)));
    }

    #[test]
    fn without_pauses_zeroes_waits() {
        let cfg = SettlementConfig::default().without_pauses();
        assert_eq!(cfg.invest_pause(), Duration::ZERO);
        assert_eq!(cfg.block_poll(), Duration::ZERO);
    }
}
