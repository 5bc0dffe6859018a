//! The settlement pipeline: shared state and the drain dispatcher.
//!
//! Each drain kind is single-flight. A second invocation while one is
//! running returns a skipped [`DrainReport`] without touching anything.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use coinledger_ledger::Ledger;
use coinledger_types::{
    CoinledgerError, DrainReport, NodeService, Result, SettlementConfig, WalletGateway, WalletKind,
};
use rust_decimal::Decimal;

use crate::{
    addresses::AddressBook, collateral::SlotRegistry, single_flight::SingleFlight,
    task_store::TaskStore,
};

/// Token shared by masternode withdrawals and collateral allocation.
const MASTERNODE_OUTPUTS: &str = "masternode-outputs";

/// One gateway per wallet daemon.
#[derive(Clone)]
pub struct Wallets {
    pub native: Arc<dyn WalletGateway>,
    pub staking: Arc<dyn WalletGateway>,
    pub staking_pool: Arc<dyn WalletGateway>,
    pub masternode: Arc<dyn WalletGateway>,
    pub bitcoin: Arc<dyn WalletGateway>,
}

impl Wallets {
    #[must_use]
    pub fn get(&self, kind: WalletKind) -> &Arc<dyn WalletGateway> {
        match kind {
            WalletKind::Native => &self.native,
            WalletKind::Staking => &self.staking,
            WalletKind::StakingPool => &self.staking_pool,
            WalletKind::Masternode => &self.masternode,
            WalletKind::Bitcoin => &self.bitcoin,
        }
    }
}

// ---------------------------------------------------------------------------
// DrainKind
// ---------------------------------------------------------------------------

/// The background procedures a worker can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrainKind {
    Withdrawals,
    Unstaking,
    Invest,
    Rewards,
    GroupPayouts,
    Collateral,
    Deposits,
    MasternodeRewards,
    StakingPoolRewards,
    Lottery,
}

impl DrainKind {
    pub const ALL: [Self; 10] = [
        Self::Withdrawals,
        Self::Unstaking,
        Self::Invest,
        Self::Rewards,
        Self::GroupPayouts,
        Self::Collateral,
        Self::Deposits,
        Self::MasternodeRewards,
        Self::StakingPoolRewards,
        Self::Lottery,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Withdrawals => "withdrawals",
            Self::Unstaking => "unstaking",
            Self::Invest => "invest",
            Self::Rewards => "rewards",
            Self::GroupPayouts => "group-payouts",
            Self::Collateral => "collateral",
            Self::Deposits => "deposits",
            Self::MasternodeRewards => "masternode-rewards",
            Self::StakingPoolRewards => "staking-pool-rewards",
            Self::Lottery => "lottery",
        }
    }

    /// Single-flight token.
    #[must_use]
    pub fn guard_token(self) -> &'static str {
        match self {
            Self::Withdrawals | Self::Collateral => MASTERNODE_OUTPUTS,
            other => other.as_str(),
        }
    }

    /// Wallets the drain cannot run without.
    #[must_use]
    pub fn wallets(self) -> &'static [WalletKind] {
        match self {
            Self::Withdrawals | Self::Collateral | Self::MasternodeRewards => &[WalletKind::Masternode],
            Self::Unstaking | Self::StakingPoolRewards => &[WalletKind::StakingPool],
            Self::Invest => &[WalletKind::Native, WalletKind::Masternode],
            Self::Deposits => &[WalletKind::Native, WalletKind::Bitcoin],
            Self::Lottery => &[WalletKind::Native],
            Self::Rewards | Self::GroupPayouts => &[],
        }
    }
}

impl std::fmt::Display for DrainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrainKind {
    type Err = CoinledgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoinledgerError::invalid(format!("unknown drain kind: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) config: SettlementConfig,
    pub(crate) wallets: Wallets,
    pub(crate) node: Arc<dyn NodeService>,
    pub(crate) tasks: TaskStore,
    pub(crate) slots: SlotRegistry,
    pub(crate) addresses: AddressBook,
    pub(crate) flights: SingleFlight,
    /// Credited totals per `deposit:{wallet}:{address}` reference, rebuilt
    /// from the audit log on first use.
    pub(crate) watermarks: Mutex<Option<HashMap<String, Decimal>>>,
    /// Reward scan cursors per wallet, rebuilt from the audit log on first use.
    pub(crate) cursors: Mutex<Option<HashMap<WalletKind, String>>>,
    /// Height of the last lottery draw, rebuilt from the audit log on first use.
    pub(crate) lottery_height: Mutex<Option<u64>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        ledger: Arc<Ledger>,
        config: SettlementConfig,
        wallets: Wallets,
        node: Arc<dyn NodeService>,
    ) -> Self {
        Self::with_state(ledger, config, wallets, node, TaskStore::new(), SlotRegistry::new())
    }

    /// Resume with previously persisted tasks and slots.
    #[must_use]
    pub fn with_state(
        ledger: Arc<Ledger>,
        config: SettlementConfig,
        wallets: Wallets,
        node: Arc<dyn NodeService>,
        tasks: TaskStore,
        slots: SlotRegistry,
    ) -> Self {
        let addresses = AddressBook::new(Arc::clone(&ledger), wallets.clone());
        Self {
            ledger,
            config,
            wallets,
            node,
            tasks,
            slots,
            addresses,
            flights: SingleFlight::new(),
            watermarks: Mutex::new(None),
            cursors: Mutex::new(None),
            lottery_height: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    #[must_use]
    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    #[must_use]
    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    #[must_use]
    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    #[must_use]
    pub fn single_flight(&self) -> &SingleFlight {
        &self.flights
    }

    pub(crate) fn wallet(&self, kind: WalletKind) -> &dyn WalletGateway {
        self.wallets.get(kind).as_ref()
    }

    // =================================================================
    // Dispatch
    // =================================================================

    /// Run one cycle of `kind`.
    ///
    /// # Errors
    /// Conditions that abort the whole cycle (wallet unreachable, collateral
    /// price unknown). Per-task failures are counted in the report instead.
    pub fn run_drain(&self, kind: DrainKind, now: DateTime<Utc>) -> Result<DrainReport> {
        let Some(_guard) = self.flights.try_acquire(kind.guard_token()) else {
            tracing::debug!(drain = %kind, "drain already running, skipping");
            return Ok(DrainReport::skipped());
        };
        let report = match kind {
            DrainKind::Withdrawals => self.drain_withdrawals(now),
            DrainKind::Unstaking => self.drain_unstaking(now),
            DrainKind::Invest => self.drain_invest(now),
            DrainKind::Rewards => self.drain_rewards(now),
            DrainKind::GroupPayouts => self.drain_group_payouts(now),
            DrainKind::Collateral => self.allocate_collateral(),
            DrainKind::Deposits => self.drain_deposits(),
            DrainKind::MasternodeRewards => self.distribute_masternode_rewards(),
            DrainKind::StakingPoolRewards => self.distribute_staking_pool_rewards(),
            DrainKind::Lottery => self.drain_lottery(now),
        }?;
        if report.examined > 0 {
            tracing::info!(
                drain = %kind,
                examined = report.examined,
                completed = report.completed,
                deferred = report.deferred,
                suspended = report.suspended,
                failed = report.failed,
                aborted = report.aborted,
                "drain finished"
            );
        }
        Ok(report)
    }

    /// Check that every wallet `kind` needs answers.
    pub fn probe(&self, kind: DrainKind) -> Result<()> {
        for wallet in kind.wallets() {
            self.wallet(*wallet)
                .block_count()
                .map_err(|e| CoinledgerError::from_gateway(&wallet.to_string(), e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_kebab_names() {
        for kind in DrainKind::ALL {
            assert_eq!(kind.as_str().parse::<DrainKind>().unwrap(), kind);
        }
        assert_eq!(
            "staking-pool-rewards".parse::<DrainKind>().unwrap(),
            DrainKind::StakingPoolRewards
        );
        assert!("payouts".parse::<DrainKind>().is_err());
    }

    #[test]
    fn withdrawals_and_collateral_share_a_token() {
        assert_eq!(
            DrainKind::Withdrawals.guard_token(),
            DrainKind::Collateral.guard_token()
        );
        assert_ne!(DrainKind::Unstaking.guard_token(), DrainKind::Withdrawals.guard_token());
        assert_eq!(DrainKind::Deposits.to_string(), "deposits");
        assert_eq!(DrainKind::Lottery.wallets(), &[WalletKind::Native]);
        assert_eq!(DrainKind::Lottery.guard_token(), "lottery");
    }
}
