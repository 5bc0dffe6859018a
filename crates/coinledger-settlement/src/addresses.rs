//! Deposit and service addresses.
//!
//! Deposit addresses are created lazily, one per account and wallet, and
//! stored on the account. Service addresses (change, pool, collateral
//! funding) are created once per wallet and cached.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use coinledger_ledger::Ledger;
use coinledger_types::{AccountId, CoinledgerError, Result, WalletKind};

use crate::pipeline::Wallets;

pub struct AddressBook {
    ledger: Arc<Ledger>,
    wallets: Wallets,
    /// Serializes creation so one account never gets two addresses.
    service: Mutex<HashMap<WalletKind, String>>,
}

impl AddressBook {
    #[must_use]
    pub fn new(ledger: Arc<Ledger>, wallets: Wallets) -> Self {
        Self {
            ledger,
            wallets,
            service: Mutex::new(HashMap::new()),
        }
    }

    fn service(&self) -> MutexGuard<'_, HashMap<WalletKind, String>> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The account's deposit address on `kind`, created on first use.
    pub fn deposit_address(&self, account: AccountId, kind: WalletKind) -> Result<String> {
        let _creating = self.service();
        if let Some(address) = self.ledger.account(account)?.address(kind) {
            return Ok(address.to_string());
        }
        let address = self
            .wallets
            .get(kind)
            .create_address(&account.to_string())
            .map_err(|e| CoinledgerError::from_gateway(&kind.to_string(), e))?;
        self.ledger.set_address(account, kind, &address)?;
        tracing::debug!(account = %account, wallet = %kind, "deposit address created");
        Ok(address)
    }

    /// The service's own address on `kind`.
    pub fn service_address(&self, kind: WalletKind) -> Result<String> {
        let mut service = self.service();
        if let Some(address) = service.get(&kind) {
            return Ok(address.clone());
        }
        let address = self
            .wallets
            .get(kind)
            .create_address("service")
            .map_err(|e| CoinledgerError::from_gateway(&kind.to_string(), e))?;
        service.insert(kind, address.clone());
        Ok(address)
    }
}
