//! Try-lock-or-skip guards for background procedures.
//!
//! A drain that finds its token already held returns immediately instead of
//! queueing. Masternode withdrawals and collateral allocation share one
//! token because both spend from the same masternode wallet outputs.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Registry of currently held tokens.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    held: Arc<Mutex<HashSet<&'static str>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<&'static str>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `token`, or `None` if another holder has it.
    #[must_use]
    pub fn try_acquire(&self, token: &'static str) -> Option<FlightGuard> {
        if !self.held().insert(token) {
            return None;
        }
        Some(FlightGuard {
            held: Arc::clone(&self.held),
            token,
        })
    }

    #[must_use]
    pub fn is_held(&self, token: &'static str) -> bool {
        self.held().contains(token)
    }
}

/// Releases its token on drop, including during unwinding.
#[derive(Debug)]
pub struct FlightGuard {
    held: Arc<Mutex<HashSet<&'static str>>>,
    token: &'static str,
}

impl FlightGuard {
    #[must_use]
    pub fn token(&self) -> &'static str {
        self.token
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.token);
    }
}
