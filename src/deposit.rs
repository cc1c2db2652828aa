// src/deposit.rs
use std::collections::HashMap;
use std::sync::Mutex;

use ethers::types::{Address, U256};
use tracing::debug;

/// Gas deposits held by the entry point on behalf of accounts and paymasters.
#[derive(Debug, Default)]
pub struct DepositLedger {
    balances: Mutex<HashMap<Address, U256>>,
}

impl DepositLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.balances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    pub fn deposit_to(&self, account: Address, amount: U256) -> U256 {
        let mut balances = self.balances.lock().unwrap_or_else(|e| e.into_inner());
        let balance = balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
        debug!(?account, %amount, total = %balance, "deposited");
        *balance
    }

    /// Debits `amount` from `payer` only if `commit` succeeds while the ledger is held.
    ///
    /// Keeps the prefund debit and the nonce updates performed by `commit` a single
    /// step: either everything lands or nothing does.
    pub fn debit_with<T, E>(
        &self,
        payer: Address,
        amount: U256,
        insufficient: E,
        commit: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut balances = self.balances.lock().unwrap_or_else(|e| e.into_inner());
        let balance = balances.get(&payer).copied().unwrap_or_default();
        let remaining = balance.checked_sub(amount).ok_or(insufficient)?;
        let committed = commit()?;
        balances.insert(payer, remaining);
        Ok(committed)
    }

    /// Moves up to `amount` from one deposit to another.
    pub fn transfer(&self, from: Address, to: Address, amount: U256) -> U256 {
        let mut balances = self.balances.lock().unwrap_or_else(|e| e.into_inner());
        let available = balances.get(&from).copied().unwrap_or_default();
        let moved = available.min(amount);
        balances.insert(from, available - moved);
        let target = balances.entry(to).or_default();
        *target = target.saturating_add(moved);
        moved
    }
}
