use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::address::Address;
use crate::calls::{CallBatch, LedgerCall};
use crate::ledger::{Amount, Ledger, LedgerError, LedgerEvent, LedgerSnapshot};

/// Cloneable handle for concurrent callers.
///
/// Each mutating operation holds the write lock for its whole
/// check-then-apply transition. A poisoned lock is recovered: operations
/// validate before they mutate, so the ledger is never left half-applied.
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<RwLock<Ledger>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ledger)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ledger> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_supply(&self) -> Amount {
        self.read().total_supply()
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.read().balance_of(account)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.read().allowance(owner, spender)
    }

    pub fn approve(&self, owner: Address, spender: Address, amount: Amount) -> LedgerEvent {
        self.write().approve(owner, spender, amount)
    }

    pub fn transfer(
        &self,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        self.write().transfer(from, to, amount)
    }

    pub fn transfer_from(
        &self,
        spender: Address,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        self.write().transfer_from(spender, from, to, amount)
    }

    pub fn execute(&self, caller: Address, call: &LedgerCall) -> Result<LedgerEvent, LedgerError> {
        self.write().execute(caller, call)
    }

    pub fn apply_batch(&self, batch: &CallBatch) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.write().apply_batch(batch)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().snapshot()
    }

    /// Returns the ledger if this is the last handle.
    pub fn into_inner(self) -> Result<Ledger, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => Ok(lock.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(inner) => Err(Self { inner }),
        }
    }
}
