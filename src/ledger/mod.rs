use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::address::Address;

pub type Amount = u64;
pub type BatchId = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance in {account}: has {balance}, needs {requested}")]
    InsufficientBalance {
        account: Address,
        balance: Amount,
        requested: Amount,
    },
    #[error(
        "insufficient allowance for {spender} on {owner}: has {allowance}, needs {requested}"
    )]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        allowance: Amount,
        requested: Amount,
    },
    #[error("balances sum to {actual}, total supply is {expected}")]
    SupplyMismatch { expected: Amount, actual: u128 },
    #[error("snapshot root {claimed} does not match recomputed {computed}")]
    RootMismatch { claimed: String, computed: String },
    #[error("batch {0} already applied")]
    DuplicateBatch(String),
    #[error("call #{index} in batch rejected: {source}")]
    BatchCallRejected {
        index: usize,
        #[source]
        source: Box<LedgerError>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Transfer {
        from: Address,
        to: Address,
        amount: Amount,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    #[serde(with = "hex32::option", default)]
    pub last_batch: Option<BatchId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowanceEntry {
    pub owner: Address,
    pub spender: Address,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub total_supply: Amount,
    pub balances: BTreeMap<Address, Amount>,
    pub allowances: Vec<AllowanceEntry>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex32::list", default)]
    pub applied_batches: Vec<BatchId>,
    #[serde(with = "hex32")]
    pub merkle_root: [u8; 32],
}

/// Balance and allowance state for one token.
///
/// Zero entries are never stored: an absent key reads as 0.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    pub meta: SnapshotMetadata,
    total_supply: Amount,
    balances: BTreeMap<Address, Amount>,
    allowances: BTreeMap<(Address, Address), Amount>,
    events: Vec<LedgerEvent>,
    applied_batches: BTreeSet<BatchId>,
}

impl Ledger {
    /// Creates a ledger with the whole supply credited to `creator`.
    pub fn new(initial_supply: Amount, creator: Address) -> Self {
        let mut ledger = Self {
            total_supply: initial_supply,
            ..Self::default()
        };
        ledger.credit(creator, initial_supply);
        debug!(%creator, supply = initial_supply, "ledger created");
        ledger
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Amount)> {
        self.balances.iter()
    }

    pub(crate) fn has_applied(&self, batch: &BatchId) -> bool {
        self.applied_batches.contains(batch)
    }

    pub(crate) fn mark_applied(&mut self, batch: BatchId) {
        self.applied_batches.insert(batch);
        self.meta.last_batch = Some(batch);
    }

    /// Sets the allowance of `spender` over `owner`'s balance, replacing any
    /// previous value. Not capped by balance or supply.
    pub fn approve(&mut self, owner: Address, spender: Address, amount: Amount) -> LedgerEvent {
        if amount == 0 {
            self.allowances.remove(&(owner, spender));
        } else {
            self.allowances.insert((owner, spender), amount);
        }
        debug!(%owner, %spender, amount, "allowance set");
        self.record(LedgerEvent::Approval {
            owner,
            spender,
            amount,
        })
    }

    pub fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        self.ensure_balance(&from, amount)?;
        self.move_balance(from, to, amount);
        debug!(%from, %to, amount, "transfer applied");
        Ok(self.record(LedgerEvent::Transfer { from, to, amount }))
    }

    /// Moves `amount` from `from` to `to` on behalf of `spender`, consuming
    /// the allowance `from` granted to `spender`.
    ///
    /// The allowance is checked before the balance; nothing changes unless
    /// both hold.
    pub fn transfer_from(
        &mut self,
        spender: Address,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<LedgerEvent, LedgerError> {
        let allowance = self.allowance(&from, &spender);
        if allowance < amount {
            warn!(owner = %from, %spender, allowance, requested = amount, "allowance too low");
            return Err(LedgerError::InsufficientAllowance {
                owner: from,
                spender,
                allowance,
                requested: amount,
            });
        }
        self.ensure_balance(&from, amount)?;

        let remaining = allowance - amount;
        if remaining == 0 {
            self.allowances.remove(&(from, spender));
        } else {
            self.allowances.insert((from, spender), remaining);
        }
        self.move_balance(from, to, amount);
        debug!(%spender, %from, %to, amount, remaining, "delegated transfer applied");
        Ok(self.record(LedgerEvent::Transfer { from, to, amount }))
    }

    /// Recomputes the balance sum and compares it with the total supply.
    pub fn check_conservation(&self) -> Result<(), LedgerError> {
        let actual: u128 = self.balances.values().map(|v| *v as u128).sum();
        if actual != self.total_supply as u128 {
            return Err(LedgerError::SupplyMismatch {
                expected: self.total_supply,
                actual,
            });
        }
        Ok(())
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        compute_merkle_root(self)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            total_supply: self.total_supply,
            balances: self.balances.clone(),
            allowances: self
                .allowances
                .iter()
                .map(|((owner, spender), amount)| AllowanceEntry {
                    owner: *owner,
                    spender: *spender,
                    amount: *amount,
                })
                .collect(),
            events: self.events.clone(),
            applied_batches: self.applied_batches.iter().copied().collect(),
            merkle_root: self.merkle_root(),
        }
    }

    /// Rebuilds a ledger from a snapshot, rejecting it if the merkle root or
    /// the supply invariant does not hold.
    pub fn restore(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let mut balances = snapshot.balances;
        balances.retain(|_, v| *v > 0);
        let allowances = snapshot
            .allowances
            .into_iter()
            .filter(|e| e.amount > 0)
            .map(|e| ((e.owner, e.spender), e.amount))
            .collect();

        let ledger = Self {
            meta: snapshot.meta,
            total_supply: snapshot.total_supply,
            balances,
            allowances,
            events: snapshot.events,
            applied_batches: snapshot.applied_batches.into_iter().collect(),
        };

        ledger.check_conservation()?;
        let computed = ledger.merkle_root();
        if computed != snapshot.merkle_root {
            return Err(LedgerError::RootMismatch {
                claimed: hex::encode(snapshot.merkle_root),
                computed: hex::encode(computed),
            });
        }
        Ok(ledger)
    }

    fn ensure_balance(&self, account: &Address, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance_of(account);
        if balance < amount {
            warn!(%account, balance, requested = amount, "balance too low");
            return Err(LedgerError::InsufficientBalance {
                account: *account,
                balance,
                requested: amount,
            });
        }
        Ok(())
    }

    // Callers must have checked `from`'s balance.
    fn move_balance(&mut self, from: Address, to: Address, amount: Amount) {
        if from == to || amount == 0 {
            return;
        }
        self.debit(from, amount);
        self.credit(to, amount);
    }

    fn credit(&mut self, account: Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        // Sum of balances never exceeds total supply, so this cannot overflow.
        *self.balances.entry(account).or_insert(0) += amount;
    }

    fn debit(&mut self, account: Address, amount: Amount) {
        if let Some(balance) = self.balances.get_mut(&account) {
            *balance -= amount;
            if *balance == 0 {
                self.balances.remove(&account);
            }
        }
    }

    fn record(&mut self, event: LedgerEvent) -> LedgerEvent {
        self.meta.height += 1;
        self.events.push(event.clone());
        event
    }
}

/// Leaves: supply, one per balance, one per allowance, a meta leaf (height,
/// last batch), one per applied batch id, and a chained digest of the journal.
fn compute_merkle_root(ledger: &Ledger) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(
        3 + ledger.balances.len() + ledger.allowances.len() + ledger.applied_batches.len(),
    );

    let mut hasher = Sha256::new();
    hasher.update(b"supply");
    hasher.update(ledger.total_supply.to_le_bytes());
    leaves.push(hasher.finalize().into());

    for (account, balance) in &ledger.balances {
        let mut hasher = Sha256::new();
        hasher.update(b"bal");
        hasher.update(account.as_bytes());
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for ((owner, spender), amount) in &ledger.allowances {
        let mut hasher = Sha256::new();
        hasher.update(b"allow");
        hasher.update(owner.as_bytes());
        hasher.update(spender.as_bytes());
        hasher.update(amount.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }

    let mut hasher = Sha256::new();
    hasher.update(b"meta");
    hasher.update(ledger.meta.height.to_le_bytes());
    match &ledger.meta.last_batch {
        Some(id) => {
            hasher.update([1u8]);
            hasher.update(id);
        }
        None => hasher.update([0u8]),
    }
    leaves.push(hasher.finalize().into());

    for id in &ledger.applied_batches {
        let mut hasher = Sha256::new();
        hasher.update(b"batch");
        hasher.update(id);
        leaves.push(hasher.finalize().into());
    }

    leaves.push(journal_digest(&ledger.events));
    build_merkle(leaves)
}

fn journal_digest(events: &[LedgerEvent]) -> [u8; 32] {
    let mut acc: [u8; 32] = Sha256::digest(b"journal").into();
    for event in events {
        let mut hasher = Sha256::new();
        hasher.update(acc);
        match event {
            LedgerEvent::Transfer { from, to, amount } => {
                hasher.update(b"transfer");
                hasher.update(from.as_bytes());
                hasher.update(to.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            LedgerEvent::Approval {
                owner,
                spender,
                amount,
            } => {
                hasher.update(b"approval");
                hasher.update(owner.as_bytes());
                hasher.update(spender.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
        }
        acc = hasher.finalize().into();
    }
    acc
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"tokenledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

/// Hex encoding for 32-byte digests in JSON.
pub(crate) mod hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    fn decode<E: Error>(encoded: &str) -> Result<[u8; 32], E> {
        let bytes = hex::decode(encoded).map_err(E::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| E::custom(format!("expected 32 bytes, got {}", bytes.len())))
    }

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(v) => serializer.serialize_some(&hex::encode(v)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| decode(&s))
                .transpose()
        }
    }

    pub mod list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S>(value: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(value.len()))?;
            for item in value {
                seq.serialize_element(&hex::encode(item))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<String>::deserialize(deserializer)?
                .iter()
                .map(|s| decode(s))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn creator_holds_entire_supply() {
        let ledger = Ledger::new(10_000, account(0));
        assert_eq!(ledger.total_supply(), 10_000);
        assert_eq!(ledger.balance_of(&account(0)), 10_000);
        assert_eq!(ledger.balance_of(&account(1)), 0);
        assert_eq!(ledger.allowance(&account(0), &account(1)), 0);
    }

    #[test]
    fn zero_supply_is_valid() {
        let ledger = Ledger::new(0, account(0));
        assert_eq!(ledger.balance_of(&account(0)), 0);
        assert_eq!(ledger.accounts().count(), 0);
        ledger.check_conservation().unwrap();
    }

    #[test]
    fn overdraft_leaves_state_untouched() {
        let mut ledger = Ledger::new(10_000, account(0));
        let root = ledger.merkle_root();
        let err = ledger.transfer(account(0), account(1), 10_001).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account: account(0),
                balance: 10_000,
                requested: 10_001,
            }
        );
        assert_eq!(ledger.merkle_root(), root);
        assert_eq!(ledger.meta.height, 0);
        assert!(ledger.events().is_empty());
    }

    #[test]
    fn self_transfer_keeps_balance() {
        let mut ledger = Ledger::new(500, account(0));
        ledger.transfer(account(0), account(0), 500).unwrap();
        assert_eq!(ledger.balance_of(&account(0)), 500);
        assert!(ledger.transfer(account(0), account(0), 501).is_err());
    }

    #[test]
    fn emptied_accounts_are_pruned() {
        let mut ledger = Ledger::new(100, account(0));
        ledger.transfer(account(0), account(1), 100).unwrap();
        let holders: Vec<_> = ledger.accounts().map(|(a, _)| *a).collect();
        assert_eq!(holders, vec![account(1)]);
    }

    #[test]
    fn allowance_checked_before_balance() {
        let mut ledger = Ledger::new(10, account(0));
        ledger.approve(account(0), account(1), 5);
        let err = ledger
            .transfer_from(account(1), account(0), account(2), 50)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { .. }));

        ledger.approve(account(0), account(1), 50);
        let err = ledger
            .transfer_from(account(1), account(0), account(2), 50)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.allowance(&account(0), &account(1)), 50);
    }

    #[test]
    fn events_follow_successful_operations() {
        let mut ledger = Ledger::new(100, account(0));
        ledger.approve(account(0), account(1), 30);
        ledger
            .transfer_from(account(1), account(0), account(2), 30)
            .unwrap();
        let _ = ledger.transfer(account(2), account(3), 31);
        assert_eq!(ledger.meta.height, 2);
        assert_eq!(
            ledger.events(),
            &[
                LedgerEvent::Approval {
                    owner: account(0),
                    spender: account(1),
                    amount: 30,
                },
                LedgerEvent::Transfer {
                    from: account(0),
                    to: account(2),
                    amount: 30,
                },
            ]
        );
    }

    #[test]
    fn merkle_root_is_deterministic() {
        let mut ledger = Ledger::new(1_000, account(0));
        ledger.transfer(account(0), account(1), 400).unwrap();
        let root1 = ledger.snapshot().merkle_root;
        let root2 = ledger.snapshot().merkle_root;
        assert_eq!(root1, root2);

        ledger.approve(account(1), account(2), 10);
        assert_ne!(ledger.merkle_root(), root1);
    }

    #[test]
    fn snapshot_restores_identical_state() {
        let mut ledger = Ledger::new(1_000, account(0));
        ledger.approve(account(0), account(1), 300);
        ledger
            .transfer_from(account(1), account(0), account(2), 120)
            .unwrap();
        let restored = Ledger::restore(ledger.snapshot()).unwrap();
        assert_eq!(restored.balance_of(&account(2)), 120);
        assert_eq!(restored.allowance(&account(0), &account(1)), 180);
        assert_eq!(restored.meta, ledger.meta);
        assert_eq!(restored.merkle_root(), ledger.merkle_root());
    }

    #[test]
    fn restore_rejects_tampered_balances() {
        let ledger = Ledger::new(1_000, account(0));
        let mut snapshot = ledger.snapshot();
        snapshot.balances.insert(account(9), 1);
        assert!(matches!(
            Ledger::restore(snapshot),
            Err(LedgerError::SupplyMismatch {
                expected: 1_000,
                actual: 1_001
            })
        ));

        let mut snapshot = ledger.snapshot();
        snapshot.balances.insert(account(0), 999);
        snapshot.balances.insert(account(9), 1);
        assert!(matches!(
            Ledger::restore(snapshot),
            Err(LedgerError::RootMismatch { .. })
        ));
    }

    #[test]
    fn restore_rejects_edited_history() {
        use crate::calls::{CallBatch, CallEnvelope, LedgerCall};

        let mut ledger = Ledger::new(1_000, account(0));
        let batch = CallBatch {
            nonce: 1,
            calls: vec![CallEnvelope::new(
                account(0),
                LedgerCall::Transfer {
                    to: account(1),
                    amount: 10,
                },
            )],
        };
        ledger.apply_batch(&batch).unwrap();

        let mut dropped_batch = ledger.snapshot();
        dropped_batch.applied_batches.clear();
        assert!(matches!(
            Ledger::restore(dropped_batch),
            Err(LedgerError::RootMismatch { .. })
        ));

        let mut rewound = ledger.snapshot();
        rewound.meta.height = 0;
        assert!(matches!(
            Ledger::restore(rewound),
            Err(LedgerError::RootMismatch { .. })
        ));

        let mut erased = ledger.snapshot();
        erased.events.clear();
        assert!(matches!(
            Ledger::restore(erased),
            Err(LedgerError::RootMismatch { .. })
        ));

        let mut restored = Ledger::restore(ledger.snapshot()).unwrap();
        assert!(matches!(
            restored.apply_batch(&batch),
            Err(LedgerError::DuplicateBatch(_))
        ));
    }

    #[test]
    fn snapshot_json_uses_hex_digests() {
        let ledger = Ledger::new(42, account(7));
        let json = serde_json::to_value(ledger.snapshot()).unwrap();
        assert_eq!(
            json["merkle_root"].as_str().unwrap(),
            hex::encode(ledger.merkle_root())
        );
        assert_eq!(json["balances"][account(7).to_string()], 42);
    }
}
