use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::address::Address;
use crate::ledger::{Amount, BatchId, Ledger, LedgerError, LedgerEvent};

/// The mutating entry points. The caller identity travels next to the call
/// and is trusted as given.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LedgerCall {
    Approve {
        spender: Address,
        amount: Amount,
    },
    Transfer {
        to: Address,
        amount: Amount,
    },
    TransferFrom {
        from: Address,
        to: Address,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallEnvelope {
    pub caller: Address,
    pub call: LedgerCall,
}

impl CallEnvelope {
    pub fn new(caller: Address, call: LedgerCall) -> Self {
        Self { caller, call }
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"call");
        hasher.update(canonical_bytes(self));
        hasher.finalize().into()
    }
}

/// An ordered group of calls applied all-or-nothing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CallBatch {
    /// Distinguishes otherwise identical batches.
    #[serde(default)]
    pub nonce: u64,
    pub calls: Vec<CallEnvelope>,
}

impl CallBatch {
    pub fn id(&self) -> BatchId {
        let mut hasher = Sha256::new();
        hasher.update(b"batch");
        hasher.update(self.nonce.to_le_bytes());
        hasher.update((self.calls.len() as u64).to_le_bytes());
        for call in &self.calls {
            hasher.update(call.digest());
        }
        hasher.finalize().into()
    }
}

fn canonical_bytes(envelope: &CallEnvelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(envelope.caller.as_bytes());
    match &envelope.call {
        LedgerCall::Approve { spender, amount } => {
            buf.push(0);
            buf.extend_from_slice(spender.as_bytes());
            buf.extend_from_slice(&amount.to_le_bytes());
        }
        LedgerCall::Transfer { to, amount } => {
            buf.push(1);
            buf.extend_from_slice(to.as_bytes());
            buf.extend_from_slice(&amount.to_le_bytes());
        }
        LedgerCall::TransferFrom { from, to, amount } => {
            buf.push(2);
            buf.extend_from_slice(from.as_bytes());
            buf.extend_from_slice(to.as_bytes());
            buf.extend_from_slice(&amount.to_le_bytes());
        }
    }
    buf
}

impl Ledger {
    /// Runs one call as `caller`: owner for `approve`/`transfer`, spender
    /// for `transfer_from`.
    pub fn execute(
        &mut self,
        caller: Address,
        call: &LedgerCall,
    ) -> Result<LedgerEvent, LedgerError> {
        match *call {
            LedgerCall::Approve { spender, amount } => Ok(self.approve(caller, spender, amount)),
            LedgerCall::Transfer { to, amount } => self.transfer(caller, to, amount),
            LedgerCall::TransferFrom { from, to, amount } => {
                self.transfer_from(caller, from, to, amount)
            }
        }
    }

    /// Applies every call in `batch` or none of them. A batch id is accepted
    /// once.
    pub fn apply_batch(&mut self, batch: &CallBatch) -> Result<Vec<LedgerEvent>, LedgerError> {
        let id = batch.id();
        if self.has_applied(&id) {
            warn!(batch = %hex::encode(id), "duplicate batch");
            return Err(LedgerError::DuplicateBatch(hex::encode(id)));
        }

        let mut staged = self.clone();
        let mut events = Vec::with_capacity(batch.calls.len());
        for (index, envelope) in batch.calls.iter().enumerate() {
            let event = staged
                .execute(envelope.caller, &envelope.call)
                .map_err(|source| {
                    warn!(batch = %hex::encode(id), index, error = %source, "batch rejected");
                    LedgerError::BatchCallRejected {
                        index,
                        source: Box::new(source),
                    }
                })?;
            events.push(event);
        }
        staged.mark_applied(id);
        *self = staged;
        info!(batch = %hex::encode(id), calls = events.len(), "batch applied");
        Ok(events)
    }
}
