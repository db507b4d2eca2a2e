//! Accounting core of a fungible token ledger.
//!
//! * [`ledger`]: balances, allowances and the supply-conserving transfer
//!   operations, plus snapshots with a merkle root.
//! * [`calls`]: the mutating entry points as data, and all-or-nothing
//!   batches of them.
//! * [`shared`]: a lock-guarded handle for concurrent callers.
//! * [`store`]: the JSON state file used by the CLI.
//! * [`address`]: fixed-size account identifiers.
//!
//! Caller identity is always an explicit argument; authenticating it is the
//! invoking layer's job.

pub mod address;
pub mod calls;
pub mod ledger;
pub mod shared;
pub mod store;

pub use address::{Address, AddressError};
pub use calls::{CallBatch, CallEnvelope, LedgerCall};
pub use ledger::{Amount, Ledger, LedgerError, LedgerEvent, LedgerSnapshot};
pub use shared::SharedLedger;
