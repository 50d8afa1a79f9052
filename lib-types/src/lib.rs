//! Canonical types for the payout & wallet ledger engine.
//!
//! Pure data records and closed status enums shared by every crate in the
//! workspace. Behavior (payout processing, withdrawal arbitration,
//! reconciliation) lives in the engine crates.
//!
//! Rule: no free-form status strings cross a crate boundary. Every status
//! field is a closed enum; unknown values are rejected at the boundary via
//! `FromStr`.

pub mod contract;
pub mod encashment;
pub mod primitives;
pub mod transaction;
pub mod wallet;
pub mod withdrawal;

pub use contract::{payout_amount, Contract, ContractStatus, EntryStatus, ScheduleEntry};
pub use encashment::{EncashmentOverride, EncashmentReason, EncashmentSettings};
pub use primitives::{Amount, Bps, ContractId, TxId, UserId, WithdrawalId, BPS_DENOMINATOR};
pub use transaction::{
    activation_reference, deposit_reference, earning_reference, transfer_in_reference,
    transfer_out_reference, withdrawal_reference, LedgerTransaction, TransactionStatus,
    TransactionType,
};
pub use wallet::{UserBalances, Wallet, WalletType};
pub use withdrawal::{
    AccountDetails, PayoutMethod, RejectReason, Withdrawal, WithdrawalStatus,
};

use thiserror::Error;

/// A status string received at the boundary did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {field}: {value:?}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}
