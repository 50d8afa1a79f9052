//! Wallet operations and ledger consistency.
//!
//! The deposit-approval and inter-wallet-transfer mutation paths, the
//! balance projection exposed to callers, and the reconciler that keeps the
//! denormalized shadow balances honest.

pub mod reconcile;
pub mod wallets;

pub use reconcile::{reconcile_all, reconcile_user, UserReport, WalletDrift};
pub use wallets::{approve_deposit, balances, transfer, Balances};

use lib_store::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("cannot transfer a wallet to itself")]
    SameWallet,
}

pub type LedgerResult<T> = Result<T, LedgerError>;
