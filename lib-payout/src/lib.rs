//! Contract lifecycle and the payout engine.
//!
//! Activation generates the payout schedule exactly once; the processor
//! turns matured schedule entries into wallet credits exactly once, even
//! under concurrent or retried runs; the scheduler drives the processor on
//! a timer and on demand.

pub mod contracts;
pub mod processor;
pub mod scheduler;

pub use contracts::{activate_contract, void_contract, ContractPolicy};
pub use processor::{process_contract, process_pending_payouts};
pub use scheduler::{PayoutScheduler, SchedulerHandle};

use lib_store::StorageError;
use lib_types::{Amount, ContractId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("principal {amount} below minimum {min}")]
    PrincipalBelowMinimum { amount: Amount, min: Amount },

    #[error("principal {amount} above maximum {max}")]
    PrincipalAboveMaximum { amount: Amount, max: Amount },

    #[error("payout amount overflows for principal {principal}")]
    AmountOverflow { principal: Amount },

    #[error("contract not found: {0}")]
    ContractNotFound(ContractId),
}

pub type PayoutResult<T> = Result<T, PayoutError>;
