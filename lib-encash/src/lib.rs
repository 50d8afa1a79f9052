//! Encashment arbitration.
//!
//! Decides when withdrawals are permitted (the window evaluator) and drives
//! a withdrawal request through its lifecycle
//! (PENDING -> COMPLETED | CANCELLED | REJECTED) without ever
//! double-deducting or double-refunding a balance.

pub mod window;
pub mod withdrawals;

pub use window::{encashment_status, evaluate, EncashmentStatus, Evaluation};
pub use withdrawals::{
    approve, cancel, mark_paid, reject, request_withdrawal, WithdrawalPolicy,
};

use lib_store::StorageError;
use lib_types::{RejectReason, WithdrawalId, WithdrawalStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncashError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("payout account details are incomplete")]
    IncompleteAccountDetails,

    /// A business-rule refusal; a REJECTED withdrawal with this reason was
    /// persisted for the audit trail.
    #[error("withdrawal rejected: {reason}")]
    Rejected {
        id: WithdrawalId,
        reason: RejectReason,
    },

    /// Conflict: the request reached a terminal state before this action.
    #[error("withdrawal {id} is already {status}")]
    NotPending {
        id: WithdrawalId,
        status: WithdrawalStatus,
    },

    #[error("withdrawal not found: {0}")]
    NotFound(WithdrawalId),
}

pub type EncashResult<T> = Result<T, EncashError>;
