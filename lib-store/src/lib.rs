//! Ledger persistence layer.
//!
//! All persistence goes through the [`LedgerStore`] trait: a document store
//! offering per-document atomic updates, conditional updates keyed on a
//! field's current value, and the secondary-index queries the engines need.
//!
//! # Data Model Invariants
//!
//! 1. **Wallet mutations are compound and atomic** - `credit_wallet`,
//!    `debit_wallet`, `refund_wallet`, `apply_earning`, `apply_transfer`,
//!    `submit_withdrawal` and `transition_withdrawal` each update the
//!    wallet document AND the user's shadow balance document (and any
//!    paired record) in one atomic step. Engines never read-modify-write a
//!    balance across separate calls.
//!
//! 2. **Transactions are append-only and reference-unique** - a second
//!    insert with an existing `reference` is refused (returns `false`),
//!    never overwritten. This is the duplicate-suppression hook the payout
//!    processor's exactly-once guarantee rests on.
//!
//! 3. **Conditional updates decide races** - `complete_schedule_entry`
//!    applies only while the entry is still pending;
//!    `transition_withdrawal` applies only while the request is still
//!    pending. The loser of a race observes the terminal state, not an
//!    error.
//!
//! 4. **Nothing is deleted** - contracts, withdrawals and transactions are
//!    kept forever; wallets persist while the owning user exists.

pub mod memory;
pub mod sled_store;

use chrono::{DateTime, NaiveDate, Utc};

use lib_types::{
    Amount, Contract, ContractId, EncashmentSettings, LedgerTransaction, UserBalances, UserId,
    Wallet, WalletType, Withdrawal, WithdrawalId, WithdrawalStatus,
};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Error raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("wallet not found: user {user}, {wallet_type}")]
    WalletNotFound { user: UserId, wallet_type: WalletType },

    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: Amount, need: Amount },

    #[error("contract not found: {0}")]
    ContractNotFound(ContractId),

    #[error("schedule entry {index} out of range for contract {contract}")]
    EntryOutOfRange { contract: ContractId, index: usize },

    #[error("withdrawal not found: {0}")]
    WithdrawalNotFound(WithdrawalId),

    #[error("arithmetic overflow")]
    Overflow,

    #[error("arithmetic underflow")]
    Underflow,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of the conditional schedule-entry completion.
#[derive(Debug, Clone)]
pub enum EntryCompletion {
    /// The entry was pending and is now completed; the updated contract is
    /// returned (its status may have just turned `Completed`).
    Completed(Contract),
    /// A concurrent or earlier run already completed the entry. No-op.
    AlreadyCompleted,
}

/// Outcome of the conditional withdrawal transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The request was still pending; the transition (and refund, where the
    /// verdict calls for one) has been applied.
    Applied(Withdrawal),
    /// The request already reached a terminal state.
    NotPending(WithdrawalStatus),
}

/// Terminal state an administrator (or the requesting user) drives a
/// pending withdrawal into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalVerdict {
    /// Paid out; the submission-time deduction stands.
    Completed,
    /// Withdrawn by the user; the deduction is refunded.
    Cancelled,
    /// Refused by an administrator; the deduction is refunded.
    Rejected,
}

impl WithdrawalVerdict {
    pub fn status(&self) -> WithdrawalStatus {
        match self {
            WithdrawalVerdict::Completed => WithdrawalStatus::Completed,
            WithdrawalVerdict::Cancelled => WithdrawalStatus::Cancelled,
            WithdrawalVerdict::Rejected => WithdrawalStatus::Rejected,
        }
    }

    pub fn refunds(&self) -> bool {
        matches!(self, WithdrawalVerdict::Cancelled | WithdrawalVerdict::Rejected)
    }
}

/// Storage contract for the payout ledger.
pub trait LedgerStore: Send + Sync {
    // ------------------------------------------------------------------
    // Wallets & shadow balances
    // ------------------------------------------------------------------

    /// Lazily create the user's three wallets and shadow document.
    fn ensure_wallets(&self, user: UserId, now: DateTime<Utc>) -> StorageResult<()>;

    fn wallet(&self, user: UserId, wallet_type: WalletType) -> StorageResult<Option<Wallet>>;

    fn wallets(&self, user: UserId) -> StorageResult<Vec<Wallet>>;

    /// The denormalized per-user balance document (the "profile" view).
    fn user_balances(&self, user: UserId) -> StorageResult<Option<UserBalances>>;

    /// Direct shadow write; reserved for reconciler repairs.
    fn put_user_balances(&self, balances: &UserBalances) -> StorageResult<()>;

    fn users(&self) -> StorageResult<Vec<UserId>>;

    /// Atomically add to balance and total_in, mirroring the shadow field.
    /// Creates the wallet lazily.
    fn credit_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet>;

    /// Atomically subtract from balance and add to total_out, mirroring the
    /// shadow field. Fails with `InsufficientBalance` rather than going
    /// negative.
    fn debit_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet>;

    /// Reverse a prior deduction: balance += amount, total_out -= amount.
    fn refund_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet>;

    /// Credit the wallet named by `tx` and record `tx`, as one atomic step,
    /// if and only if no transaction with the same reference exists yet.
    ///
    /// Returns `false` (and applies nothing) when the reference is already
    /// present. This is the payout processor's exactly-once primitive.
    fn apply_earning(&self, tx: &LedgerTransaction, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Debit the wallet named by `out_tx`, credit the wallet named by
    /// `in_tx` and append both transaction records, as one atomic step. The
    /// debit is validated first; a failed transfer applies nothing.
    fn apply_transfer(
        &self,
        out_tx: &LedgerTransaction,
        in_tx: &LedgerTransaction,
        now: DateTime<Utc>,
    ) -> StorageResult<(Wallet, Wallet)>;

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    fn put_contract(&self, contract: &Contract) -> StorageResult<()>;

    fn contract(&self, id: ContractId) -> StorageResult<Option<Contract>>;

    fn contracts_for_user(&self, user: UserId) -> StorageResult<Vec<Contract>>;

    /// Active contracts whose maturity is at or before `now`, ordered by
    /// maturity.
    fn due_contracts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Contract>>;

    /// Conditionally mark a schedule entry completed (only while pending),
    /// maintaining the denormalized counters and flipping the contract to
    /// `Completed` when the last entry is paid.
    fn complete_schedule_entry(
        &self,
        id: ContractId,
        index: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<EntryCompletion>;

    /// Administrative void; applies only while the contract is active.
    fn void_contract(&self, id: ContractId) -> StorageResult<bool>;

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Append a transaction unless its reference already exists. Returns
    /// whether the insert happened.
    fn record_transaction(&self, tx: &LedgerTransaction) -> StorageResult<bool>;

    fn transaction_by_reference(&self, reference: &str)
        -> StorageResult<Option<LedgerTransaction>>;

    fn transactions_for_user(&self, user: UserId) -> StorageResult<Vec<LedgerTransaction>>;

    // ------------------------------------------------------------------
    // Withdrawals
    // ------------------------------------------------------------------

    /// Persist a pending withdrawal and apply its wallet deduction in one
    /// atomic step.
    fn submit_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet>;

    /// Plain document write; used for rejected-submission audit records,
    /// which carry no balance change.
    fn put_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<()>;

    fn withdrawal(&self, id: WithdrawalId) -> StorageResult<Option<Withdrawal>>;

    fn pending_withdrawal(
        &self,
        user: UserId,
        wallet_type: WalletType,
    ) -> StorageResult<Option<Withdrawal>>;

    /// All requests (any status) for the pair submitted on the given
    /// calendar day.
    fn withdrawals_on_day(
        &self,
        user: UserId,
        wallet_type: WalletType,
        day: NaiveDate,
    ) -> StorageResult<Vec<Withdrawal>>;

    /// Conditionally drive a pending withdrawal to a terminal state,
    /// applying the refund for cancelling/rejecting verdicts in the same
    /// atomic step. Exactly one of two concurrent callers wins.
    fn transition_withdrawal(
        &self,
        id: WithdrawalId,
        verdict: WithdrawalVerdict,
        remarks: Option<String>,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<TransitionOutcome>;

    // ------------------------------------------------------------------
    // Encashment settings
    // ------------------------------------------------------------------

    fn encashment_settings(
        &self,
        wallet_type: WalletType,
    ) -> StorageResult<Option<EncashmentSettings>>;

    fn put_encashment_settings(&self, settings: &EncashmentSettings) -> StorageResult<()>;
}
