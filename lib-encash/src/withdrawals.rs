//! The withdrawal state machine.
//!
//! Submission validates in a fixed order, short-circuiting on the first
//! failure. Business-rule refusals persist a REJECTED withdrawal with a
//! reason code (the audit trail the product relies on); plain validation
//! errors return without touching storage. A successful submission deducts
//! the amount from the wallet and persists the PENDING request in one
//! atomic store operation - no transaction record yet.
//!
//! Terminal transitions go through the store's conditional update ("only
//! if still PENDING"), so of two concurrent actors exactly one wins and
//! the other observes the terminal state. Completion records the
//! withdrawal transaction; cancellation and rejection refund the deduction
//! exactly once and record nothing.

use chrono::{DateTime, Utc};
use tracing::info;

use lib_store::{LedgerStore, TransitionOutcome, WithdrawalVerdict};
use lib_types::{
    withdrawal_reference, AccountDetails, Amount, LedgerTransaction, PayoutMethod, RejectReason,
    TransactionType, UserId, WalletType, Withdrawal, WithdrawalId, WithdrawalStatus,
};

use crate::window::encashment_status;
use crate::{EncashError, EncashResult};

/// Per-wallet-type withdrawal minimums. Policy values, not structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawalPolicy {
    pub min_credit: Amount,
    pub min_passive: Amount,
    pub min_bonus: Amount,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            min_credit: 300,
            min_passive: 300,
            min_bonus: 500,
        }
    }
}

impl WithdrawalPolicy {
    pub fn minimum(&self, wallet_type: WalletType) -> Amount {
        match wallet_type {
            WalletType::Credit => self.min_credit,
            WalletType::Passive => self.min_passive,
            WalletType::Bonus => self.min_bonus,
        }
    }
}

/// Submit a withdrawal request.
///
/// Validation order: encashment window, amount, minimum, account details,
/// balance, no other pending request, one request per wallet per day.
pub fn request_withdrawal(
    store: &dyn LedgerStore,
    policy: &WithdrawalPolicy,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    method: PayoutMethod,
    account: AccountDetails,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    // 1. Encashment window.
    let window = encashment_status(store, wallet_type, now)?;
    if !window.is_allowed {
        return refuse(
            store,
            user,
            wallet_type,
            amount,
            method,
            account,
            RejectReason::WindowClosed {
                window: window.reason,
            },
            now,
        );
    }

    // 2. Amount validity. A malformed amount is a validation error, not a
    // business rejection; nothing is persisted.
    if amount == 0 {
        return Err(EncashError::InvalidAmount);
    }

    // 3. Wallet-type minimum.
    let minimum = policy.minimum(wallet_type);
    if amount < minimum {
        return refuse(
            store,
            user,
            wallet_type,
            amount,
            method,
            account,
            RejectReason::BelowMinimum { minimum },
            now,
        );
    }

    // 4. Destination account. The method itself is already a closed enum;
    // unknown methods never get past the boundary.
    if !account.is_complete() {
        return Err(EncashError::IncompleteAccountDetails);
    }

    // 5. Sufficient balance.
    let balance = store
        .wallet(user, wallet_type)?
        .map(|w| w.balance)
        .unwrap_or(0);
    if balance < amount {
        return refuse(
            store,
            user,
            wallet_type,
            amount,
            method,
            account,
            RejectReason::InsufficientBalance { balance },
            now,
        );
    }

    // 6. One in-flight request per (user, wallet type).
    if store.pending_withdrawal(user, wallet_type)?.is_some() {
        return refuse(
            store,
            user,
            wallet_type,
            amount,
            method,
            account,
            RejectReason::PendingExists,
            now,
        );
    }

    // 7. One request per wallet per calendar day; cancelled and rejected
    // requests do not count.
    let counts_against_limit = store
        .withdrawals_on_day(user, wallet_type, now.date_naive())?
        .iter()
        .any(|w| {
            matches!(
                w.status,
                WithdrawalStatus::Pending | WithdrawalStatus::Completed
            )
        });
    if counts_against_limit {
        return refuse(
            store,
            user,
            wallet_type,
            amount,
            method,
            account,
            RejectReason::DailyLimitReached,
            now,
        );
    }

    // Deduct now, pay later. The deduction and the PENDING record are one
    // atomic store operation.
    let withdrawal = Withdrawal::pending(user, wallet_type, amount, method, account, now);
    store.submit_withdrawal(&withdrawal, now)?;

    info!(
        user = %user,
        withdrawal = %withdrawal.id,
        wallet = %wallet_type,
        amount,
        "withdrawal submitted; balance deducted"
    );
    Ok(withdrawal)
}

/// Persist the REJECTED audit record and surface the refusal.
#[allow(clippy::too_many_arguments)]
fn refuse(
    store: &dyn LedgerStore,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    method: PayoutMethod,
    account: AccountDetails,
    reason: RejectReason,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    let record = Withdrawal::rejected(user, wallet_type, amount, method, account, reason.clone(), now);
    store.put_withdrawal(&record)?;
    info!(
        user = %user,
        wallet = %wallet_type,
        amount,
        reason = reason.as_code(),
        "withdrawal refused"
    );
    Err(EncashError::Rejected {
        id: record.id,
        reason,
    })
}

/// PENDING -> COMPLETED. The submission-time deduction stands; records the
/// withdrawal transaction.
pub fn approve(
    store: &dyn LedgerStore,
    id: WithdrawalId,
    actor: UserId,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    finalize(store, id, WithdrawalVerdict::Completed, None, actor, now)
}

/// PENDING -> COMPLETED with operator remarks ("set as paid").
pub fn mark_paid(
    store: &dyn LedgerStore,
    id: WithdrawalId,
    actor: UserId,
    remarks: Option<String>,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    finalize(store, id, WithdrawalVerdict::Completed, remarks, actor, now)
}

/// PENDING -> REJECTED. Refunds the deduction.
pub fn reject(
    store: &dyn LedgerStore,
    id: WithdrawalId,
    actor: UserId,
    remarks: Option<String>,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    finalize(store, id, WithdrawalVerdict::Rejected, remarks, actor, now)
}

/// PENDING -> CANCELLED. Refunds the deduction.
pub fn cancel(
    store: &dyn LedgerStore,
    id: WithdrawalId,
    actor: UserId,
    remarks: Option<String>,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    finalize(store, id, WithdrawalVerdict::Cancelled, remarks, actor, now)
}

fn finalize(
    store: &dyn LedgerStore,
    id: WithdrawalId,
    verdict: WithdrawalVerdict,
    remarks: Option<String>,
    actor: UserId,
    now: DateTime<Utc>,
) -> EncashResult<Withdrawal> {
    let outcome = match store.transition_withdrawal(id, verdict, remarks, Some(actor), now) {
        Ok(outcome) => outcome,
        Err(lib_store::StorageError::WithdrawalNotFound(id)) => {
            return Err(EncashError::NotFound(id))
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        TransitionOutcome::Applied(withdrawal) => {
            if verdict == WithdrawalVerdict::Completed {
                let tx = LedgerTransaction::completed(
                    withdrawal.user,
                    TransactionType::Withdrawal,
                    withdrawal.wallet_type,
                    withdrawal.amount,
                    withdrawal_reference(&withdrawal.id),
                    format!("Withdrawal via {}", withdrawal.method),
                    now,
                );
                store.record_transaction(&tx)?;
            }
            info!(
                withdrawal = %withdrawal.id,
                status = %withdrawal.status,
                actor = %actor,
                "withdrawal finalized"
            );
            Ok(withdrawal)
        }
        TransitionOutcome::NotPending(status) => Err(EncashError::NotPending { id, status }),
    }
}
