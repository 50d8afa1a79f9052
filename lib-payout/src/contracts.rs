//! Contract activation and administrative voiding.
//!
//! Activation validates the principal against policy bounds before any
//! write, deducts the principal from the credit wallet, generates the
//! single-entry payout schedule deterministically, and records the
//! activation transaction - one logical operation.

use chrono::{DateTime, Utc};
use tracing::info;

use lib_store::LedgerStore;
use lib_types::{
    activation_reference, payout_amount, Amount, Bps, Contract, ContractId, LedgerTransaction,
    TransactionType, UserId, WalletType,
};

use crate::{PayoutError, PayoutResult};

/// Product policy for new contracts. Values are configuration, not
/// structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractPolicy {
    pub term_days: i64,
    pub multiplier_bps: Bps,
    pub min_principal: Amount,
    pub max_principal: Amount,
}

impl Default for ContractPolicy {
    fn default() -> Self {
        // 60-day term paying out 4x the principal.
        Self {
            term_days: 60,
            multiplier_bps: 40_000,
            min_principal: 1_000,
            max_principal: 1_000_000,
        }
    }
}

/// Activate a contract funded from the user's credit wallet.
pub fn activate_contract(
    store: &dyn LedgerStore,
    policy: &ContractPolicy,
    user: UserId,
    principal: Amount,
    now: DateTime<Utc>,
) -> PayoutResult<Contract> {
    // All validation happens before the first write; a rejected activation
    // leaves no partial state.
    if principal < policy.min_principal {
        return Err(PayoutError::PrincipalBelowMinimum {
            amount: principal,
            min: policy.min_principal,
        });
    }
    if principal > policy.max_principal {
        return Err(PayoutError::PrincipalAboveMaximum {
            amount: principal,
            max: policy.max_principal,
        });
    }
    if payout_amount(principal, policy.multiplier_bps).is_none() {
        return Err(PayoutError::AmountOverflow { principal });
    }

    store.debit_wallet(user, WalletType::Credit, principal, now)?;

    let contract = Contract::new(user, principal, policy.multiplier_bps, policy.term_days, now)
        .ok_or(PayoutError::AmountOverflow { principal })?;
    store.put_contract(&contract)?;

    let tx = LedgerTransaction::completed(
        user,
        TransactionType::Activation,
        WalletType::Credit,
        principal,
        activation_reference(&contract.id),
        format!("Contract activation {}", contract.id),
        now,
    );
    store.record_transaction(&tx)?;

    info!(
        user = %user,
        contract = %contract.id,
        principal,
        matures_at = %contract.matures_at,
        "contract activated"
    );
    Ok(contract)
}

/// Administrative void; applies only while the contract is still active.
/// Returns whether the void took effect.
pub fn void_contract(store: &dyn LedgerStore, id: ContractId) -> PayoutResult<bool> {
    let voided = store.void_contract(id)?;
    if voided {
        info!(contract = %id, "contract voided");
    }
    Ok(voided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_ledger::approve_deposit;
    use lib_store::{MemoryStore, StorageError};
    use lib_types::ContractStatus;

    fn funded_store(user: UserId, amount: Amount) -> MemoryStore {
        let store = MemoryStore::new();
        approve_deposit(&store, user, amount, "seed".into(), Utc::now()).unwrap();
        store
    }

    #[test]
    fn activation_deducts_principal_and_records() {
        let user = UserId::new();
        let store = funded_store(user, 100_000);
        let now = Utc::now();

        let contract =
            activate_contract(&store, &ContractPolicy::default(), user, 50_000, now).unwrap();

        assert_eq!(contract.status, ContractStatus::Active);
        assert_eq!(contract.payout_schedule.len(), 1);
        assert_eq!(contract.payout_schedule[0].amount, 200_000);

        let wallet = store.wallet(user, WalletType::Credit).unwrap().unwrap();
        assert_eq!(wallet.balance, 50_000);

        let reference = activation_reference(&contract.id);
        let tx = store.transaction_by_reference(&reference).unwrap().unwrap();
        assert_eq!(tx.tx_type, TransactionType::Activation);
        assert_eq!(tx.amount, 50_000);
    }

    #[test]
    fn principal_bounds_reject_before_any_write() {
        let user = UserId::new();
        let store = funded_store(user, 100_000);
        let policy = ContractPolicy::default();
        let now = Utc::now();

        let err = activate_contract(&store, &policy, user, 500, now).unwrap_err();
        assert!(matches!(err, PayoutError::PrincipalBelowMinimum { .. }));

        let err = activate_contract(&store, &policy, user, 2_000_000, now).unwrap_err();
        assert!(matches!(err, PayoutError::PrincipalAboveMaximum { .. }));

        // No deduction, no contract, no transaction beyond the seed deposit.
        let wallet = store.wallet(user, WalletType::Credit).unwrap().unwrap();
        assert_eq!(wallet.balance, 100_000);
        assert!(store.contracts_for_user(user).unwrap().is_empty());
        assert_eq!(store.transactions_for_user(user).unwrap().len(), 1);
    }

    #[test]
    fn unfunded_activation_fails_cleanly() {
        let user = UserId::new();
        let store = funded_store(user, 10_000);
        let err = activate_contract(
            &store,
            &ContractPolicy::default(),
            user,
            50_000,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PayoutError::Storage(StorageError::InsufficientBalance { .. })
        ));
        assert!(store.contracts_for_user(user).unwrap().is_empty());
    }

    #[test]
    fn void_is_conditional_on_active() {
        let user = UserId::new();
        let store = funded_store(user, 100_000);
        let contract = activate_contract(
            &store,
            &ContractPolicy::default(),
            user,
            50_000,
            Utc::now(),
        )
        .unwrap();

        assert!(void_contract(&store, contract.id).unwrap());
        assert!(!void_contract(&store, contract.id).unwrap());
    }
}
