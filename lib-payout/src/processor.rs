//! The payout processor.
//!
//! Transforms "a contract has matured with an unpaid schedule entry" into
//! "passive wallet credited once, earning recorded, entry marked paid".
//!
//! # Exactly-once
//!
//! Three store primitives carry the guarantee, so the processor is safe to
//! run concurrently with itself and to retry after a partial failure:
//!
//! 1. Entries already completed are skipped (re-read before acting).
//! 2. `apply_earning` credits the wallet and records the earning as one
//!    atomic step, keyed on the derived reference `earning:{contract}:{n}`;
//!    a second attempt finds the reference and applies nothing.
//! 3. `complete_schedule_entry` is conditional on the entry still being
//!    pending; the loser of a race observes `AlreadyCompleted` and moves on.
//!
//! A run that died after the credit but before marking the entry is
//! recovered on the next tick: the reference already exists, so only the
//! completion is replayed.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use lib_store::{EntryCompletion, LedgerStore};
use lib_types::{
    earning_reference, payout_amount, Contract, ContractId, ContractStatus, EntryStatus,
    LedgerTransaction, TransactionType, WalletType,
};

use crate::{PayoutError, PayoutResult};

/// Scan all matured contracts and pay every due pending entry. Returns the
/// number of payouts processed by this run.
pub fn process_pending_payouts(store: &dyn LedgerStore, now: DateTime<Utc>) -> PayoutResult<usize> {
    let due = store.due_contracts(now)?;
    debug!(contracts = due.len(), "payout scan");

    let mut processed = 0;
    for contract in due {
        processed += process_one(store, &contract, now)?;
    }
    if processed > 0 {
        info!(processed, "payout run complete");
    }
    Ok(processed)
}

/// Manual trigger for a single contract.
pub fn process_contract(
    store: &dyn LedgerStore,
    id: ContractId,
    now: DateTime<Utc>,
) -> PayoutResult<usize> {
    let contract = store.contract(id)?.ok_or(PayoutError::ContractNotFound(id))?;
    if contract.status != ContractStatus::Active {
        return Ok(0);
    }
    process_one(store, &contract, now)
}

fn process_one(
    store: &dyn LedgerStore,
    contract: &Contract,
    now: DateTime<Utc>,
) -> PayoutResult<usize> {
    let mut processed = 0;

    for (index, entry) in contract.payout_schedule.iter().enumerate() {
        if entry.status != EntryStatus::Pending || entry.due_at > now {
            continue;
        }

        // Never trust the cached entry amount; recompute from the stored
        // principal and multiplier.
        let amount = payout_amount(contract.principal, contract.multiplier_bps).ok_or(
            PayoutError::AmountOverflow {
                principal: contract.principal,
            },
        )?;

        let reference = earning_reference(&contract.id, index);
        let tx = LedgerTransaction::completed(
            contract.user,
            TransactionType::Earning,
            WalletType::Passive,
            amount,
            reference.clone(),
            format!("Maturity payout for contract {}", contract.id),
            now,
        );
        if store.apply_earning(&tx, now)? {
            debug!(
                contract = %contract.id,
                index,
                amount,
                "wallet credited for matured entry"
            );
        } else {
            // A previous run credited this entry but died before marking it;
            // finish the bookkeeping without touching the balance.
            warn!(
                contract = %contract.id,
                index,
                "earning already recorded; completing schedule entry only"
            );
        }

        match store.complete_schedule_entry(contract.id, index, now)? {
            EntryCompletion::Completed(updated) => {
                processed += 1;
                if updated.status == ContractStatus::Completed {
                    info!(
                        contract = %updated.id,
                        user = %updated.user,
                        "contract completed"
                    );
                }
            }
            EntryCompletion::AlreadyCompleted => {
                debug!(
                    contract = %contract.id,
                    index,
                    "entry completed by a concurrent run"
                );
            }
        }
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{activate_contract, ContractPolicy};
    use chrono::Duration;
    use lib_ledger::approve_deposit;
    use lib_store::MemoryStore;
    use lib_types::{ScheduleEntry, UserId};

    fn setup(principal: u64) -> (MemoryStore, UserId, Contract, DateTime<Utc>) {
        let store = MemoryStore::new();
        let user = UserId::new();
        let start = Utc::now();
        approve_deposit(&store, user, principal, "seed".into(), start).unwrap();
        let contract =
            activate_contract(&store, &ContractPolicy::default(), user, principal, start).unwrap();
        (store, user, contract, start)
    }

    #[test]
    fn nothing_due_before_maturity() {
        let (store, _, _, start) = setup(50_000);
        assert_eq!(process_pending_payouts(&store, start).unwrap(), 0);
        assert_eq!(
            process_pending_payouts(&store, start + Duration::days(59)).unwrap(),
            0
        );
    }

    #[test]
    fn maturity_pays_once_and_completes_contract() {
        let (store, user, contract, start) = setup(50_000);
        let after = start + Duration::days(61);

        assert_eq!(process_pending_payouts(&store, after).unwrap(), 1);

        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 200_000);

        let tx = store
            .transaction_by_reference(&earning_reference(&contract.id, 0))
            .unwrap()
            .unwrap();
        assert_eq!(tx.tx_type, TransactionType::Earning);
        assert_eq!(tx.amount, 200_000);

        let updated = store.contract(contract.id).unwrap().unwrap();
        assert_eq!(updated.status, ContractStatus::Completed);
        assert_eq!(updated.remaining_payouts, 0);
        assert_eq!(updated.total_payouts, 1);
        assert!(updated.counters_consistent());

        // Shadow stayed in lockstep.
        assert_eq!(store.user_balances(user).unwrap().unwrap().passive, 200_000);
    }

    #[test]
    fn double_run_credits_exactly_once() {
        let (store, user, _, start) = setup(50_000);
        let after = start + Duration::days(61);

        assert_eq!(process_pending_payouts(&store, after).unwrap(), 1);
        assert_eq!(process_pending_payouts(&store, after).unwrap(), 0);
        assert_eq!(process_pending_payouts(&store, after).unwrap(), 0);

        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 200_000);
        assert_eq!(wallet.total_in, 200_000);
    }

    #[test]
    fn crashed_run_is_recovered_without_recredit() {
        let (store, user, contract, start) = setup(50_000);
        let after = start + Duration::days(61);

        // Simulate a run that credited and recorded the earning but died
        // before marking the schedule entry.
        let tx = LedgerTransaction::completed(
            user,
            TransactionType::Earning,
            WalletType::Passive,
            200_000,
            earning_reference(&contract.id, 0),
            "maturity payout".into(),
            after,
        );
        assert!(store.apply_earning(&tx, after).unwrap());
        let stored = store.contract(contract.id).unwrap().unwrap();
        assert_eq!(stored.remaining_payouts, 1); // entry still pending

        // Next scheduler tick finishes the bookkeeping; balance unchanged.
        assert_eq!(process_pending_payouts(&store, after).unwrap(), 1);
        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 200_000);

        let updated = store.contract(contract.id).unwrap().unwrap();
        assert_eq!(updated.status, ContractStatus::Completed);
    }

    #[test]
    fn manual_trigger_processes_one_contract() {
        let (store, user, contract, start) = setup(50_000);
        let after = start + Duration::days(61);

        assert_eq!(process_contract(&store, contract.id, after).unwrap(), 1);
        assert_eq!(process_contract(&store, contract.id, after).unwrap(), 0);
        assert_eq!(
            store.wallet(user, WalletType::Passive).unwrap().unwrap().balance,
            200_000
        );
    }

    #[test]
    fn multi_entry_schedule_pays_only_due_entries() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let start = Utc::now();

        // Hand-built two-entry schedule; the model supports it even though
        // activation currently generates one entry.
        let mut contract = Contract::new(user, 10_000, 20_000, 30, start).unwrap();
        let amount = contract.payout_schedule[0].amount;
        contract.payout_schedule = vec![
            ScheduleEntry::pending(start + Duration::days(30), amount),
            ScheduleEntry::pending(start + Duration::days(60), amount),
        ];
        contract.remaining_payouts = 2;
        contract.matures_at = start + Duration::days(30);
        store.put_contract(&contract).unwrap();

        let mid = start + Duration::days(31);
        assert_eq!(process_pending_payouts(&store, mid).unwrap(), 1);
        let stored = store.contract(contract.id).unwrap().unwrap();
        assert_eq!(stored.status, ContractStatus::Active);
        assert_eq!(stored.remaining_payouts, 1);
        assert!(stored.counters_consistent());

        let end = start + Duration::days(61);
        assert_eq!(process_pending_payouts(&store, end).unwrap(), 1);
        let stored = store.contract(contract.id).unwrap().unwrap();
        assert_eq!(stored.status, ContractStatus::Completed);
        assert!(stored.counters_consistent());
    }

    #[test]
    fn voided_contract_is_never_paid() {
        let (store, user, contract, start) = setup(50_000);
        store.void_contract(contract.id).unwrap();

        let after = start + Duration::days(61);
        assert_eq!(process_pending_payouts(&store, after).unwrap(), 0);
        assert!(store.wallet(user, WalletType::Passive).unwrap().is_none());
        assert_eq!(process_contract(&store, contract.id, after).unwrap(), 0);
    }
}
