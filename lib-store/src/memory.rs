//! In-memory `LedgerStore` backend.
//!
//! Used by unit tests and one-shot tooling. A single `RwLock` over the
//! whole document set makes every compound mutation trivially atomic; the
//! semantics match `SledStore` exactly.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};

use lib_types::{
    Amount, Contract, ContractId, ContractStatus, EncashmentSettings, EntryStatus,
    LedgerTransaction, RejectReason, UserBalances, UserId, Wallet, WalletType, Withdrawal,
    WithdrawalId, WithdrawalStatus,
};

use crate::{
    EntryCompletion, LedgerStore, StorageError, StorageResult, TransitionOutcome,
    WithdrawalVerdict,
};

#[derive(Default)]
struct Inner {
    wallets: HashMap<(UserId, WalletType), Wallet>,
    balances: HashMap<UserId, UserBalances>,
    contracts: HashMap<ContractId, Contract>,
    transactions: HashMap<String, LedgerTransaction>,
    withdrawals: HashMap<WithdrawalId, Withdrawal>,
    settings: HashMap<WalletType, EncashmentSettings>,
}

/// Memory-backed store; cheap to create per test.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StorageError::Database("store lock poisoned".into()))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StorageError::Database("store lock poisoned".into()))
    }
}

/// Apply a credit to a (possibly missing) wallet and mirror the shadow.
fn credit_in_place(
    inner: &mut Inner,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let wallet = inner
        .wallets
        .entry((user, wallet_type))
        .or_insert_with(|| Wallet::new(user, wallet_type, now));
    wallet.balance = wallet.balance.checked_add(amount).ok_or(StorageError::Overflow)?;
    wallet.total_in = wallet
        .total_in
        .checked_add(amount)
        .ok_or(StorageError::Overflow)?;
    wallet.updated_at = now;
    let updated = wallet.clone();

    mirror_shadow(inner, user, wallet_type, updated.balance, now);
    Ok(updated)
}

fn debit_in_place(
    inner: &mut Inner,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let wallet = match inner.wallets.get_mut(&(user, wallet_type)) {
        Some(w) => w,
        None => {
            return Err(StorageError::InsufficientBalance {
                have: 0,
                need: amount,
            })
        }
    };
    if wallet.balance < amount {
        return Err(StorageError::InsufficientBalance {
            have: wallet.balance,
            need: amount,
        });
    }
    wallet.balance -= amount;
    wallet.total_out = wallet
        .total_out
        .checked_add(amount)
        .ok_or(StorageError::Overflow)?;
    wallet.updated_at = now;
    let updated = wallet.clone();

    mirror_shadow(inner, user, wallet_type, updated.balance, now);
    Ok(updated)
}

fn refund_in_place(
    inner: &mut Inner,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let wallet = inner
        .wallets
        .get_mut(&(user, wallet_type))
        .ok_or(StorageError::WalletNotFound { user, wallet_type })?;
    wallet.balance = wallet.balance.checked_add(amount).ok_or(StorageError::Overflow)?;
    wallet.total_out = wallet
        .total_out
        .checked_sub(amount)
        .ok_or(StorageError::Underflow)?;
    wallet.updated_at = now;
    let updated = wallet.clone();

    mirror_shadow(inner, user, wallet_type, updated.balance, now);
    Ok(updated)
}

fn mirror_shadow(
    inner: &mut Inner,
    user: UserId,
    wallet_type: WalletType,
    balance: Amount,
    now: DateTime<Utc>,
) {
    let shadow = inner
        .balances
        .entry(user)
        .or_insert_with(|| UserBalances::new(user, now));
    shadow.set(wallet_type, balance);
    shadow.updated_at = now;
}

impl LedgerStore for MemoryStore {
    fn ensure_wallets(&self, user: UserId, now: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.write()?;
        for wallet_type in WalletType::ALL {
            inner
                .wallets
                .entry((user, wallet_type))
                .or_insert_with(|| Wallet::new(user, wallet_type, now));
        }
        inner
            .balances
            .entry(user)
            .or_insert_with(|| UserBalances::new(user, now));
        Ok(())
    }

    fn wallet(&self, user: UserId, wallet_type: WalletType) -> StorageResult<Option<Wallet>> {
        Ok(self.read()?.wallets.get(&(user, wallet_type)).cloned())
    }

    fn wallets(&self, user: UserId) -> StorageResult<Vec<Wallet>> {
        let inner = self.read()?;
        let mut wallets: Vec<Wallet> = inner
            .wallets
            .values()
            .filter(|w| w.user == user)
            .cloned()
            .collect();
        wallets.sort_by_key(|w| w.wallet_type);
        Ok(wallets)
    }

    fn user_balances(&self, user: UserId) -> StorageResult<Option<UserBalances>> {
        Ok(self.read()?.balances.get(&user).cloned())
    }

    fn put_user_balances(&self, balances: &UserBalances) -> StorageResult<()> {
        self.write()?.balances.insert(balances.user, balances.clone());
        Ok(())
    }

    fn users(&self) -> StorageResult<Vec<UserId>> {
        let inner = self.read()?;
        let mut users: Vec<UserId> = inner.balances.keys().copied().collect();
        for (user, _) in inner.wallets.keys() {
            if !users.contains(user) {
                users.push(*user);
            }
        }
        users.sort();
        Ok(users)
    }

    fn credit_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let mut inner = self.write()?;
        credit_in_place(&mut inner, user, wallet_type, amount, now)
    }

    fn debit_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let mut inner = self.write()?;
        debit_in_place(&mut inner, user, wallet_type, amount, now)
    }

    fn refund_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let mut inner = self.write()?;
        refund_in_place(&mut inner, user, wallet_type, amount, now)
    }

    fn apply_earning(&self, tx: &LedgerTransaction, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut inner = self.write()?;
        if inner.transactions.contains_key(&tx.reference) {
            return Ok(false);
        }
        credit_in_place(&mut inner, tx.user, tx.wallet_type, tx.amount, now)?;
        inner.transactions.insert(tx.reference.clone(), tx.clone());
        Ok(true)
    }

    fn apply_transfer(
        &self,
        out_tx: &LedgerTransaction,
        in_tx: &LedgerTransaction,
        now: DateTime<Utc>,
    ) -> StorageResult<(Wallet, Wallet)> {
        let mut inner = self.write()?;
        let source = debit_in_place(&mut inner, out_tx.user, out_tx.wallet_type, out_tx.amount, now)?;
        let destination =
            match credit_in_place(&mut inner, in_tx.user, in_tx.wallet_type, in_tx.amount, now) {
                Ok(wallet) => wallet,
                Err(e) => {
                    // Undo the debit so the failed credit leaves no trace.
                    refund_in_place(&mut inner, out_tx.user, out_tx.wallet_type, out_tx.amount, now)?;
                    return Err(e);
                }
            };
        inner.transactions.insert(out_tx.reference.clone(), out_tx.clone());
        inner.transactions.insert(in_tx.reference.clone(), in_tx.clone());
        Ok((source, destination))
    }

    fn put_contract(&self, contract: &Contract) -> StorageResult<()> {
        self.write()?.contracts.insert(contract.id, contract.clone());
        Ok(())
    }

    fn contract(&self, id: ContractId) -> StorageResult<Option<Contract>> {
        Ok(self.read()?.contracts.get(&id).cloned())
    }

    fn contracts_for_user(&self, user: UserId) -> StorageResult<Vec<Contract>> {
        let inner = self.read()?;
        let mut contracts: Vec<Contract> = inner
            .contracts
            .values()
            .filter(|c| c.user == user)
            .cloned()
            .collect();
        contracts.sort_by_key(|c| c.started_at);
        Ok(contracts)
    }

    fn due_contracts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Contract>> {
        let inner = self.read()?;
        let mut due: Vec<Contract> = inner
            .contracts
            .values()
            .filter(|c| c.status == ContractStatus::Active && c.matures_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|c| c.matures_at);
        Ok(due)
    }

    fn complete_schedule_entry(
        &self,
        id: ContractId,
        index: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<EntryCompletion> {
        let mut inner = self.write()?;
        let contract = inner
            .contracts
            .get_mut(&id)
            .ok_or(StorageError::ContractNotFound(id))?;
        let entry = contract
            .payout_schedule
            .get_mut(index)
            .ok_or(StorageError::EntryOutOfRange { contract: id, index })?;

        if entry.status == EntryStatus::Completed {
            return Ok(EntryCompletion::AlreadyCompleted);
        }
        entry.status = EntryStatus::Completed;
        entry.completed_at = Some(now);
        contract.remaining_payouts = contract.remaining_payouts.saturating_sub(1);
        contract.total_payouts += 1;
        if contract.remaining_payouts == 0 && contract.status == ContractStatus::Active {
            contract.status = ContractStatus::Completed;
        }
        Ok(EntryCompletion::Completed(contract.clone()))
    }

    fn void_contract(&self, id: ContractId) -> StorageResult<bool> {
        let mut inner = self.write()?;
        let contract = inner
            .contracts
            .get_mut(&id)
            .ok_or(StorageError::ContractNotFound(id))?;
        if contract.status != ContractStatus::Active {
            return Ok(false);
        }
        contract.status = ContractStatus::Voided;
        Ok(true)
    }

    fn record_transaction(&self, tx: &LedgerTransaction) -> StorageResult<bool> {
        let mut inner = self.write()?;
        if inner.transactions.contains_key(&tx.reference) {
            return Ok(false);
        }
        inner.transactions.insert(tx.reference.clone(), tx.clone());
        Ok(true)
    }

    fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> StorageResult<Option<LedgerTransaction>> {
        Ok(self.read()?.transactions.get(reference).cloned())
    }

    fn transactions_for_user(&self, user: UserId) -> StorageResult<Vec<LedgerTransaction>> {
        let inner = self.read()?;
        let mut txs: Vec<LedgerTransaction> = inner
            .transactions
            .values()
            .filter(|t| t.user == user)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }

    fn submit_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let mut inner = self.write()?;
        let wallet = debit_in_place(
            &mut inner,
            withdrawal.user,
            withdrawal.wallet_type,
            withdrawal.amount,
            now,
        )?;
        inner.withdrawals.insert(withdrawal.id, withdrawal.clone());
        Ok(wallet)
    }

    fn put_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<()> {
        self.write()?
            .withdrawals
            .insert(withdrawal.id, withdrawal.clone());
        Ok(())
    }

    fn withdrawal(&self, id: WithdrawalId) -> StorageResult<Option<Withdrawal>> {
        Ok(self.read()?.withdrawals.get(&id).cloned())
    }

    fn pending_withdrawal(
        &self,
        user: UserId,
        wallet_type: WalletType,
    ) -> StorageResult<Option<Withdrawal>> {
        let inner = self.read()?;
        Ok(inner
            .withdrawals
            .values()
            .find(|w| {
                w.user == user
                    && w.wallet_type == wallet_type
                    && w.status == WithdrawalStatus::Pending
            })
            .cloned())
    }

    fn withdrawals_on_day(
        &self,
        user: UserId,
        wallet_type: WalletType,
        day: NaiveDate,
    ) -> StorageResult<Vec<Withdrawal>> {
        let inner = self.read()?;
        let mut matches: Vec<Withdrawal> = inner
            .withdrawals
            .values()
            .filter(|w| {
                w.user == user
                    && w.wallet_type == wallet_type
                    && w.requested_at.date_naive() == day
            })
            .cloned()
            .collect();
        matches.sort_by_key(|w| w.requested_at);
        Ok(matches)
    }

    fn transition_withdrawal(
        &self,
        id: WithdrawalId,
        verdict: WithdrawalVerdict,
        remarks: Option<String>,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<TransitionOutcome> {
        let mut inner = self.write()?;
        let current = inner
            .withdrawals
            .get(&id)
            .ok_or(StorageError::WithdrawalNotFound(id))?
            .clone();
        if current.status != WithdrawalStatus::Pending {
            return Ok(TransitionOutcome::NotPending(current.status));
        }

        if verdict.refunds() {
            refund_in_place(&mut inner, current.user, current.wallet_type, current.amount, now)?;
        }

        let mut updated = current;
        updated.status = verdict.status();
        updated.remarks = remarks;
        updated.acted_by = actor;
        updated.acted_at = Some(now);
        if verdict == WithdrawalVerdict::Rejected {
            updated.reject_reason = Some(RejectReason::AdminRejected);
        }
        inner.withdrawals.insert(id, updated.clone());
        Ok(TransitionOutcome::Applied(updated))
    }

    fn encashment_settings(
        &self,
        wallet_type: WalletType,
    ) -> StorageResult<Option<EncashmentSettings>> {
        Ok(self.read()?.settings.get(&wallet_type).cloned())
    }

    fn put_encashment_settings(&self, settings: &EncashmentSettings) -> StorageResult<()> {
        self.write()?
            .settings
            .insert(settings.wallet_type, settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_types::{earning_reference, AccountDetails, PayoutMethod, TransactionType};

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[test]
    fn credit_mirrors_shadow_balance() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();

        let wallet = store
            .credit_wallet(user, WalletType::Credit, 5_000, now)
            .unwrap();
        assert_eq!(wallet.balance, 5_000);
        assert_eq!(wallet.total_in, 5_000);

        let shadow = store.user_balances(user).unwrap().unwrap();
        assert_eq!(shadow.credit, 5_000);
        assert_eq!(shadow.passive, 0);
    }

    #[test]
    fn debit_refuses_to_go_negative() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 100, now).unwrap();

        let err = store
            .debit_wallet(user, WalletType::Passive, 150, now)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::InsufficientBalance { have: 100, need: 150 }
        ));

        // Nothing changed.
        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 100);
        assert_eq!(store.user_balances(user).unwrap().unwrap().passive, 100);
    }

    #[test]
    fn refund_reverses_a_debit_exactly() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 10_000, now).unwrap();
        store.debit_wallet(user, WalletType::Passive, 3_000, now).unwrap();

        let wallet = store
            .refund_wallet(user, WalletType::Passive, 3_000, now)
            .unwrap();
        assert_eq!(wallet.balance, 10_000);
        assert_eq!(wallet.total_in, 10_000);
        assert_eq!(wallet.total_out, 0);
        assert!(wallet.totals_consistent());
    }

    #[test]
    fn apply_earning_is_reference_unique() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        let contract = ContractId::new();
        let tx = LedgerTransaction::completed(
            user,
            TransactionType::Earning,
            WalletType::Passive,
            200_000,
            earning_reference(&contract, 0),
            "maturity payout".into(),
            now,
        );

        assert!(store.apply_earning(&tx, now).unwrap());
        assert!(!store.apply_earning(&tx, now).unwrap());

        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 200_000);
    }

    #[test]
    fn unfunded_transfer_applies_nothing() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Credit, 1_000, now).unwrap();

        let pair = lib_types::TxId::new();
        let out_tx = LedgerTransaction::completed(
            user,
            TransactionType::Withdrawal,
            WalletType::Credit,
            5_000,
            lib_types::transfer_out_reference(&pair),
            "transfer out".into(),
            now,
        );
        let in_tx = LedgerTransaction::completed(
            user,
            TransactionType::Deposit,
            WalletType::Passive,
            5_000,
            lib_types::transfer_in_reference(&pair),
            "transfer in".into(),
            now,
        );

        let err = store.apply_transfer(&out_tx, &in_tx, now).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientBalance { .. }));

        assert_eq!(
            store.wallet(user, WalletType::Credit).unwrap().unwrap().balance,
            1_000
        );
        assert!(store.wallet(user, WalletType::Passive).unwrap().is_none());
        assert!(store
            .transaction_by_reference(&out_tx.reference)
            .unwrap()
            .is_none());
    }

    #[test]
    fn complete_schedule_entry_is_conditional() {
        let store = store();
        let now = Utc::now();
        let contract = Contract::new(UserId::new(), 50_000, 40_000, 60, now).unwrap();
        let id = contract.id;
        store.put_contract(&contract).unwrap();

        match store.complete_schedule_entry(id, 0, now).unwrap() {
            EntryCompletion::Completed(updated) => {
                assert_eq!(updated.status, ContractStatus::Completed);
                assert_eq!(updated.remaining_payouts, 0);
                assert_eq!(updated.total_payouts, 1);
                assert!(updated.counters_consistent());
            }
            EntryCompletion::AlreadyCompleted => panic!("first completion must apply"),
        }

        assert!(matches!(
            store.complete_schedule_entry(id, 0, now).unwrap(),
            EntryCompletion::AlreadyCompleted
        ));
    }

    #[test]
    fn void_applies_only_to_active_contracts() {
        let store = store();
        let now = Utc::now();
        let contract = Contract::new(UserId::new(), 10_000, 40_000, 60, now).unwrap();
        let id = contract.id;
        store.put_contract(&contract).unwrap();

        assert!(store.void_contract(id).unwrap());
        assert!(!store.void_contract(id).unwrap());
        assert_eq!(
            store.contract(id).unwrap().unwrap().status,
            ContractStatus::Voided
        );
    }

    #[test]
    fn withdrawal_transition_single_winner() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 10_000, now).unwrap();

        let withdrawal = Withdrawal::pending(
            user,
            WalletType::Passive,
            3_000,
            PayoutMethod::Gcash,
            AccountDetails::new("Test", "0917"),
            now,
        );
        let wallet = store.submit_withdrawal(&withdrawal, now).unwrap();
        assert_eq!(wallet.balance, 7_000);

        // Admin approves; concurrent cancel must observe the terminal state.
        let admin = UserId::new();
        let outcome = store
            .transition_withdrawal(withdrawal.id, WithdrawalVerdict::Completed, None, Some(admin), now)
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));

        let outcome = store
            .transition_withdrawal(withdrawal.id, WithdrawalVerdict::Cancelled, None, Some(user), now)
            .unwrap();
        match outcome {
            TransitionOutcome::NotPending(status) => {
                assert_eq!(status, WithdrawalStatus::Completed)
            }
            TransitionOutcome::Applied(_) => panic!("loser must not apply"),
        }

        // Balance untouched by the losing cancel.
        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 7_000);
    }

    #[test]
    fn cancel_refunds_once() {
        let store = store();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 10_000, now).unwrap();

        let withdrawal = Withdrawal::pending(
            user,
            WalletType::Passive,
            3_000,
            PayoutMethod::Maya,
            AccountDetails::new("Test", "0918"),
            now,
        );
        store.submit_withdrawal(&withdrawal, now).unwrap();
        store
            .transition_withdrawal(
                withdrawal.id,
                WithdrawalVerdict::Cancelled,
                Some("changed my mind".into()),
                Some(user),
                now,
            )
            .unwrap();

        let wallet = store.wallet(user, WalletType::Passive).unwrap().unwrap();
        assert_eq!(wallet.balance, 10_000);
        assert_eq!(store.user_balances(user).unwrap().unwrap().passive, 10_000);
    }
}
