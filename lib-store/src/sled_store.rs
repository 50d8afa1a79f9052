//! Sled-based `LedgerStore` implementation.
//!
//! One tree per document type, JSON-encoded values, plus two secondary
//! index trees (contracts by maturity, withdrawals by user). Every compound
//! mutation runs inside a sled multi-tree transaction, so a crash can never
//! leave a wallet credited without its transaction record, a debit without
//! its withdrawal, or a wallet without its shadow copy. The write mutex
//! additionally serializes in-process writers so concurrent compound
//! mutations never contend on transaction retries.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use tracing::debug;

use lib_types::{
    Amount, Contract, ContractId, ContractStatus, EncashmentSettings, EntryStatus,
    LedgerTransaction, RejectReason, UserBalances, UserId, Wallet, WalletType, Withdrawal,
    WithdrawalId, WithdrawalStatus,
};

use crate::{
    EntryCompletion, LedgerStore, StorageError, StorageResult, TransitionOutcome,
    WithdrawalVerdict,
};

// =============================================================================
// TREE NAMES (FIXED - DO NOT CHANGE)
// =============================================================================
// These names are the on-disk schema. Changing them strands existing data.
// =============================================================================

const TREE_WALLETS: &str = "wallets";
const TREE_USER_BALANCES: &str = "user_balances";
const TREE_CONTRACTS: &str = "contracts";
const TREE_CONTRACTS_BY_MATURITY: &str = "contracts_by_maturity";
const TREE_TRANSACTIONS: &str = "transactions";
const TREE_TRANSACTIONS_BY_USER: &str = "transactions_by_user";
const TREE_WITHDRAWALS: &str = "withdrawals";
const TREE_WITHDRAWALS_BY_USER: &str = "withdrawals_by_user";
const TREE_ENCASHMENT: &str = "encashment_settings";

/// Sled-backed store.
pub struct SledStore {
    _db: Db,
    wallets: Tree,
    user_balances: Tree,
    contracts: Tree,
    contracts_by_maturity: Tree,
    transactions: Tree,
    transactions_by_user: Tree,
    withdrawals: Tree,
    withdrawals_by_user: Tree,
    encashment: Tree,

    // Serializes in-process writers; crash atomicity comes from the
    // multi-tree transactions, not from this lock.
    write_lock: Mutex<()>,
}

fn db_err(e: sled::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn enc<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn dec<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

// Error plumbing for the transactional closures.
type TxResult<T> = Result<T, ConflictableTransactionError<StorageError>>;

fn abort<T>(e: StorageError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e))
}

fn commit_err(e: TransactionError<StorageError>) -> StorageError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => db_err(e),
    }
}

fn enc_tx<T: serde::Serialize>(value: &T) -> TxResult<Vec<u8>> {
    enc(value).map_err(ConflictableTransactionError::Abort)
}

fn dec_tx<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    dec(bytes).map_err(ConflictableTransactionError::Abort)
}

fn wallet_key(user: UserId, wallet_type: WalletType) -> String {
    format!("{}:{}", user, wallet_type)
}

fn timestamp_key(at: DateTime<Utc>) -> u64 {
    at.timestamp().max(0) as u64
}

fn maturity_key(contract: &Contract) -> String {
    format!("{:020}:{}", timestamp_key(contract.matures_at), contract.id)
}

fn withdrawal_index_key(withdrawal: &Withdrawal) -> String {
    format!(
        "{}:{}:{:020}:{}",
        withdrawal.user,
        withdrawal.wallet_type,
        timestamp_key(withdrawal.requested_at),
        withdrawal.id
    )
}

fn tx_index_key(tx: &LedgerTransaction) -> String {
    format!("{}:{:020}:{}", tx.user, timestamp_key(tx.created_at), tx.id)
}

// =============================================================================
// WALLET ARITHMETIC
// =============================================================================
// Pure compute steps shared by the transactional closures; persistence is
// the caller's transaction.

fn credited(
    current: Option<Wallet>,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let mut wallet = current.unwrap_or_else(|| Wallet::new(user, wallet_type, now));
    wallet.balance = wallet.balance.checked_add(amount).ok_or(StorageError::Overflow)?;
    wallet.total_in = wallet
        .total_in
        .checked_add(amount)
        .ok_or(StorageError::Overflow)?;
    wallet.updated_at = now;
    Ok(wallet)
}

fn debited(
    current: Option<Wallet>,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let mut wallet = match current {
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
    Ok(wallet)
}

fn refunded(
    current: Option<Wallet>,
    user: UserId,
    wallet_type: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> StorageResult<Wallet> {
    let mut wallet = current.ok_or(StorageError::WalletNotFound { user, wallet_type })?;
    wallet.balance = wallet.balance.checked_add(amount).ok_or(StorageError::Overflow)?;
    wallet.total_out = wallet
        .total_out
        .checked_sub(amount)
        .ok_or(StorageError::Underflow)?;
    wallet.updated_at = now;
    Ok(wallet)
}

// =============================================================================
// TRANSACTIONAL HELPERS
// =============================================================================

fn wallet_in_tx(
    wallets: &TransactionalTree,
    user: UserId,
    wallet_type: WalletType,
) -> TxResult<Option<Wallet>> {
    match wallets.get(wallet_key(user, wallet_type).as_bytes())? {
        Some(bytes) => Ok(Some(dec_tx(&bytes)?)),
        None => Ok(None),
    }
}

/// Persist a wallet and mirror its balance onto the shadow document. Both
/// writes are staged in the surrounding transaction.
fn write_wallet_and_shadow(
    wallets: &TransactionalTree,
    shadows: &TransactionalTree,
    wallet: &Wallet,
    now: DateTime<Utc>,
) -> TxResult<()> {
    wallets.insert(
        wallet_key(wallet.user, wallet.wallet_type).as_bytes(),
        enc_tx(wallet)?,
    )?;

    let user_key = wallet.user.to_string();
    let mut shadow = match shadows.get(user_key.as_bytes())? {
        Some(bytes) => dec_tx::<UserBalances>(&bytes)?,
        None => UserBalances::new(wallet.user, now),
    };
    shadow.set(wallet.wallet_type, wallet.balance);
    shadow.updated_at = now;
    shadows.insert(user_key.as_bytes(), enc_tx(&shadow)?)?;
    Ok(())
}

fn record_tx_in_tx(
    transactions: &TransactionalTree,
    by_user: &TransactionalTree,
    tx: &LedgerTransaction,
) -> TxResult<bool> {
    if transactions.get(tx.reference.as_bytes())?.is_some() {
        return Ok(false);
    }
    transactions.insert(tx.reference.as_bytes(), enc_tx(tx)?)?;
    by_user.insert(tx_index_key(tx).as_bytes(), tx.reference.as_bytes())?;
    Ok(true)
}

fn write_withdrawal_in_tx(
    withdrawals: &TransactionalTree,
    by_user: &TransactionalTree,
    withdrawal: &Withdrawal,
) -> TxResult<()> {
    let id_key = withdrawal.id.to_string();
    withdrawals.insert(id_key.as_bytes(), enc_tx(withdrawal)?)?;
    by_user.insert(
        withdrawal_index_key(withdrawal).as_bytes(),
        id_key.as_bytes(),
    )?;
    Ok(())
}

impl SledStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path).map_err(db_err)?;
        Self::from_db(db)
    }

    /// Ephemeral store for tests.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(db_err)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let open = |name: &str| db.open_tree(name).map_err(db_err);
        Ok(Self {
            wallets: open(TREE_WALLETS)?,
            user_balances: open(TREE_USER_BALANCES)?,
            contracts: open(TREE_CONTRACTS)?,
            contracts_by_maturity: open(TREE_CONTRACTS_BY_MATURITY)?,
            transactions: open(TREE_TRANSACTIONS)?,
            transactions_by_user: open(TREE_TRANSACTIONS_BY_USER)?,
            withdrawals: open(TREE_WITHDRAWALS)?,
            withdrawals_by_user: open(TREE_WITHDRAWALS_BY_USER)?,
            encashment: open(TREE_ENCASHMENT)?,
            _db: db,
            write_lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> StorageResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Database("write lock poisoned".into()))
    }

    fn load_wallet(&self, user: UserId, wallet_type: WalletType) -> StorageResult<Option<Wallet>> {
        match self.wallets.get(wallet_key(user, wallet_type)).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load-compute-store one wallet and its shadow in one transaction.
    fn mutate_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        now: DateTime<Utc>,
        apply: impl Fn(Option<Wallet>) -> StorageResult<Wallet>,
    ) -> StorageResult<Wallet> {
        let trees: &[&Tree] = &[&self.wallets, &self.user_balances];
        trees
            .transaction(|trees| {
                let wallet = apply(wallet_in_tx(&trees[0], user, wallet_type)?)
                    .map_err(ConflictableTransactionError::Abort)?;
                write_wallet_and_shadow(&trees[0], &trees[1], &wallet, now)?;
                Ok(wallet)
            })
            .map_err(commit_err)
    }

    fn withdrawals_for_pair(
        &self,
        user: UserId,
        wallet_type: WalletType,
    ) -> StorageResult<Vec<Withdrawal>> {
        let prefix = format!("{}:{}:", user, wallet_type);
        let mut result = Vec::new();
        for item in self.withdrawals_by_user.scan_prefix(prefix.as_bytes()) {
            let (_, id_bytes) = item.map_err(db_err)?;
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            if let Some(bytes) = self.withdrawals.get(id.as_bytes()).map_err(db_err)? {
                result.push(dec(&bytes)?);
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish_non_exhaustive()
    }
}

impl LedgerStore for SledStore {
    fn ensure_wallets(&self, user: UserId, now: DateTime<Utc>) -> StorageResult<()> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.wallets, &self.user_balances];
        trees
            .transaction(|trees| {
                for wallet_type in WalletType::ALL {
                    if wallet_in_tx(&trees[0], user, wallet_type)?.is_none() {
                        write_wallet_and_shadow(
                            &trees[0],
                            &trees[1],
                            &Wallet::new(user, wallet_type, now),
                            now,
                        )?;
                    }
                }
                Ok(())
            })
            .map_err(commit_err)
    }

    fn wallet(&self, user: UserId, wallet_type: WalletType) -> StorageResult<Option<Wallet>> {
        self.load_wallet(user, wallet_type)
    }

    fn wallets(&self, user: UserId) -> StorageResult<Vec<Wallet>> {
        let mut wallets = Vec::new();
        for wallet_type in WalletType::ALL {
            if let Some(wallet) = self.load_wallet(user, wallet_type)? {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }

    fn user_balances(&self, user: UserId) -> StorageResult<Option<UserBalances>> {
        match self.user_balances.get(user.to_string()).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_user_balances(&self, balances: &UserBalances) -> StorageResult<()> {
        let _guard = self.guard()?;
        self.user_balances
            .insert(balances.user.to_string(), enc(balances)?)
            .map_err(db_err)?;
        Ok(())
    }

    fn users(&self) -> StorageResult<Vec<UserId>> {
        let mut users = Vec::new();
        for item in self.user_balances.iter() {
            let (key, _) = item.map_err(db_err)?;
            let text = String::from_utf8_lossy(&key);
            if let Ok(user) = text.parse::<UserId>() {
                users.push(user);
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
        let _guard = self.guard()?;
        let wallet = self.mutate_wallet(user, wallet_type, now, |current| {
            credited(current, user, wallet_type, amount, now)
        })?;
        debug!(user = %user, wallet = %wallet_type, amount, balance = wallet.balance, "wallet credited");
        Ok(wallet)
    }

    fn debit_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let _guard = self.guard()?;
        let wallet =
            self.mutate_wallet(user, wallet_type, now, |current| debited(current, amount, now))?;
        debug!(user = %user, wallet = %wallet_type, amount, balance = wallet.balance, "wallet debited");
        Ok(wallet)
    }

    fn refund_wallet(
        &self,
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let _guard = self.guard()?;
        let wallet = self.mutate_wallet(user, wallet_type, now, |current| {
            refunded(current, user, wallet_type, amount, now)
        })?;
        debug!(user = %user, wallet = %wallet_type, amount, balance = wallet.balance, "wallet refunded");
        Ok(wallet)
    }

    fn apply_earning(&self, tx: &LedgerTransaction, now: DateTime<Utc>) -> StorageResult<bool> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[
            &self.wallets,
            &self.user_balances,
            &self.transactions,
            &self.transactions_by_user,
        ];
        let applied = trees
            .transaction(|trees| {
                if trees[2].get(tx.reference.as_bytes())?.is_some() {
                    return Ok(false);
                }
                let wallet = credited(
                    wallet_in_tx(&trees[0], tx.user, tx.wallet_type)?,
                    tx.user,
                    tx.wallet_type,
                    tx.amount,
                    now,
                )
                .map_err(ConflictableTransactionError::Abort)?;
                write_wallet_and_shadow(&trees[0], &trees[1], &wallet, now)?;
                record_tx_in_tx(&trees[2], &trees[3], tx)?;
                Ok(true)
            })
            .map_err(commit_err)?;
        if applied {
            debug!(user = %tx.user, reference = %tx.reference, amount = tx.amount, "earning credited and recorded");
        }
        Ok(applied)
    }

    fn apply_transfer(
        &self,
        out_tx: &LedgerTransaction,
        in_tx: &LedgerTransaction,
        now: DateTime<Utc>,
    ) -> StorageResult<(Wallet, Wallet)> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[
            &self.wallets,
            &self.user_balances,
            &self.transactions,
            &self.transactions_by_user,
        ];
        let (source, destination) = trees
            .transaction(|trees| {
                let source = debited(
                    wallet_in_tx(&trees[0], out_tx.user, out_tx.wallet_type)?,
                    out_tx.amount,
                    now,
                )
                .map_err(ConflictableTransactionError::Abort)?;
                write_wallet_and_shadow(&trees[0], &trees[1], &source, now)?;

                let destination = credited(
                    wallet_in_tx(&trees[0], in_tx.user, in_tx.wallet_type)?,
                    in_tx.user,
                    in_tx.wallet_type,
                    in_tx.amount,
                    now,
                )
                .map_err(ConflictableTransactionError::Abort)?;
                write_wallet_and_shadow(&trees[0], &trees[1], &destination, now)?;

                record_tx_in_tx(&trees[2], &trees[3], out_tx)?;
                record_tx_in_tx(&trees[2], &trees[3], in_tx)?;
                Ok((source, destination))
            })
            .map_err(commit_err)?;
        debug!(
            user = %out_tx.user,
            from = %out_tx.wallet_type,
            to = %in_tx.wallet_type,
            amount = out_tx.amount,
            "transfer applied"
        );
        Ok((source, destination))
    }

    fn put_contract(&self, contract: &Contract) -> StorageResult<()> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.contracts, &self.contracts_by_maturity];
        trees
            .transaction(|trees| {
                trees[0].insert(contract.id.to_string().as_bytes(), enc_tx(contract)?)?;
                if contract.status == ContractStatus::Active {
                    trees[1].insert(
                        maturity_key(contract).as_bytes(),
                        contract.id.to_string().as_bytes(),
                    )?;
                } else {
                    trees[1].remove(maturity_key(contract).as_bytes())?;
                }
                Ok(())
            })
            .map_err(commit_err)
    }

    fn contract(&self, id: ContractId) -> StorageResult<Option<Contract>> {
        match self.contracts.get(id.to_string()).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contracts_for_user(&self, user: UserId) -> StorageResult<Vec<Contract>> {
        let mut contracts = Vec::new();
        for item in self.contracts.iter() {
            let (_, bytes) = item.map_err(db_err)?;
            let contract: Contract = dec(&bytes)?;
            if contract.user == user {
                contracts.push(contract);
            }
        }
        contracts.sort_by_key(|c| c.started_at);
        Ok(contracts)
    }

    fn due_contracts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Contract>> {
        let cutoff = timestamp_key(now);
        let mut due = Vec::new();
        for item in self.contracts_by_maturity.iter() {
            let (key, id_bytes) = item.map_err(db_err)?;
            let key_text = String::from_utf8_lossy(&key);
            let ts: u64 = key_text
                .split(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(u64::MAX);
            if ts > cutoff {
                break; // index is maturity-ordered
            }
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            if let Some(bytes) = self.contracts.get(id.as_bytes()).map_err(db_err)? {
                let contract: Contract = dec(&bytes)?;
                if contract.status == ContractStatus::Active && contract.matures_at <= now {
                    due.push(contract);
                }
            }
        }
        Ok(due)
    }

    fn complete_schedule_entry(
        &self,
        id: ContractId,
        index: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<EntryCompletion> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.contracts, &self.contracts_by_maturity];
        trees
            .transaction(|trees| {
                let mut contract: Contract = match trees[0].get(id.to_string().as_bytes())? {
                    Some(bytes) => dec_tx(&bytes)?,
                    None => return abort(StorageError::ContractNotFound(id)),
                };
                let entry = match contract.payout_schedule.get_mut(index) {
                    Some(entry) => entry,
                    None => return abort(StorageError::EntryOutOfRange { contract: id, index }),
                };

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

                trees[0].insert(contract.id.to_string().as_bytes(), enc_tx(&contract)?)?;
                if contract.status != ContractStatus::Active {
                    trees[1].remove(maturity_key(&contract).as_bytes())?;
                }
                Ok(EntryCompletion::Completed(contract))
            })
            .map_err(commit_err)
    }

    fn void_contract(&self, id: ContractId) -> StorageResult<bool> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.contracts, &self.contracts_by_maturity];
        trees
            .transaction(|trees| {
                let mut contract: Contract = match trees[0].get(id.to_string().as_bytes())? {
                    Some(bytes) => dec_tx(&bytes)?,
                    None => return abort(StorageError::ContractNotFound(id)),
                };
                if contract.status != ContractStatus::Active {
                    return Ok(false);
                }
                contract.status = ContractStatus::Voided;
                trees[0].insert(contract.id.to_string().as_bytes(), enc_tx(&contract)?)?;
                trees[1].remove(maturity_key(&contract).as_bytes())?;
                Ok(true)
            })
            .map_err(commit_err)
    }

    fn record_transaction(&self, tx: &LedgerTransaction) -> StorageResult<bool> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.transactions, &self.transactions_by_user];
        trees
            .transaction(|trees| record_tx_in_tx(&trees[0], &trees[1], tx))
            .map_err(commit_err)
    }

    fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> StorageResult<Option<LedgerTransaction>> {
        match self.transactions.get(reference.as_bytes()).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn transactions_for_user(&self, user: UserId) -> StorageResult<Vec<LedgerTransaction>> {
        let prefix = format!("{}:", user);
        let mut txs = Vec::new();
        for item in self.transactions_by_user.scan_prefix(prefix.as_bytes()) {
            let (_, ref_bytes) = item.map_err(db_err)?;
            if let Some(bytes) = self.transactions.get(&ref_bytes).map_err(db_err)? {
                txs.push(dec(&bytes)?);
            }
        }
        txs.sort_by_key(|t: &LedgerTransaction| t.created_at);
        Ok(txs)
    }

    fn submit_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        now: DateTime<Utc>,
    ) -> StorageResult<Wallet> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[
            &self.wallets,
            &self.user_balances,
            &self.withdrawals,
            &self.withdrawals_by_user,
        ];
        let wallet = trees
            .transaction(|trees| {
                let wallet = debited(
                    wallet_in_tx(&trees[0], withdrawal.user, withdrawal.wallet_type)?,
                    withdrawal.amount,
                    now,
                )
                .map_err(ConflictableTransactionError::Abort)?;
                write_wallet_and_shadow(&trees[0], &trees[1], &wallet, now)?;
                write_withdrawal_in_tx(&trees[2], &trees[3], withdrawal)?;
                Ok(wallet)
            })
            .map_err(commit_err)?;
        debug!(
            user = %withdrawal.user,
            withdrawal = %withdrawal.id,
            amount = withdrawal.amount,
            "withdrawal submitted with deduction"
        );
        Ok(wallet)
    }

    fn put_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<()> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[&self.withdrawals, &self.withdrawals_by_user];
        trees
            .transaction(|trees| write_withdrawal_in_tx(&trees[0], &trees[1], withdrawal))
            .map_err(commit_err)
    }

    fn withdrawal(&self, id: WithdrawalId) -> StorageResult<Option<Withdrawal>> {
        match self.withdrawals.get(id.to_string()).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn pending_withdrawal(
        &self,
        user: UserId,
        wallet_type: WalletType,
    ) -> StorageResult<Option<Withdrawal>> {
        Ok(self
            .withdrawals_for_pair(user, wallet_type)?
            .into_iter()
            .find(|w| w.status == WithdrawalStatus::Pending))
    }

    fn withdrawals_on_day(
        &self,
        user: UserId,
        wallet_type: WalletType,
        day: NaiveDate,
    ) -> StorageResult<Vec<Withdrawal>> {
        Ok(self
            .withdrawals_for_pair(user, wallet_type)?
            .into_iter()
            .filter(|w| w.requested_at.date_naive() == day)
            .collect())
    }

    fn transition_withdrawal(
        &self,
        id: WithdrawalId,
        verdict: WithdrawalVerdict,
        remarks: Option<String>,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> StorageResult<TransitionOutcome> {
        let _guard = self.guard()?;
        let trees: &[&Tree] = &[
            &self.wallets,
            &self.user_balances,
            &self.withdrawals,
            &self.withdrawals_by_user,
        ];
        let outcome = trees
            .transaction(|trees| {
                let current: Withdrawal = match trees[2].get(id.to_string().as_bytes())? {
                    Some(bytes) => dec_tx(&bytes)?,
                    None => return abort(StorageError::WithdrawalNotFound(id)),
                };
                if current.status != WithdrawalStatus::Pending {
                    return Ok(TransitionOutcome::NotPending(current.status));
                }

                if verdict.refunds() {
                    let wallet = refunded(
                        wallet_in_tx(&trees[0], current.user, current.wallet_type)?,
                        current.user,
                        current.wallet_type,
                        current.amount,
                        now,
                    )
                    .map_err(ConflictableTransactionError::Abort)?;
                    write_wallet_and_shadow(&trees[0], &trees[1], &wallet, now)?;
                }

                let mut updated = current;
                updated.status = verdict.status();
                updated.remarks = remarks.clone();
                updated.acted_by = actor;
                updated.acted_at = Some(now);
                if verdict == WithdrawalVerdict::Rejected {
                    updated.reject_reason = Some(RejectReason::AdminRejected);
                }
                write_withdrawal_in_tx(&trees[2], &trees[3], &updated)?;
                Ok(TransitionOutcome::Applied(updated))
            })
            .map_err(commit_err)?;
        if let TransitionOutcome::Applied(ref updated) = outcome {
            debug!(withdrawal = %updated.id, status = %updated.status, "withdrawal transitioned");
        }
        Ok(outcome)
    }

    fn encashment_settings(
        &self,
        wallet_type: WalletType,
    ) -> StorageResult<Option<EncashmentSettings>> {
        match self.encashment.get(wallet_type.as_str()).map_err(db_err)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_encashment_settings(&self, settings: &EncashmentSettings) -> StorageResult<()> {
        let _guard = self.guard()?;
        self.encashment
            .insert(settings.wallet_type.as_str(), enc(settings)?)
            .map_err(db_err)?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lib_types::{
        earning_reference, transfer_in_reference, transfer_out_reference, AccountDetails,
        PayoutMethod, TransactionType, TxId,
    };

    #[test]
    fn open_temporary_is_empty() {
        let store = SledStore::open_temporary().unwrap();
        assert!(store.users().unwrap().is_empty());
    }

    #[test]
    fn wallet_mutations_mirror_shadow() {
        let store = SledStore::open_temporary().unwrap();
        let user = UserId::new();
        let now = Utc::now();

        store.credit_wallet(user, WalletType::Credit, 80_000, now).unwrap();
        store.debit_wallet(user, WalletType::Credit, 30_000, now).unwrap();

        let wallet = store.wallet(user, WalletType::Credit).unwrap().unwrap();
        assert_eq!(wallet.balance, 50_000);
        assert_eq!(wallet.total_in, 80_000);
        assert_eq!(wallet.total_out, 30_000);
        assert!(wallet.totals_consistent());

        let shadow = store.user_balances(user).unwrap().unwrap();
        assert_eq!(shadow.credit, 50_000);
    }

    #[test]
    fn due_index_orders_and_filters() {
        let store = SledStore::open_temporary().unwrap();
        let now = Utc::now();
        let user = UserId::new();

        let early = Contract::new(user, 1_000, 40_000, 10, now - Duration::days(30)).unwrap();
        let late = Contract::new(user, 2_000, 40_000, 20, now - Duration::days(30)).unwrap();
        let future = Contract::new(user, 3_000, 40_000, 90, now).unwrap();
        store.put_contract(&late).unwrap();
        store.put_contract(&early).unwrap();
        store.put_contract(&future).unwrap();

        let due = store.due_contracts(now).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);
    }

    #[test]
    fn completed_contract_leaves_due_index() {
        let store = SledStore::open_temporary().unwrap();
        let now = Utc::now();
        let contract = Contract::new(UserId::new(), 1_000, 40_000, 0, now - Duration::days(1)).unwrap();
        store.put_contract(&contract).unwrap();
        assert_eq!(store.due_contracts(now).unwrap().len(), 1);

        store.complete_schedule_entry(contract.id, 0, now).unwrap();
        assert!(store.due_contracts(now).unwrap().is_empty());
    }

    #[test]
    fn apply_earning_survives_reopen_semantics() {
        let store = SledStore::open_temporary().unwrap();
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
        assert_eq!(
            store.wallet(user, WalletType::Passive).unwrap().unwrap().balance,
            200_000
        );
        // The duplicate attempt touched neither the wallet nor the shadow.
        assert_eq!(store.user_balances(user).unwrap().unwrap().passive, 200_000);
        assert!(store
            .transaction_by_reference(&tx.reference)
            .unwrap()
            .is_some());
    }

    #[test]
    fn failed_submission_leaves_no_partial_state() {
        let store = SledStore::open_temporary().unwrap();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 1_000, now).unwrap();

        let withdrawal = Withdrawal::pending(
            user,
            WalletType::Passive,
            5_000,
            PayoutMethod::Gcash,
            AccountDetails::new("Test", "0917"),
            now,
        );
        let err = store.submit_withdrawal(&withdrawal, now).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientBalance { .. }));

        // The aborted transaction staged nothing: no withdrawal document, no
        // index entry, wallet and shadow untouched.
        assert!(store.withdrawal(withdrawal.id).unwrap().is_none());
        assert!(store
            .withdrawals_on_day(user, WalletType::Passive, now.date_naive())
            .unwrap()
            .is_empty());
        assert_eq!(
            store.wallet(user, WalletType::Passive).unwrap().unwrap().balance,
            1_000
        );
        assert_eq!(store.user_balances(user).unwrap().unwrap().passive, 1_000);
    }

    fn transfer_pair(
        user: UserId,
        from: WalletType,
        to: WalletType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> (LedgerTransaction, LedgerTransaction) {
        let pair = TxId::new();
        let out_tx = LedgerTransaction::completed(
            user,
            TransactionType::Withdrawal,
            from,
            amount,
            transfer_out_reference(&pair),
            "transfer out".into(),
            now,
        );
        let in_tx = LedgerTransaction::completed(
            user,
            TransactionType::Deposit,
            to,
            amount,
            transfer_in_reference(&pair),
            "transfer in".into(),
            now,
        );
        (out_tx, in_tx)
    }

    #[test]
    fn transfer_commits_both_legs_or_neither() {
        let store = SledStore::open_temporary().unwrap();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Credit, 10_000, now).unwrap();

        let (out_tx, in_tx) =
            transfer_pair(user, WalletType::Credit, WalletType::Bonus, 4_000, now);
        let (source, destination) = store.apply_transfer(&out_tx, &in_tx, now).unwrap();
        assert_eq!(source.balance, 6_000);
        assert_eq!(destination.balance, 4_000);
        assert!(store.transaction_by_reference(&out_tx.reference).unwrap().is_some());
        assert!(store.transaction_by_reference(&in_tx.reference).unwrap().is_some());

        // Shadow reflects both legs.
        let shadow = store.user_balances(user).unwrap().unwrap();
        assert_eq!(shadow.credit, 6_000);
        assert_eq!(shadow.bonus, 4_000);

        // An unfunded transfer aborts whole: no balances move, no records.
        let (out_tx, in_tx) =
            transfer_pair(user, WalletType::Credit, WalletType::Bonus, 50_000, now);
        let err = store.apply_transfer(&out_tx, &in_tx, now).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientBalance { .. }));
        assert_eq!(
            store.wallet(user, WalletType::Credit).unwrap().unwrap().balance,
            6_000
        );
        assert_eq!(
            store.wallet(user, WalletType::Bonus).unwrap().unwrap().balance,
            4_000
        );
        assert!(store.transaction_by_reference(&out_tx.reference).unwrap().is_none());
        assert!(store.transaction_by_reference(&in_tx.reference).unwrap().is_none());
    }

    #[test]
    fn withdrawal_lifecycle_round_trip() {
        let store = SledStore::open_temporary().unwrap();
        let user = UserId::new();
        let now = Utc::now();
        store.credit_wallet(user, WalletType::Passive, 10_000, now).unwrap();

        let withdrawal = Withdrawal::pending(
            user,
            WalletType::Passive,
            3_000,
            PayoutMethod::BankTransfer,
            AccountDetails::new("Test", "001122"),
            now,
        );
        store.submit_withdrawal(&withdrawal, now).unwrap();
        assert!(store
            .pending_withdrawal(user, WalletType::Passive)
            .unwrap()
            .is_some());

        let day = now.date_naive();
        assert_eq!(
            store
                .withdrawals_on_day(user, WalletType::Passive, day)
                .unwrap()
                .len(),
            1
        );

        match store
            .transition_withdrawal(withdrawal.id, WithdrawalVerdict::Cancelled, None, Some(user), now)
            .unwrap()
        {
            TransitionOutcome::Applied(updated) => {
                assert_eq!(updated.status, WithdrawalStatus::Cancelled)
            }
            TransitionOutcome::NotPending(_) => panic!("first transition must apply"),
        }
        assert!(store
            .pending_withdrawal(user, WalletType::Passive)
            .unwrap()
            .is_none());
        assert_eq!(
            store.wallet(user, WalletType::Passive).unwrap().unwrap().balance,
            10_000
        );
    }

    #[test]
    fn encashment_settings_round_trip() {
        let store = SledStore::open_temporary().unwrap();
        let settings = EncashmentSettings::new(
            WalletType::Bonus,
            true,
            chrono::NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            vec![chrono::Weekday::Mon, chrono::Weekday::Fri],
        );
        store.put_encashment_settings(&settings).unwrap();
        let loaded = store.encashment_settings(WalletType::Bonus).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }
}
