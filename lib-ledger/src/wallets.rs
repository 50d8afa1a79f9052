//! Wallet mutation paths outside the payout and withdrawal engines.
//!
//! Every mutation here produces exactly one transaction per wallet touched,
//! with a unique derived reference; a transfer produces one per leg, the two
//! cross-linked through `related`.

use chrono::{DateTime, Utc};
use tracing::info;

use lib_store::LedgerStore;
use lib_types::{
    deposit_reference, transfer_in_reference, transfer_out_reference, Amount, LedgerTransaction,
    TransactionType, TxId, UserId, WalletType,
};

use crate::{LedgerError, LedgerResult};

/// The three wallet balances exposed to callers (`getBalances`).
///
/// Read from the wallet documents, the authoritative side of the dual
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balances {
    pub credit: Amount,
    pub passive: Amount,
    pub bonus: Amount,
}

pub fn balances(store: &dyn LedgerStore, user: UserId) -> LedgerResult<Balances> {
    let mut result = Balances::default();
    for wallet in store.wallets(user)? {
        match wallet.wallet_type {
            WalletType::Credit => result.credit = wallet.balance,
            WalletType::Passive => result.passive = wallet.balance,
            WalletType::Bonus => result.bonus = wallet.balance,
        }
    }
    Ok(result)
}

/// Credit an approved deposit to the user's credit wallet.
pub fn approve_deposit(
    store: &dyn LedgerStore,
    user: UserId,
    amount: Amount,
    description: String,
    now: DateTime<Utc>,
) -> LedgerResult<LedgerTransaction> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let id = TxId::new();
    store.credit_wallet(user, WalletType::Credit, amount, now)?;
    let mut tx = LedgerTransaction::completed(
        user,
        TransactionType::Deposit,
        WalletType::Credit,
        amount,
        deposit_reference(&id),
        description,
        now,
    );
    tx.id = id;
    store.record_transaction(&tx)?;

    info!(user = %user, amount, "deposit approved and credited");
    Ok(tx)
}

/// Move funds between two wallets of the same user.
///
/// Records a withdrawal-typed leg on the source and a deposit-typed leg on
/// the destination, linked through `related`.
pub fn transfer(
    store: &dyn LedgerStore,
    user: UserId,
    from: WalletType,
    to: WalletType,
    amount: Amount,
    now: DateTime<Utc>,
) -> LedgerResult<(LedgerTransaction, LedgerTransaction)> {
    if from == to {
        return Err(LedgerError::SameWallet);
    }
    if amount == 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let pair = TxId::new();
    let mut out_tx = LedgerTransaction::completed(
        user,
        TransactionType::Withdrawal,
        from,
        amount,
        transfer_out_reference(&pair),
        format!("Transfer to {} wallet", to),
        now,
    );
    let mut in_tx = LedgerTransaction::completed(
        user,
        TransactionType::Deposit,
        to,
        amount,
        transfer_in_reference(&pair),
        format!("Transfer from {} wallet", from),
        now,
    );
    out_tx.related = Some(in_tx.id);
    in_tx.related = Some(out_tx.id);

    // Both legs and both records commit together.
    store.apply_transfer(&out_tx, &in_tx, now)?;

    info!(user = %user, %from, %to, amount, "inter-wallet transfer applied");
    Ok((out_tx, in_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_store::{MemoryStore, StorageError};

    #[test]
    fn deposit_credits_and_records() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let now = Utc::now();

        let tx = approve_deposit(&store, user, 25_000, "GCash deposit".into(), now).unwrap();
        assert_eq!(tx.tx_type, TransactionType::Deposit);
        assert_eq!(tx.amount, 25_000);

        let balances = balances(&store, user).unwrap();
        assert_eq!(balances.credit, 25_000);
        assert!(store
            .transaction_by_reference(&tx.reference)
            .unwrap()
            .is_some());
    }

    #[test]
    fn zero_deposit_is_a_validation_error() {
        let store = MemoryStore::new();
        let err = approve_deposit(&store, UserId::new(), 0, "".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount));
    }

    #[test]
    fn transfer_moves_and_links_both_legs() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let now = Utc::now();
        approve_deposit(&store, user, 10_000, "seed".into(), now).unwrap();

        let (out_tx, in_tx) = transfer(
            &store,
            user,
            WalletType::Credit,
            WalletType::Bonus,
            4_000,
            now,
        )
        .unwrap();

        assert_eq!(out_tx.related, Some(in_tx.id));
        assert_eq!(in_tx.related, Some(out_tx.id));
        assert_eq!(out_tx.wallet_type, WalletType::Credit);
        assert_eq!(in_tx.wallet_type, WalletType::Bonus);

        let balances = balances(&store, user).unwrap();
        assert_eq!(balances.credit, 6_000);
        assert_eq!(balances.bonus, 4_000);
    }

    #[test]
    fn transfer_insufficient_funds_leaves_no_partial_state() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let now = Utc::now();
        approve_deposit(&store, user, 1_000, "seed".into(), now).unwrap();

        let err = transfer(
            &store,
            user,
            WalletType::Credit,
            WalletType::Passive,
            5_000,
            now,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Storage(StorageError::InsufficientBalance { .. })
        ));

        let balances = balances(&store, user).unwrap();
        assert_eq!(balances.credit, 1_000);
        assert_eq!(balances.passive, 0);
        // Only the seed deposit is on the log.
        assert_eq!(store.transactions_for_user(user).unwrap().len(), 1);
    }

    #[test]
    fn transfer_to_same_wallet_is_refused() {
        let store = MemoryStore::new();
        let err = transfer(
            &store,
            UserId::new(),
            WalletType::Credit,
            WalletType::Credit,
            100,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::SameWallet));
    }
}
