//! Append-only ledger transaction records.
//!
//! Every balance mutation produces exactly one matching transaction, keyed
//! by a unique derived `reference` string so duplicate insertion attempts
//! (processor retries, concurrent runs) are detected and suppressed at the
//! store. The one deliberate exception is the withdrawal deduct/refund
//! cycle, which records a transaction only on completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::primitives::{Amount, ContractId, TxId, UserId, WithdrawalId};
use crate::wallet::WalletType;
use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Approved deposit credited to the credit wallet.
    Deposit,
    /// Principal deducted when a contract is activated.
    Activation,
    /// Matured contract payout credited to the passive wallet.
    Earning,
    /// Completed withdrawal paid out of a wallet.
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Activation => "activation",
            TransactionType::Earning => "earning",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "activation" => Ok(TransactionType::Activation),
            "earning" => Ok(TransactionType::Earning),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            other => Err(UnknownVariant::new("transaction type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// One audit record in the append-only transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TxId,
    pub user: UserId,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Amount,
    pub wallet_type: WalletType,
    pub description: String,
    /// Unique derived key; the store refuses a second insert with the same
    /// reference.
    pub reference: String,
    /// Pairing link for the two legs of an inter-wallet transfer.
    pub related: Option<TxId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn completed(
        user: UserId,
        tx_type: TransactionType,
        wallet_type: WalletType,
        amount: Amount,
        reference: String,
        description: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TxId::new(),
            user,
            tx_type,
            status: TransactionStatus::Completed,
            amount,
            wallet_type,
            description,
            reference,
            related: None,
            created_at: now,
        }
    }
}

// ============================================================================
// DERIVED REFERENCES
// ============================================================================
// Reference formats are storage keys. Changing them breaks duplicate
// detection against existing data.
// ============================================================================

pub fn earning_reference(contract: &ContractId, index: usize) -> String {
    format!("earning:{}:{}", contract, index)
}

pub fn activation_reference(contract: &ContractId) -> String {
    format!("activation:{}", contract)
}

pub fn withdrawal_reference(withdrawal: &WithdrawalId) -> String {
    format!("withdrawal:{}", withdrawal)
}

pub fn deposit_reference(tx: &TxId) -> String {
    format!("deposit:{}", tx)
}

pub fn transfer_out_reference(tx: &TxId) -> String {
    format!("transfer:{}:out", tx)
}

pub fn transfer_in_reference(tx: &TxId) -> String {
    format!("transfer:{}:in", tx)
}
