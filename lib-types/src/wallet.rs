//! Wallet records and the per-user shadow balance document.
//!
//! # Invariants
//!
//! 1. **Shadow equality** - After every completed operation, each field of
//!    [`UserBalances`] equals the `balance` of the matching [`Wallet`]
//!    document. The store backends uphold this by writing both sides in one
//!    atomic step; the reconciler repairs any observed drift, treating the
//!    wallet document as authoritative.
//!
//! 2. **Running totals** - `balance == total_in - total_out` at every
//!    checkpoint. A withdrawal refund decrements `total_out` (the deduction
//!    it reverses incremented it), so the identity holds across the
//!    deduct/refund cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::primitives::{Amount, UserId};
use crate::UnknownVariant;

/// Named balance bucket a user owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    /// Deposited funds; the source of contract activations.
    Credit,
    /// Earnings from matured contracts.
    Passive,
    /// Promotional / referral credits.
    Bonus,
}

impl WalletType {
    pub const ALL: [WalletType; 3] = [WalletType::Credit, WalletType::Passive, WalletType::Bonus];

    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::Credit => "credit",
            WalletType::Passive => "passive",
            WalletType::Bonus => "bonus",
        }
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(WalletType::Credit),
            "passive" => Ok(WalletType::Passive),
            "bonus" => Ok(WalletType::Bonus),
            other => Err(UnknownVariant::new("wallet type", other)),
        }
    }
}

/// One balance bucket for one user.
///
/// Created lazily on first access. Mutated only through the payout
/// processor, deposit approval, the withdrawal lifecycle, inter-wallet
/// transfer, or a reconciler repair. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user: UserId,
    pub wallet_type: WalletType,
    pub balance: Amount,
    pub total_in: Amount,
    pub total_out: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user: UserId, wallet_type: WalletType, now: DateTime<Utc>) -> Self {
        Self {
            user,
            wallet_type,
            balance: 0,
            total_in: 0,
            total_out: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Running-totals identity check.
    pub fn totals_consistent(&self) -> bool {
        self.total_in.checked_sub(self.total_out) == Some(self.balance)
    }
}

/// Denormalized per-user copy of the three wallet balances.
///
/// This is the "user profile" view of the ledger. It is written in the same
/// atomic store operation as the wallet it mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalances {
    pub user: UserId,
    pub credit: Amount,
    pub passive: Amount,
    pub bonus: Amount,
    pub updated_at: DateTime<Utc>,
}

impl UserBalances {
    pub fn new(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            credit: 0,
            passive: 0,
            bonus: 0,
            updated_at: now,
        }
    }

    pub fn get(&self, wallet_type: WalletType) -> Amount {
        match wallet_type {
            WalletType::Credit => self.credit,
            WalletType::Passive => self.passive,
            WalletType::Bonus => self.bonus,
        }
    }

    pub fn set(&mut self, wallet_type: WalletType, amount: Amount) {
        match wallet_type {
            WalletType::Credit => self.credit = amount,
            WalletType::Passive => self.passive = amount,
            WalletType::Bonus => self.bonus = amount,
        }
    }
}
