//! Withdrawal requests and their terminal lifecycle.
//!
//! A withdrawal deducts its amount from the wallet at submission time, not
//! at approval. Completed requests need no further balance change; cancelled
//! and rejected requests refund the deduction exactly once. Business-rule
//! rejections at submission persist a `Rejected` record with a reason code
//! for the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::encashment::EncashmentReason;
use crate::primitives::{Amount, UserId, WithdrawalId};
use crate::wallet::WalletType;
use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Cancelled,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Completed => "COMPLETED",
            WithdrawalStatus::Cancelled => "CANCELLED",
            WithdrawalStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WithdrawalStatus::Pending),
            "COMPLETED" => Ok(WithdrawalStatus::Completed),
            "CANCELLED" => Ok(WithdrawalStatus::Cancelled),
            "REJECTED" => Ok(WithdrawalStatus::Rejected),
            other => Err(UnknownVariant::new("withdrawal status", other)),
        }
    }
}

/// Recognized payout channels for encashment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Gcash,
    Maya,
    BankTransfer,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::Gcash => "gcash",
            PayoutMethod::Maya => "maya",
            PayoutMethod::BankTransfer => "bank_transfer",
        }
    }
}

impl fmt::Display for PayoutMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gcash" => Ok(PayoutMethod::Gcash),
            "maya" => Ok(PayoutMethod::Maya),
            "bank_transfer" => Ok(PayoutMethod::BankTransfer),
            other => Err(UnknownVariant::new("payout method", other)),
        }
    }
}

/// Destination account for a payout method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub account_name: String,
    pub account_number: String,
}

impl AccountDetails {
    pub fn new(account_name: impl Into<String>, account_number: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            account_number: account_number.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.account_name.trim().is_empty() && !self.account_number.trim().is_empty()
    }
}

/// Machine-readable cause recorded on a rejected withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    WindowClosed { window: EncashmentReason },
    BelowMinimum { minimum: Amount },
    InsufficientBalance { balance: Amount },
    PendingExists,
    DailyLimitReached,
    /// Set by an administrator rejecting a pending request.
    AdminRejected,
}

impl RejectReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            RejectReason::WindowClosed { .. } => "window_closed",
            RejectReason::BelowMinimum { .. } => "below_minimum",
            RejectReason::InsufficientBalance { .. } => "insufficient_balance",
            RejectReason::PendingExists => "pending_exists",
            RejectReason::DailyLimitReached => "daily_limit",
            RejectReason::AdminRejected => "admin_rejected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::WindowClosed { window } => {
                write!(f, "window_closed ({})", window.as_code())
            }
            RejectReason::BelowMinimum { minimum } => write!(f, "below_minimum (min {})", minimum),
            RejectReason::InsufficientBalance { balance } => {
                write!(f, "insufficient_balance (have {})", balance)
            }
            other => f.write_str(other.as_code()),
        }
    }
}

/// One withdrawal request, terminal once it leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user: UserId,
    pub wallet_type: WalletType,
    pub amount: Amount,
    pub method: PayoutMethod,
    pub account: AccountDetails,
    pub status: WithdrawalStatus,
    pub reject_reason: Option<RejectReason>,
    pub remarks: Option<String>,
    /// Administrator (or requesting user, for cancellations) who closed the
    /// request.
    pub acted_by: Option<UserId>,
    pub acted_at: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
}

impl Withdrawal {
    /// A validated request entering the lifecycle; the wallet deduction
    /// happens in the same store operation that persists this record.
    pub fn pending(
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        method: PayoutMethod,
        account: AccountDetails,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WithdrawalId::new(),
            user,
            wallet_type,
            amount,
            method,
            account,
            status: WithdrawalStatus::Pending,
            reject_reason: None,
            remarks: None,
            acted_by: None,
            acted_at: None,
            requested_at: now,
        }
    }

    /// An audit record for a submission refused by a business rule. No
    /// balance was deducted; nothing will be refunded.
    pub fn rejected(
        user: UserId,
        wallet_type: WalletType,
        amount: Amount,
        method: PayoutMethod,
        account: AccountDetails,
        reason: RejectReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WithdrawalId::new(),
            user,
            wallet_type,
            amount,
            method,
            account,
            status: WithdrawalStatus::Rejected,
            reject_reason: Some(reason),
            remarks: None,
            acted_by: None,
            acted_at: Some(now),
            requested_at: now,
        }
    }
}
