//! Investment contract records and the embedded payout schedule.
//!
//! # Invariants
//!
//! 1. `remaining_payouts + total_payouts == payout_schedule.len()` at all
//!    times; the counters are denormalized for progress queries and are only
//!    mutated together with the schedule entry they count.
//!
//! 2. A contract whose `remaining_payouts` reaches 0 becomes `Completed`.
//!    Terminal statuses (Completed, Cancelled, Voided) are final; a contract
//!    never reopens and is never deleted.
//!
//! 3. The schedule is generated exactly once, at creation, in the same write
//!    that persists the contract. Entry amounts are recomputed from the
//!    stored principal and multiplier when paid; the cached `amount` field is
//!    display data, never the credited figure.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::primitives::{Amount, Bps, ContractId, UserId, BPS_DENOMINATOR};
use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Completed,
    Cancelled,
    Voided,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Completed => "completed",
            ContractStatus::Cancelled => "cancelled",
            ContractStatus::Voided => "voided",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContractStatus::Active)
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ContractStatus::Active),
            "completed" => Ok(ContractStatus::Completed),
            "cancelled" => Ok(ContractStatus::Cancelled),
            "voided" => Ok(ContractStatus::Voided),
            other => Err(UnknownVariant::new("contract status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
}

/// One scheduled payout within a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub due_at: DateTime<Utc>,
    pub amount: Amount,
    pub status: EntryStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn pending(due_at: DateTime<Utc>, amount: Amount) -> Self {
        Self {
            due_at,
            amount,
            status: EntryStatus::Pending,
            completed_at: None,
        }
    }
}

/// Compute the payout owed for a principal at a basis-point multiplier.
///
/// Returns `None` on overflow of the `Amount` range.
pub fn payout_amount(principal: Amount, multiplier_bps: Bps) -> Option<Amount> {
    let product = (principal as u128).checked_mul(multiplier_bps as u128)?;
    Amount::try_from(product / BPS_DENOMINATOR).ok()
}

/// A fixed-term investment contract maturing into scheduled payouts.
///
/// The current product generates exactly one schedule entry (the full payout
/// at maturity); the record supports multiple entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub user: UserId,
    pub principal: Amount,
    pub multiplier_bps: Bps,
    pub started_at: DateTime<Utc>,
    pub matures_at: DateTime<Utc>,
    pub status: ContractStatus,
    pub payout_schedule: Vec<ScheduleEntry>,
    pub total_payouts: u32,
    pub remaining_payouts: u32,
}

impl Contract {
    /// Create an active contract with its single-entry payout schedule.
    ///
    /// Deterministic: same inputs always produce the same schedule. Returns
    /// `None` if the payout amount overflows.
    pub fn new(
        user: UserId,
        principal: Amount,
        multiplier_bps: Bps,
        term_days: i64,
        started_at: DateTime<Utc>,
    ) -> Option<Self> {
        let matures_at = started_at + Duration::days(term_days);
        let amount = payout_amount(principal, multiplier_bps)?;
        let payout_schedule = vec![ScheduleEntry::pending(matures_at, amount)];
        let remaining = payout_schedule.len() as u32;

        Some(Self {
            id: ContractId::new(),
            user,
            principal,
            multiplier_bps,
            started_at,
            matures_at,
            status: ContractStatus::Active,
            payout_schedule,
            total_payouts: 0,
            remaining_payouts: remaining,
        })
    }

    /// Check the denormalized-counter and completion invariants.
    pub fn counters_consistent(&self) -> bool {
        let len = self.payout_schedule.len() as u32;
        if self.remaining_payouts + self.total_payouts != len {
            return false;
        }
        let completed = self
            .payout_schedule
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .count() as u32;
        if completed != self.total_payouts {
            return false;
        }
        // Completed status and a drained schedule imply each other; voided
        // and cancelled contracts may carry unpaid entries.
        if self.remaining_payouts == 0 && self.status == ContractStatus::Active {
            return false;
        }
        if self.status == ContractStatus::Completed && self.remaining_payouts != 0 {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_single_entry_at_maturity() {
        let start = Utc::now();
        let contract = Contract::new(UserId::new(), 50_000, 40_000, 60, start).unwrap();

        assert_eq!(contract.matures_at, start + Duration::days(60));
        assert_eq!(contract.payout_schedule.len(), 1);
        assert_eq!(contract.payout_schedule[0].amount, 200_000);
        assert_eq!(contract.payout_schedule[0].due_at, contract.matures_at);
        assert_eq!(contract.remaining_payouts, 1);
        assert_eq!(contract.total_payouts, 0);
        assert!(contract.counters_consistent());
    }

    #[test]
    fn payout_amount_uses_bps() {
        assert_eq!(payout_amount(50_000, 40_000), Some(200_000));
        assert_eq!(payout_amount(10_000, 10_000), Some(10_000));
        assert_eq!(payout_amount(333, 15_000), Some(499)); // truncates
        assert_eq!(payout_amount(u64::MAX, u32::MAX), None);
    }

    #[test]
    fn counters_flag_drift() {
        let mut contract = Contract::new(UserId::new(), 1_000, 20_000, 30, Utc::now()).unwrap();
        contract.total_payouts = 1; // counter bumped without marking the entry
        assert!(!contract.counters_consistent());
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!("active".parse::<ContractStatus>().unwrap(), ContractStatus::Active);
        assert!("open".parse::<ContractStatus>().is_err());
    }
}
