//! Encashment window configuration.
//!
//! One settings record per wallet type governs when withdrawals from that
//! wallet are permitted: an enable flag, a [start, end) time-of-day window,
//! a set of allowed weekdays, and an optional temporary override that
//! supersedes the schedule until it expires. Evaluation lives in
//! `lib-encash`; this is configuration data only.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::wallet::WalletType;

/// Reason code attached to an encashment verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncashmentReason {
    Disabled,
    DayNotAllowed,
    TimeNotAllowed,
    Override,
    Allowed,
}

impl EncashmentReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            EncashmentReason::Disabled => "disabled",
            EncashmentReason::DayNotAllowed => "day_not_allowed",
            EncashmentReason::TimeNotAllowed => "time_not_allowed",
            EncashmentReason::Override => "override",
            EncashmentReason::Allowed => "allowed",
        }
    }
}

/// Temporary administrator exception to the configured window.
///
/// Present means active; the evaluator treats an expired override as absent
/// and the first caller to observe the expiry clears it from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncashmentOverride {
    pub expires_at: DateTime<Utc>,
}

/// Per-wallet-type encashment window configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncashmentSettings {
    pub wallet_type: WalletType,
    pub enabled: bool,
    /// Inclusive start of the daily window.
    pub start_time: NaiveTime,
    /// Exclusive end of the daily window.
    pub end_time: NaiveTime,
    pub allowed_days: Vec<Weekday>,
    pub override_window: Option<EncashmentOverride>,
}

impl EncashmentSettings {
    pub fn new(
        wallet_type: WalletType,
        enabled: bool,
        start_time: NaiveTime,
        end_time: NaiveTime,
        allowed_days: Vec<Weekday>,
    ) -> Self {
        Self {
            wallet_type,
            enabled,
            start_time,
            end_time,
            allowed_days,
            override_window: None,
        }
    }

    pub fn day_allowed(&self, day: Weekday) -> bool {
        self.allowed_days.contains(&day)
    }
}
