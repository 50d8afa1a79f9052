//! Encashment window evaluation.
//!
//! An unexpired override always allows. Otherwise the wallet type must be
//! enabled, the weekday allowed, and the time of day inside
//! [start_time, end_time). The first caller to observe an expired override
//! clears it from the store; evaluation itself is pure.

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use lib_store::LedgerStore;
use lib_types::{EncashmentReason, EncashmentSettings, WalletType};

use crate::EncashResult;

/// Pure verdict for a settings record at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub allowed: bool,
    pub reason: EncashmentReason,
    /// The override has lapsed and should be cleared by the caller.
    pub override_expired: bool,
}

pub fn evaluate(settings: &EncashmentSettings, now: DateTime<Utc>) -> Evaluation {
    let mut override_expired = false;
    if let Some(ov) = settings.override_window {
        if now < ov.expires_at {
            return Evaluation {
                allowed: true,
                reason: EncashmentReason::Override,
                override_expired: false,
            };
        }
        override_expired = true;
    }

    let reason = if !settings.enabled {
        EncashmentReason::Disabled
    } else if !settings.day_allowed(now.weekday()) {
        EncashmentReason::DayNotAllowed
    } else {
        let time = now.time();
        if time >= settings.start_time && time < settings.end_time {
            EncashmentReason::Allowed
        } else {
            EncashmentReason::TimeNotAllowed
        }
    };

    Evaluation {
        allowed: reason == EncashmentReason::Allowed,
        reason,
        override_expired,
    }
}

/// Verdict plus a user-facing message, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncashmentStatus {
    pub is_allowed: bool,
    pub reason: EncashmentReason,
    pub message: String,
}

/// Evaluate the stored settings for a wallet type, lazily clearing an
/// expired override. Missing settings mean encashment is disabled.
pub fn encashment_status(
    store: &dyn LedgerStore,
    wallet_type: WalletType,
    now: DateTime<Utc>,
) -> EncashResult<EncashmentStatus> {
    let settings = match store.encashment_settings(wallet_type)? {
        Some(settings) => settings,
        None => {
            return Ok(EncashmentStatus {
                is_allowed: false,
                reason: EncashmentReason::Disabled,
                message: format!("Encashment is not configured for the {} wallet", wallet_type),
            });
        }
    };

    let evaluation = evaluate(&settings, now);
    if evaluation.override_expired {
        let mut cleared = settings.clone();
        cleared.override_window = None;
        store.put_encashment_settings(&cleared)?;
        debug!(wallet = %wallet_type, "expired encashment override cleared");
    }

    Ok(EncashmentStatus {
        is_allowed: evaluation.allowed,
        reason: evaluation.reason,
        message: message_for(evaluation.reason, &settings),
    })
}

fn message_for(reason: EncashmentReason, settings: &EncashmentSettings) -> String {
    match reason {
        EncashmentReason::Allowed => "Encashment is open".to_string(),
        EncashmentReason::Override => "Encashment is temporarily open by administrator override".to_string(),
        EncashmentReason::Disabled => format!(
            "Encashment is disabled for the {} wallet",
            settings.wallet_type
        ),
        EncashmentReason::DayNotAllowed => {
            "Encashment is not available today".to_string()
        }
        EncashmentReason::TimeNotAllowed => format!(
            "Encashment is open from {} to {}",
            settings.start_time.format("%H:%M"),
            settings.end_time.format("%H:%M")
        ),
    }
}
