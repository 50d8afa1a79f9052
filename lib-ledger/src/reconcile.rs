//! Shadow-balance reconciliation.
//!
//! Every mutation path writes the wallet document and the user's shadow
//! balance in one atomic store operation, so the two representations agree
//! by construction. This module is the on-demand diagnostic for the times
//! they do not (operator edits, partial restores, bugs): it compares both
//! sides per user, reports drift, and repairs the shadow from the wallet.
//! The wallet document is authoritative because it carries the
//! total_in/total_out audit trail.
//!
//! Not on the hot path of any request.

use chrono::{DateTime, Utc};
use tracing::warn;

use lib_store::LedgerStore;
use lib_types::{Amount, UserBalances, UserId, WalletType};

use crate::LedgerResult;

/// One wallet whose shadow copy disagreed with the wallet document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDrift {
    pub wallet_type: WalletType,
    /// Authoritative value.
    pub wallet_balance: Amount,
    /// Value found on the shadow document.
    pub shadow_balance: Amount,
}

/// Reconciliation result for one user.
#[derive(Debug, Clone)]
pub struct UserReport {
    pub user: UserId,
    pub drifts: Vec<WalletDrift>,
    /// Wallets whose balance != total_in - total_out. Reported, never
    /// auto-repaired: the totals are the audit trail.
    pub totals_anomalies: Vec<WalletType>,
    pub repaired: bool,
}

impl UserReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty() && self.totals_anomalies.is_empty()
    }
}

/// Compare the shadow document against the wallet documents for one user,
/// repairing the shadow when `repair` is set and drift was found.
pub fn reconcile_user(
    store: &dyn LedgerStore,
    user: UserId,
    repair: bool,
    now: DateTime<Utc>,
) -> LedgerResult<UserReport> {
    let wallets = store.wallets(user)?;
    let shadow = store.user_balances(user)?;

    let mut drifts = Vec::new();
    let mut totals_anomalies = Vec::new();
    let mut repaired_shadow = UserBalances::new(user, now);

    for wallet_type in WalletType::ALL {
        let wallet = wallets.iter().find(|w| w.wallet_type == wallet_type);
        let wallet_balance = wallet.map(|w| w.balance).unwrap_or(0);
        let shadow_balance = shadow.as_ref().map(|s| s.get(wallet_type)).unwrap_or(0);

        repaired_shadow.set(wallet_type, wallet_balance);

        if wallet_balance != shadow_balance {
            drifts.push(WalletDrift {
                wallet_type,
                wallet_balance,
                shadow_balance,
            });
        }
        if let Some(wallet) = wallet {
            if !wallet.totals_consistent() {
                totals_anomalies.push(wallet_type);
            }
        }
    }

    let mut repaired = false;
    if !drifts.is_empty() {
        warn!(
            user = %user,
            drifts = drifts.len(),
            "shadow balance drift detected"
        );
        if repair {
            store.put_user_balances(&repaired_shadow)?;
            repaired = true;
            warn!(user = %user, "shadow balances repaired from wallet documents");
        }
    }

    Ok(UserReport {
        user,
        drifts,
        totals_anomalies,
        repaired,
    })
}

/// Run the per-user check across every known user; returns only the reports
/// that found something.
pub fn reconcile_all(
    store: &dyn LedgerStore,
    repair: bool,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<UserReport>> {
    let mut findings = Vec::new();
    for user in store.users()? {
        let report = reconcile_user(store, user, repair, now)?;
        if !report.is_clean() {
            findings.push(report);
        }
    }
    Ok(findings)
}
