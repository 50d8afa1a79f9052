//! Daemon configuration.
//!
//! Loaded from a TOML file; every section has working defaults so a missing
//! file or a partial one still yields a runnable daemon. Times are "HH:MM"
//! strings and weekdays are three-letter names ("Mon".."Sun"), parsed once
//! at load time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use tracing::info;

use lib_encash::WithdrawalPolicy;
use lib_payout::ContractPolicy;
use lib_types::{EncashmentSettings, WalletType};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerdConfig {
    pub data_dir: PathBuf,
    pub payout: PayoutConfig,
    pub withdrawal: WithdrawalConfig,
    pub encashment: EncashmentConfig,
}

impl Default for LedgerdConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("ledgerd-data"),
            payout: PayoutConfig::default(),
            withdrawal: WithdrawalConfig::default(),
            encashment: EncashmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayoutConfig {
    /// Seconds between scheduler runs.
    pub interval_secs: u64,
    pub term_days: i64,
    pub multiplier_bps: u32,
    pub min_principal: u64,
    pub max_principal: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        let policy = ContractPolicy::default();
        Self {
            interval_secs: 86_400,
            term_days: policy.term_days,
            multiplier_bps: policy.multiplier_bps,
            min_principal: policy.min_principal,
            max_principal: policy.max_principal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WithdrawalConfig {
    pub min_credit: u64,
    pub min_passive: u64,
    pub min_bonus: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        let policy = WithdrawalPolicy::default();
        Self {
            min_credit: policy.min_credit,
            min_passive: policy.min_passive,
            min_bonus: policy.min_bonus,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncashmentConfig {
    pub enabled: bool,
    /// "HH:MM", inclusive.
    pub start_time: String,
    /// "HH:MM", exclusive.
    pub end_time: String,
    /// Three-letter weekday names.
    pub allowed_days: Vec<String>,
}

impl Default for EncashmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_time: "11:00".to_string(),
            end_time: "15:00".to_string(),
            allowed_days: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl LedgerdConfig {
    /// Parse the file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let start = parse_time(&self.encashment.start_time)?;
        let end = parse_time(&self.encashment.end_time)?;
        anyhow::ensure!(
            start < end,
            "encashment start_time {} must precede end_time {}",
            self.encashment.start_time,
            self.encashment.end_time
        );
        for day in &self.encashment.allowed_days {
            parse_weekday(day)?;
        }
        anyhow::ensure!(
            self.payout.min_principal <= self.payout.max_principal,
            "payout min_principal exceeds max_principal"
        );
        Ok(())
    }

    /// Create the data directory if it does not exist yet.
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("creating data directory {}", self.data_dir.display()))?;
            info!(path = %self.data_dir.display(), "created data directory");
        }
        Ok(())
    }

    pub fn contract_policy(&self) -> ContractPolicy {
        ContractPolicy {
            term_days: self.payout.term_days,
            multiplier_bps: self.payout.multiplier_bps,
            min_principal: self.payout.min_principal,
            max_principal: self.payout.max_principal,
        }
    }

    pub fn withdrawal_policy(&self) -> WithdrawalPolicy {
        WithdrawalPolicy {
            min_credit: self.withdrawal.min_credit,
            min_passive: self.withdrawal.min_passive,
            min_bonus: self.withdrawal.min_bonus,
        }
    }

    /// Default window settings for one wallet type, seeded at startup when
    /// the store has none.
    pub fn default_encashment_settings(&self, wallet_type: WalletType) -> Result<EncashmentSettings> {
        let days = self
            .encashment
            .allowed_days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<Weekday>>>()?;
        Ok(EncashmentSettings::new(
            wallet_type,
            self.encashment.enabled,
            parse_time(&self.encashment.start_time)?,
            parse_time(&self.encashment.end_time)?,
            days,
        ))
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .with_context(|| format!("invalid time {raw:?}, expected HH:MM"))
}

fn parse_weekday(raw: &str) -> Result<Weekday> {
    raw.parse::<Weekday>()
        .map_err(|_| anyhow::anyhow!("invalid weekday {raw:?}"))
}
