//! Payout and ledger daemon.
//!
//! `run` starts the sled-backed store and the payout scheduler and serves
//! until ctrl-c. The remaining subcommands are one-shot administrative
//! actions against the same data directory.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use lib_encash::encashment_status;
use lib_ledger::{reconcile_all, reconcile_user, UserReport};
use lib_payout::{process_pending_payouts, PayoutScheduler};
use lib_store::{LedgerStore, SledStore};
use lib_types::{UserId, WalletType};

use crate::config::LedgerdConfig;

#[derive(Parser)]
#[command(name = "ledgerd", about = "Payout and ledger daemon", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "ledgerd.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted.
    Run,
    /// Process all matured payouts once and exit.
    Payouts,
    /// Check the shadow balances against the wallet documents.
    Reconcile {
        /// Limit the check to one user.
        #[arg(long)]
        user: Option<UserId>,
        /// Rewrite drifted shadow documents from the wallets.
        #[arg(long)]
        repair: bool,
    },
    /// Show whether encashment is currently open for a wallet.
    EncashStatus {
        /// Wallet type: credit, passive or bonus.
        wallet: WalletType,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = LedgerdConfig::load(&cli.config)?;
    config.ensure_data_dir()?;
    let store = Arc::new(SledStore::open(config.data_dir.join("ledger.sled"))?);

    match cli.command {
        Command::Run => run(store, &config).await,
        Command::Payouts => {
            let processed = process_pending_payouts(store.as_ref(), Utc::now())?;
            println!("{processed} payout(s) processed");
            Ok(())
        }
        Command::Reconcile { user, repair } => {
            let now = Utc::now();
            let findings = match user {
                Some(user) => {
                    let report = reconcile_user(store.as_ref(), user, repair, now)?;
                    if report.is_clean() {
                        Vec::new()
                    } else {
                        vec![report]
                    }
                }
                None => reconcile_all(store.as_ref(), repair, now)?,
            };
            if findings.is_empty() {
                println!("no drift found");
            } else {
                for report in &findings {
                    print_report(report);
                }
            }
            Ok(())
        }
        Command::EncashStatus { wallet } => {
            let status = encashment_status(store.as_ref(), wallet, Utc::now())?;
            println!(
                "{} wallet: {} ({})",
                wallet,
                if status.is_allowed { "open" } else { "closed" },
                status.message
            );
            Ok(())
        }
    }
}

async fn run(store: Arc<SledStore>, config: &LedgerdConfig) -> Result<()> {
    seed_encashment_settings(store.as_ref(), config)?;

    let scheduler = PayoutScheduler::new(
        store.clone() as Arc<dyn LedgerStore>,
        Duration::from_secs(config.payout.interval_secs),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    info!(data_dir = %config.data_dir.display(), "ledgerd running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    shutdown_tx.send(true)?;
    scheduler_task.await?;
    Ok(())
}

/// Write the configured default window for any wallet type that has no
/// stored settings yet. Existing settings are never overwritten.
fn seed_encashment_settings(store: &dyn LedgerStore, config: &LedgerdConfig) -> Result<()> {
    for wallet_type in WalletType::ALL {
        if store.encashment_settings(wallet_type)?.is_none() {
            let settings = config.default_encashment_settings(wallet_type)?;
            store.put_encashment_settings(&settings)?;
            info!(wallet = %wallet_type, "seeded default encashment settings");
        }
    }
    Ok(())
}

fn print_report(report: &UserReport) {
    for drift in &report.drifts {
        println!(
            "user {} {} wallet: shadow {} != wallet {}{}",
            report.user,
            drift.wallet_type,
            drift.shadow_balance,
            drift.wallet_balance,
            if report.repaired { " (repaired)" } else { "" }
        );
    }
    for wallet_type in &report.totals_anomalies {
        println!(
            "user {} {} wallet: balance does not match total_in - total_out",
            report.user, wallet_type
        );
    }
}
