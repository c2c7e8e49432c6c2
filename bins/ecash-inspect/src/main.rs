//! ecash-inspect: read-only view into a wallet database.
//!
//! Opens the wallet offline (every exchange request fails with a network
//! error) and prints balances, pending tasks or coins. The `revoke`
//! subcommand records a denomination revocation so that the next online
//! run recoups the affected coins.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ecash_core::exchange::*;
use ecash_core::records::CoinRecord;
use ecash_core::{EddsaPublicKey, ExchangeClient, ExchangeError, Hash256, Timestamp};
use ecash_store::StoreName;
use ecash_wallet::{Wallet, WalletConfig};
use tracing::{debug, info};

/// Exchange client for offline inspection.
struct OfflineExchange;

fn offline<T>() -> Result<T, ExchangeError> {
    Err(ExchangeError::Network("ecash-inspect runs offline".into()))
}

#[async_trait]
impl ExchangeClient for OfflineExchange {
    async fn reserve_status(&self, _: &str, _: &EddsaPublicKey) -> Result<ReserveStatusResponse, ExchangeError> {
        offline()
    }

    async fn withdraw(&self, _: &str, _: &WithdrawRequest) -> Result<WithdrawResponse, ExchangeError> {
        offline()
    }

    async fn deposit(&self, _: &str, _: &DepositRequest) -> Result<DepositResponse, ExchangeError> {
        offline()
    }

    async fn melt(&self, _: &str, _: &MeltRequest) -> Result<MeltResponse, ExchangeError> {
        offline()
    }

    async fn reveal(&self, _: &str, _: &RevealRequest) -> Result<RevealResponse, ExchangeError> {
        offline()
    }

    async fn recoup(&self, _: &str, _: &RecoupRequest) -> Result<RecoupResponse, ExchangeError> {
        offline()
    }
}

#[derive(Parser, Debug)]
#[command(name = "ecash-inspect", version, about = "Inspect an e-cash wallet database")]
struct Cli {
    /// Wallet data directory
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Balance per currency.
    Balance,
    /// Tasks that still have work to do.
    Pending,
    /// Every coin in the wallet.
    Coins,
    /// Mark a denomination revoked and schedule recoup of its coins.
    Revoke {
        /// Exchange base URL
        #[arg(long)]
        exchange: String,
        /// Denomination public key hash (hex)
        #[arg(long)]
        denom: String,
    },
}

fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn show_balance(wallet: &Wallet, json: bool) -> Result<()> {
    let balances = wallet.get_balances()?;
    if json {
        return print_json(&balances);
    }
    if balances.is_empty() {
        println!("no funds");
    }
    for b in balances {
        println!("{:<6} available {:>16}  incoming {:>16}", b.currency, b.available, b.pending_incoming);
    }
    Ok(())
}

fn show_pending(wallet: &Wallet, json: bool) -> Result<()> {
    let now = Timestamp::now();
    let pending = wallet.get_pending_operations(now)?;
    if json {
        return print_json(&pending);
    }
    if pending.pending_operations.is_empty() {
        println!("nothing pending");
    }
    for p in &pending.pending_operations {
        let due = match p.timestamp_due {
            None => "frozen".to_string(),
            Some(t) if t <= now => "now".to_string(),
            Some(t) => t.to_string(),
        };
        let attempts = p.retry_info.as_ref().map_or(0, |r| r.retry_counter);
        print!("{}  due {due}  attempts {attempts}", p.task);
        match &p.last_error {
            Some(e) => println!("  last error {e}"),
            None => println!(),
        }
    }
    Ok(())
}

fn show_coins(wallet: &Wallet, json: bool) -> Result<()> {
    let coins = wallet
        .db()
        .run_read_only(&[StoreName::Coins], |tx| tx.iter::<CoinRecord>()?.to_vec())?;
    if json {
        let rows: Vec<serde_json::Value> = coins
            .iter()
            .map(|c| {
                serde_json::json!({
                    "coin_pub": c.coin_pub.to_string(),
                    "exchange_base_url": c.exchange_base_url,
                    "denom_pub_hash": c.denom_pub_hash.to_string(),
                    "current_amount": c.current_amount.to_string(),
                    "status": format!("{:?}", c.status),
                    "suspended": c.suspended,
                })
            })
            .collect();
        return print_json(&rows);
    }
    for c in &coins {
        println!(
            "{}  {:>16}  {:?}{}  {}",
            c.coin_pub,
            c.current_amount,
            c.status,
            if c.suspended { " (suspended)" } else { "" },
            c.exchange_base_url
        );
    }
    println!("{} coins", coins.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    let mut config = WalletConfig::default();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    debug!(data_dir = %config.data_dir.display(), "opening wallet");
    let wallet = Wallet::open(config, Arc::new(OfflineExchange))
        .with_context(|| "failed to open wallet database")?;

    let result = match cli.command {
        Command::Balance => show_balance(&wallet, cli.json),
        Command::Pending => show_pending(&wallet, cli.json),
        Command::Coins => show_coins(&wallet, cli.json),
        Command::Revoke { exchange, denom } => {
            let hash = Hash256::from_hex(&denom).with_context(|| format!("invalid denomination hash {denom}"))?;
            match wallet.revoke_denomination(&exchange, hash)? {
                Some(id) => {
                    info!(recoup_group = %id, "recoup scheduled");
                    println!("recoup group {id} created");
                }
                None => println!("denomination revoked, no coins affected"),
            }
            Ok(())
        }
    };
    wallet.shutdown();
    result
}
