use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::application::{
    Keeper, LedgerConfig, SubscriptionLedger, DEFAULT_DATABASE, DEFAULT_HOLDING_ACCOUNT,
    DEFAULT_OWNER, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::domain::{
    AccountId, EventKind, SubscriptionId, Units, BILLING_PERIOD_DAYS, PLATFORM_FEE_BPS,
    SUBSCRIPTION_PRICE,
};
use crate::token::ValueTransferService;

/// Subledger - recurring-payment subscription ledger
#[derive(Parser)]
#[command(name = "subledger")]
#[command(about = "A recurring-payment subscription ledger with platform fee splitting")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "SUBLEDGER_DATABASE", default_value = DEFAULT_DATABASE, global = true)]
    pub database: String,

    /// Administrator account, which also receives the platform share
    #[arg(long, env = "SUBLEDGER_OWNER", default_value = DEFAULT_OWNER, global = true)]
    pub owner: String,

    /// The ledger's own token account
    #[arg(long, env = "SUBLEDGER_HOLDING_ACCOUNT", default_value = DEFAULT_HOLDING_ACCOUNT, global = true)]
    pub holding_account: String,

    /// Act as if the current time were this date (YYYY-MM-DD or RFC 3339)
    #[arg(long, global = true)]
    pub at: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Create a subscription and pay its first period
    Subscribe {
        /// Subscribing account
        #[arg(long = "as")]
        caller: String,
    },

    /// Collect the due payment of a subscription
    Pay {
        /// Subscription ID
        id: SubscriptionId,
    },

    /// Cancel a subscription
    Cancel {
        /// Subscription ID
        id: SubscriptionId,

        /// Account requesting the cancellation (must be the subscriber)
        #[arg(long = "as")]
        caller: String,
    },

    /// Show a subscription
    Show {
        /// Subscription ID
        id: SubscriptionId,
    },

    /// List the subscriptions created by an account
    Subscriptions {
        /// Subscriber account
        subscriber: String,
    },

    /// Sweep the holding balance to the owner
    Withdraw {
        /// Account requesting the withdrawal (must be the owner)
        #[arg(long = "as")]
        caller: String,
    },

    /// Show ledger counters and balances
    Stats,

    /// List emitted events
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        after: i64,

        /// Only events of this kind (SubscriptionCreated, PaymentProcessed, SubscriptionCancelled)
        #[arg(long)]
        kind: Option<String>,
    },

    /// Verify ledger integrity
    Check,

    /// Export data to CSV or JSON
    Export {
        /// What to export: subscriptions, events, full
        export_type: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Keeper commands: collect due payments
    #[command(subcommand)]
    Keeper(KeeperCommands),

    /// Reference token commands
    #[command(subcommand)]
    Token(TokenCommands),
}

#[derive(Subcommand)]
pub enum KeeperCommands {
    /// Run a single scan and process due payments
    Scan,

    /// Scan periodically until interrupted
    Run {
        /// Seconds between scans
        #[arg(
            long,
            env = "SUBLEDGER_POLL_INTERVAL_SECS",
            default_value_t = DEFAULT_POLL_INTERVAL_SECS,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        interval: u64,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Credit tokens to an account
    Mint {
        account: String,
        amount: Units,
    },

    /// Allow the ledger to collect from an account
    Approve {
        /// Account granting the allowance
        owner: String,

        amount: Units,

        /// Spender (defaults to the ledger's holding account)
        #[arg(long)]
        spender: Option<String>,
    },

    /// Show the balance of an account
    Balance {
        account: String,
    },
}

impl Cli {
    /// Install the tracing subscriber. `RUST_LOG` wins over `--verbose`.
    pub fn init_logging(&self) {
        let default_level = if self.verbose { "debug" } else { "warn" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("subledger={}", default_level)));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    fn config(&self) -> Result<LedgerConfig> {
        let mut config = LedgerConfig::new(&self.database)
            .with_owner(self.owner.as_str())
            .with_holding_account(self.holding_account.as_str());

        if let Some(at) = &self.at {
            let at = parse_date(at)
                .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", at))?;
            config = config.with_fixed_time(at);
        }

        if let Commands::Keeper(KeeperCommands::Run { interval }) = &self.command {
            config = config.with_poll_interval(Duration::from_secs(*interval));
        }

        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;

        if let Commands::Init = self.command {
            SubscriptionLedger::init(&config).await?;
            println!("Database initialized: {}", config.database);
            return Ok(());
        }

        let ledger = SubscriptionLedger::connect(&config).await?;

        match self.command {
            Commands::Init => {}

            Commands::Subscribe { caller } => {
                let sub = ledger.create_subscription(&AccountId::new(caller)).await?;
                println!("Created subscription {} for {}", sub.id, sub.subscriber);
                println!("  Paid: {}", SUBSCRIPTION_PRICE);
                println!(
                    "  Next payment due: {}",
                    sub.next_payment_due.format("%Y-%m-%d %H:%M")
                );
            }

            Commands::Pay { id } => {
                let receipt = ledger.process_payment(id).await?;
                println!(
                    "Collected {} for subscription {} ({} to platform, {} retained)",
                    receipt.split.total(),
                    id,
                    receipt.split.platform,
                    receipt.split.retained
                );
                println!(
                    "  Next payment due: {}",
                    receipt.subscription.next_payment_due.format("%Y-%m-%d %H:%M")
                );
            }

            Commands::Cancel { id, caller } => {
                let sub = ledger
                    .cancel_subscription(id, &AccountId::new(caller))
                    .await?;
                println!("Cancelled subscription {} ({})", sub.id, sub.subscriber);
            }

            Commands::Show { id } => {
                run_show_command(&ledger, id).await?;
            }

            Commands::Subscriptions { subscriber } => {
                run_subscriptions_command(&ledger, &AccountId::new(subscriber)).await?;
            }

            Commands::Withdraw { caller } => {
                let amount = ledger
                    .withdraw_accumulated(&AccountId::new(caller))
                    .await?;
                println!("Withdrew {} to {}", amount, ledger.owner());
            }

            Commands::Stats => {
                run_stats_command(&ledger).await?;
            }

            Commands::Events { after, kind } => {
                let kind = kind
                    .map(|k| {
                        EventKind::from_str(&k)
                            .ok_or_else(|| anyhow::anyhow!("Invalid event kind: {}", k))
                    })
                    .transpose()?;
                run_events_command(&ledger, after, kind).await?;
            }

            Commands::Check => {
                run_check_command(&ledger).await?;
            }

            Commands::Export {
                export_type,
                output,
            } => {
                run_export_command(&ledger, &export_type, output.as_deref()).await?;
            }

            Commands::Keeper(cmd) => {
                run_keeper_command(&ledger, cmd, config.poll_interval).await?;
            }

            Commands::Token(cmd) => {
                run_token_command(&ledger, cmd).await?;
            }
        }

        Ok(())
    }
}

async fn run_show_command(ledger: &SubscriptionLedger, id: SubscriptionId) -> Result<()> {
    let sub = ledger.get_subscription(id).await?;
    if !sub.exists() {
        println!("No subscription with ID {}", id);
        return Ok(());
    }

    let now = ledger.now();
    println!("Subscription {}", sub.id);
    println!("  Subscriber: {}", sub.subscriber);
    println!("  Status: {}", sub.status());
    println!("  Created: {}", sub.created_at.format("%Y-%m-%d %H:%M"));
    println!(
        "  Next payment due: {}{}",
        sub.next_payment_due.format("%Y-%m-%d %H:%M"),
        if sub.is_due(now) { " (due now)" } else { "" }
    );
    Ok(())
}

async fn run_subscriptions_command(ledger: &SubscriptionLedger, subscriber: &AccountId) -> Result<()> {
    let ids = ledger.get_subscriber_subscriptions(subscriber).await?;
    if ids.is_empty() {
        println!("No subscriptions found for {}.", subscriber);
        return Ok(());
    }

    println!("{:<8} {:<10} {:<18}", "ID", "STATUS", "NEXT DUE");
    println!("{}", "-".repeat(38));
    for id in ids {
        let sub = ledger.get_subscription(id).await?;
        println!(
            "{:<8} {:<10} {:<18}",
            sub.id,
            sub.status(),
            sub.next_payment_due.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn run_stats_command(ledger: &SubscriptionLedger) -> Result<()> {
    let stats = ledger.stats().await?;
    let holding = ledger.holding_balance().await?;
    let owner_balance = ledger.token().balance_of(ledger.owner()).await?;

    println!(
        "Plan: {} every {} days, {}% to platform",
        SUBSCRIPTION_PRICE,
        BILLING_PERIOD_DAYS,
        PLATFORM_FEE_BPS / 100
    );
    println!("Subscriptions:        {}", stats.counters.subscription_count);
    println!("Active subscriptions: {}", stats.active_subscriptions);
    println!("Creations:            {}", stats.counters.subscriber_count);
    println!("Holding balance ({}): {}", ledger.holding_account(), holding);
    println!("Owner balance ({}):   {}", ledger.owner(), owner_balance);
    Ok(())
}

async fn run_events_command(
    ledger: &SubscriptionLedger,
    after: i64,
    kind: Option<EventKind>,
) -> Result<()> {
    let events = ledger.list_events(after, kind).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!("{:<6} {:<22} {:<6} {:<20} {:<18}", "SEQ", "KIND", "ID", "SUBSCRIBER", "AT");
    println!("{}", "-".repeat(76));
    for event in events {
        println!(
            "{:<6} {:<22} {:<6} {:<20} {:<18}",
            event.sequence,
            event.kind,
            event.subscription_id,
            truncate(event.subscriber.as_str(), 20),
            event.emitted_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn run_check_command(ledger: &SubscriptionLedger) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = ledger.check_integrity().await?;

    println!("Subscriptions: {}", report.subscription_count);
    println!("Active:        {}", report.active_count);
    println!("Index entries: {}", report.index_entries);
    println!(
        "Counters:      {} subscriptions, {} creations",
        report.counters.subscription_count, report.counters.subscriber_count
    );
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

async fn run_export_command(
    ledger: &SubscriptionLedger,
    export_type: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(ledger);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "subscriptions" => {
            let count = exporter.export_subscriptions_csv(writer).await?;
            if output.is_some() {
                eprintln!("Exported {} subscriptions", count);
            }
        }
        "events" => {
            let count = exporter.export_events_csv(writer).await?;
            if output.is_some() {
                eprintln!("Exported {} events", count);
            }
        }
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported full ledger: {} subscriptions, {} events",
                    snapshot.subscriptions.len(),
                    snapshot.events.len()
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: subscriptions, events, full",
                export_type
            );
        }
    }

    Ok(())
}

async fn run_keeper_command(
    ledger: &SubscriptionLedger,
    cmd: KeeperCommands,
    poll_interval: Duration,
) -> Result<()> {
    let mut keeper = Keeper::new(ledger);

    match cmd {
        KeeperCommands::Scan => {
            let result = keeper.scan_and_process().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        KeeperCommands::Run { .. } => {
            println!(
                "Keeper running every {}s, press Ctrl-C to stop",
                poll_interval.as_secs()
            );
            keeper
                .run(poll_interval, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            let status = keeper.status();
            println!(
                "Keeper stopped: {} known subscriptions, last event {}",
                status.known_subscriptions, status.last_scanned_sequence
            );
        }
    }

    Ok(())
}

async fn run_token_command(ledger: &SubscriptionLedger, cmd: TokenCommands) -> Result<()> {
    let token = ledger.token();

    match cmd {
        TokenCommands::Mint { account, amount } => {
            let account = AccountId::new(account);
            let balance = token.mint(&account, amount).await?;
            println!("Minted {} to {} (balance {})", amount, account, balance);
        }

        TokenCommands::Approve {
            owner,
            amount,
            spender,
        } => {
            let owner = AccountId::new(owner);
            let spender = spender
                .map(AccountId::new)
                .unwrap_or_else(|| ledger.holding_account().clone());
            token.approve(&owner, &spender, amount).await?;
            println!("{} allows {} to collect {}", owner, spender, amount);
        }

        TokenCommands::Balance { account } => {
            let account = AccountId::new(account);
            let balance = token.balance_of(&account).await?;
            println!("{}: {}", account, balance);
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    use chrono::NaiveDate;

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Parse YYYY-MM-DD format
    let naive_date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .context("Date must be in YYYY-MM-DD format")?;

    // Convert to UTC datetime at midnight
    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;

    Ok(DateTime::from_naive_utc_and_offset(naive_datetime, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_formats() {
        let day = parse_date("2025-02-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2025-02-01T00:00:00+00:00");

        let instant = parse_date("2025-02-01T10:30:00Z").unwrap();
        assert_eq!(instant.to_rfc3339(), "2025-02-01T10:30:00+00:00");

        assert!(parse_date("01/02/2025").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("alice", 10), "alice");
        assert_eq!(truncate("a-very-long-account-name", 10), "a-very-...");
    }

    #[test]
    fn test_cli_parses_subscribe() {
        let cli = Cli::try_parse_from(["subledger", "--database", "x.db", "subscribe", "--as", "alice"])
            .unwrap();
        assert_eq!(cli.database, "x.db");
        assert!(matches!(cli.command, Commands::Subscribe { ref caller } if caller == "alice"));
    }

    #[test]
    fn test_database_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["subledger", "stats", "--database", "x.db"]).unwrap();
        assert_eq!(cli.database, "x.db");
        assert!(matches!(cli.command, Commands::Stats));
    }

    #[test]
    fn test_keeper_interval_must_be_positive() {
        assert!(Cli::try_parse_from(["subledger", "keeper", "run", "--interval", "0"]).is_err());

        let cli = Cli::try_parse_from(["subledger", "keeper", "run", "--interval", "5"]).unwrap();
        let config = cli.config().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_pins_clock_with_at() {
        let cli = Cli::try_parse_from(["subledger", "--at", "2025-05-01", "stats"]).unwrap();
        let config = cli.config().unwrap();
        assert_eq!(config.at, Some(parse_date("2025-05-01").unwrap()));
    }
}
