use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use banksync::clock::{Clock, SystemClock};
use banksync::config::{default_config_path, ResolvedConfig};
use banksync::models::{BankConnection, ConnectionStatus, Id, TransactionType, User};
use banksync::provider::GoCardlessClient;
use banksync::storage::{JsonFileStorage, Storage, TransactionFilter};
use banksync::sync::{CancellationFlag, SyncOptions, SyncOrchestrator, SyncResult};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    banksync::duration::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_type_arg(s: &str) -> Result<TransactionType, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[derive(Parser)]
#[command(name = "banksync")]
#[command(about = "Open-banking transaction sync and ledger reconciliation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show current configuration
    Config,

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Manage bank connections
    Connection {
        #[command(subcommand)]
        command: ConnectionCommand,
    },

    /// Sync all linked connections of a user
    Sync {
        user_id: String,

        /// Keep running and sync on this interval (e.g. "30m", "6h").
        #[arg(long, value_parser = parse_duration_arg)]
        every: Option<Duration>,

        /// Add random jitter in the range [-jitter, +jitter] to each interval.
        #[arg(long, value_parser = parse_duration_arg)]
        jitter: Option<Duration>,
    },

    /// List a user's stored transactions, newest first
    Transactions {
        user_id: String,

        /// Earliest transaction date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Latest transaction date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Only credits or only debits.
        #[arg(long = "type", value_parser = parse_type_arg)]
        transaction_type: Option<TransactionType>,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create a user
    Add { username: String },
    /// List users
    List,
}

#[derive(Subcommand)]
enum ConnectionCommand {
    /// Register a requisition that is waiting for the institution callback
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        institution: String,
        #[arg(long)]
        requisition: String,
        /// Correlation reference; generated when omitted.
        #[arg(long)]
        reference: Option<String>,
    },
    /// Apply an authorization callback by reference
    Callback {
        reference: String,
        /// Mark the connection as failed with this message.
        #[arg(long)]
        error: Option<String>,
    },
    /// List a user's connections
    List {
        #[arg(long)]
        user: String,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .json(),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .init();
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn compute_next_delay(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }

    let base_ms = interval.as_millis().min(u128::from(u64::MAX)) as i128;
    let jitter_ms = jitter.as_millis().min(u128::from(u64::MAX)) as i128;
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);

    let min_ms = 1_000_i128;
    let max_ms = i128::from(u64::MAX);
    let delay_ms = (base_ms + offset).clamp(min_ms, max_ms) as u64;
    Duration::from_millis(delay_ms)
}

#[derive(Serialize)]
struct SyncOutput<'a> {
    summary: String,
    new_transactions: usize,
    accounts_synced: usize,
    accounts_skipped: usize,
    result: &'a SyncResult,
}

fn print_sync(result: &SyncResult) -> Result<()> {
    print_json(&SyncOutput {
        summary: result.summary(),
        new_transactions: result.new_transactions(),
        accounts_synced: result.accounts_synced(),
        accounts_skipped: result.accounts_skipped(),
        result,
    })
}

async fn require_user(storage: &dyn Storage, user_id: &str) -> Result<User> {
    let id = Id::from_string_checked(user_id)?;
    storage
        .get_user(&id)
        .await?
        .with_context(|| format!("Unknown user: {user_id}"))
}

async fn run_sync(
    config: &ResolvedConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    user_id: &str,
    every: Option<Duration>,
    jitter: Duration,
) -> Result<()> {
    let user = require_user(storage.as_ref(), user_id).await?;
    let credentials = config.provider.credentials()?;
    let provider = GoCardlessClient::new(&config.provider, credentials, clock.clone())?;

    let cancellation = CancellationFlag::new();
    let orchestrator = SyncOrchestrator::new(storage, Arc::new(provider))
        .with_options(SyncOptions::from(&config.sync))
        .with_clock(clock)
        .with_cancellation(cancellation.clone());

    let Some(interval) = every else {
        let watcher = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing accounts already in progress");
                watcher.cancel();
            }
        });
        let result = orchestrator.sync_user(&user.id).await?;
        return print_sync(&result);
    };

    loop {
        let cycle = orchestrator.sync_user(&user.id);
        tokio::pin!(cycle);

        let outcome = tokio::select! {
            outcome = &mut cycle => outcome,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, finishing accounts already in progress");
                cancellation.cancel();
                let result = cycle.await?;
                return print_sync(&result);
            }
        };

        match outcome {
            Ok(result) => print_sync(&result)?,
            Err(err) => tracing::error!(error = %err, "Sync cycle failed"),
        }

        let delay = compute_next_delay(interval, jitter);
        tracing::info!(
            next_in = %banksync::duration::format_duration(delay),
            "Waiting for next sync cycle"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = ResolvedConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;
    let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(&config.data_dir));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Config => {
            let mut shown = config.clone();
            if shown.provider.secret_id.is_some() {
                shown.provider.secret_id = Some("<redacted>".to_string());
            }
            print_json(&serde_json::json!({
                "config_file": cli.config,
                "config": shown,
            }))?;
        }

        Command::User { command } => match command {
            UserCommand::Add { username } => {
                let user = User::new(username, clock.as_ref());
                storage.save_user(&user).await?;
                print_json(&user)?;
            }
            UserCommand::List => {
                print_json(&storage.list_users().await?)?;
            }
        },

        Command::Connection { command } => match command {
            ConnectionCommand::Add {
                user,
                institution,
                requisition,
                reference,
            } => {
                let owner = require_user(storage.as_ref(), &user).await?;
                let reference = reference.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut connection =
                    BankConnection::new(owner.id, institution, requisition, reference, clock.as_ref());
                connection.transition_to(ConnectionStatus::Pending, clock.as_ref())?;
                storage.save_connection(&connection).await?;
                print_json(&connection)?;
            }
            ConnectionCommand::Callback { reference, error } => {
                let mut connection = storage
                    .find_connection_by_reference(&reference)
                    .await?
                    .with_context(|| format!("No connection with reference {reference}"))?;
                connection.confirm_callback(error.as_deref(), clock.as_ref())?;
                storage.save_connection(&connection).await?;
                tracing::info!(
                    connection_id = %connection.id,
                    status = connection.status.as_str(),
                    "Applied connection callback"
                );
                print_json(&connection)?;
            }
            ConnectionCommand::List { user } => {
                let owner = require_user(storage.as_ref(), &user).await?;
                print_json(&storage.connections_for_user(&owner.id).await?)?;
            }
        },

        Command::Sync {
            user_id,
            every,
            jitter,
        } => {
            run_sync(
                &config,
                storage,
                clock,
                &user_id,
                every,
                jitter.unwrap_or(Duration::ZERO),
            )
            .await?;
        }

        Command::Transactions {
            user_id,
            from,
            to,
            transaction_type,
        } => {
            let owner = require_user(storage.as_ref(), &user_id).await?;
            let filter = TransactionFilter {
                from,
                to,
                transaction_type,
            };
            print_json(&storage.transactions_for_user(&owner.id, &filter).await?)?;
        }
    }

    Ok(())
}
