use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use roomrank_core::Locale;
use roomrank_sync::{OrchestratorOutcome, RollupOutcome};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roomrank")]
#[command(about = "Room ranking tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Hourly ingestion cycle for one locale.
    Cycle {
        #[arg(long)]
        locale: Locale,
    },
    /// Detached persistence process; launched by `cycle`.
    Persist {
        #[arg(long)]
        locale: Locale,
        #[arg(long)]
        hour_slot: DateTime<Utc>,
        #[arg(long)]
        parent_pid: Option<u32>,
    },
    /// Roll a day of hourly samples into daily OHLC rows.
    Rollup {
        #[arg(long)]
        locale: Locale,
        /// Local date to roll up; defaults to yesterday.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Ignore the already-processed marker.
        #[arg(long)]
        force: bool,
    },
    Migrate {
        /// Only this locale's database; all locales otherwise.
        #[arg(long)]
        locale: Option<Locale>,
    },
    Schedule,
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roomrank=info,sqlx=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    info!(command = ?cli.command, "roomrank starting");

    match cli.command {
        Commands::Cycle { locale } => {
            let summary = roomrank_sync::run_cycle_from_env(locale).await?;
            println!(
                "cycle complete: run_id={} hour_slot={} entries={} failed_cells={} hourly_targets={}",
                summary.run_id,
                summary.hour_slot.to_rfc3339(),
                summary.download.entries,
                summary.download.failed_cells.len(),
                summary
                    .hourly_targets
                    .map_or_else(|| "unavailable".to_string(), |n| n.to_string())
            );
        }
        Commands::Persist {
            locale,
            hour_slot,
            parent_pid,
        } => match roomrank_sync::run_persist_from_env(locale, hour_slot, parent_pid).await? {
            OrchestratorOutcome::Completed { cells, total } => println!(
                "persist complete: cells={cells} ranking_rooms={} rising_rooms={}",
                total.ranking_rooms, total.rising_rooms
            ),
            OrchestratorOutcome::Relaunched { pid } => {
                println!("persist timed out: relaunched cycle as pid {pid}")
            }
            OrchestratorOutcome::Abandoned => println!("persist timed out: abandoned"),
        },
        Commands::Rollup {
            locale,
            date,
            force,
        } => match roomrank_sync::run_rollup_from_env(locale, date, force).await? {
            RollupOutcome::Skipped { last_processed } => {
                println!("rollup skipped: already processed through {last_processed}")
            }
            RollupOutcome::Completed {
                date,
                member_rows,
                position_rows,
            } => println!(
                "rollup complete: date={date} member_rows={member_rows} position_rows={position_rows}"
            ),
        },
        Commands::Migrate { locale } => {
            let locales = match locale {
                Some(locale) => vec![locale],
                None => Locale::all().to_vec(),
            };
            let databases = roomrank_sync::migrate_from_env(&locales).await?;
            println!("migrations applied to {databases} database(s)");
        }
        Commands::Schedule => roomrank_sync::run_scheduler_from_env().await?,
        Commands::Status => print!("{}", roomrank_sync::status_report_from_env().await?),
    }

    Ok(())
}
