//! Hourly ingestion, detached persistence, and daily rollup for the room ranking tracker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use roomrank_adapters::HttpRankingFeed;
use roomrank_core::Locale;
use roomrank_storage::{HttpClientConfig, HttpFetcher, StagingArea, StateStore, TokenBucketConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod config;
pub mod cycle;
pub mod filter_cache;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod position_store;
pub mod registry;
pub mod repository;
pub mod rollup;

#[cfg(test)]
mod memory;

pub use config::{LocaleProfile, LocaleRegistry, SyncConfig};
pub use cycle::{CycleParts, CycleSettings, CycleSummary, HourlyCycle, TargetSnapshot};
pub use filter_cache::{DailyTargets, MemberChangeFilterCache};
pub use notify::{notifier_for, LogNotifier, Notifier, WebhookNotifier};
pub use orchestrator::{
    BackgroundPersistenceOrchestrator, CellStatus, OrchestratorOutcome, OrchestratorParts,
    OrchestratorSettings, RecoveryStep, PERSIST_JOB,
};
pub use persistence::{CachedRoomCatalog, PersistOutcome, PersistenceProcess};
pub use position_store::RankingPositionStore;
pub use registry::{JobRegistry, ProcessControl, SupervisorError, SystemProcessControl};
pub use repository::{PgRepository, RankingRepository, RoomCatalog};
pub use rollup::{HourlyToDailyRollup, RollupOutcome};

pub const CRATE_NAME: &str = "roomrank-sync";

/// Everything one locale's entrypoints share.
struct LocaleContext {
    config: SyncConfig,
    profile: LocaleProfile,
    staging: StagingArea,
    state: StateStore,
}

impl LocaleContext {
    fn load(config: SyncConfig, locale: Locale) -> Result<Self> {
        let registry = config.load_locales()?;
        let profile = registry.profile(locale)?.clone();
        Ok(Self {
            staging: StagingArea::new(config.staging_dir_for(locale)),
            state: StateStore::new(config.state_dir_for(locale)),
            config,
            profile,
        })
    }

    fn locale(&self) -> Locale {
        self.profile.locale
    }

    async fn repository(&self) -> Result<Arc<PgRepository>> {
        let url = self.config.database_url_for(self.locale());
        Ok(Arc::new(PgRepository::connect(&url).await?))
    }

    fn process_control(&self) -> Arc<dyn ProcessControl> {
        Arc::new(SystemProcessControl::with_log_file(
            self.config.state_dir_for(self.locale()).join("detached.log"),
        ))
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::from(notifier_for(self.config.webhook_url.as_deref()))
    }

    fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.config.http_timeout_secs),
            user_agent: Some(self.config.user_agent.clone()),
            token_bucket: self.config.requests_per_sec.filter(|r| *r > 0).map(|rate| {
                TokenBucketConfig {
                    capacity: rate,
                    refill_every: Duration::from_secs(1) / rate,
                }
            }),
            ..Default::default()
        })
    }
}

pub async fn run_cycle_from_env(locale: Locale) -> Result<CycleSummary> {
    let ctx = LocaleContext::load(SyncConfig::from_env(), locale)?;
    let repo = ctx.repository().await?;
    let run_id = Uuid::new_v4();
    let feed = HttpRankingFeed::new(Arc::new(ctx.http_fetcher()?), ctx.profile.feed.clone(), run_id)?;
    let cycle = HourlyCycle::new(
        run_id,
        locale,
        ctx.profile.clock(ctx.config.slot_minute)?,
        ctx.profile.categories.clone(),
        CycleParts {
            feed: Arc::new(feed),
            repo: repo.clone(),
            catalog: repo,
            process: ctx.process_control(),
            notifier: ctx.notifier(),
            staging: ctx.staging.clone(),
            state: ctx.state.clone(),
        },
        CycleSettings::from_config(&ctx.config),
    );
    Ok(cycle.run_with_retry().await?)
}

pub async fn run_persist_from_env(
    locale: Locale,
    hour_slot: DateTime<Utc>,
    parent_pid: Option<u32>,
) -> Result<OrchestratorOutcome> {
    let ctx = LocaleContext::load(SyncConfig::from_env(), locale)?;
    let repo = ctx.repository().await?;
    let mut orchestrator = BackgroundPersistenceOrchestrator::new(
        locale,
        hour_slot,
        &ctx.profile.categories,
        OrchestratorParts {
            staging: ctx.staging.clone(),
            state: ctx.state.clone(),
            registry: JobRegistry::new(ctx.state.clone(), ctx.process_control()),
            repo: repo.clone(),
            catalog: repo,
            notifier: ctx.notifier(),
        },
        OrchestratorSettings {
            timeout: ctx.config.persist_timeout,
            poll_interval: ctx.config.poll_interval,
            kill_grace: ctx.config.kill_grace,
        },
    );
    orchestrator.run(parent_pid).await
}

/// Roll up `date`, or the last complete local day when none is given.
pub async fn run_rollup_from_env(
    locale: Locale,
    date: Option<NaiveDate>,
    force: bool,
) -> Result<RollupOutcome> {
    let ctx = LocaleContext::load(SyncConfig::from_env(), locale)?;
    let clock = ctx.profile.clock(ctx.config.slot_minute)?;
    let date = match date {
        Some(date) => date,
        None => {
            let today = clock.local_date(clock.slot_for(Utc::now()));
            today.pred_opt().context("no day before today")?
        }
    };
    let repo = ctx.repository().await?;
    let rollup = HourlyToDailyRollup::new(locale, clock, repo.clone(), repo, ctx.state.clone());
    if force {
        rollup.backfill(date).await
    } else {
        rollup.run(date).await
    }
}

/// Apply migrations to each locale's database (each distinct URL once).
pub async fn migrate_from_env(locales: &[Locale]) -> Result<usize> {
    let config = SyncConfig::from_env();
    let urls: BTreeSet<String> = locales
        .iter()
        .map(|locale| config.database_url_for(*locale))
        .collect();
    for url in &urls {
        PgRepository::connect(url).await?.migrate().await?;
    }
    info!(databases = urls.len(), "migrations applied");
    Ok(urls.len())
}

/// Cron scheduler launching one detached `cycle` per configured locale, when enabled.
///
/// Each cycle is its own process; a persistence self-restart kills that cycle, not the scheduler.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let locales: Vec<Locale> = config
        .load_locales()?
        .locales
        .iter()
        .map(|p| p.locale)
        .collect();

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for locale in locales {
        let process = SystemProcessControl::with_log_file(
            config.state_dir_for(locale).join("detached.log"),
        );
        let job = Job::new_async(config.cycle_cron.as_str(), move |_uuid, _l| {
            let process = process.clone();
            Box::pin(async move {
                let args = vec!["cycle".to_string(), "--locale".to_string(), locale.to_string()];
                match process.spawn_detached(&args) {
                    Ok(pid) => info!(%locale, pid, "scheduled cycle launched"),
                    Err(err) => error!(%locale, error = %err, "failed to launch scheduled cycle"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", config.cycle_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let Some(mut sched) = maybe_build_scheduler(&config).await? else {
        bail!("scheduler is disabled; set ROOMRANK_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = config.cycle_cron.as_str(), "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Human-readable job and marker state for every configured locale.
pub async fn status_report_from_env() -> Result<String> {
    let config = SyncConfig::from_env();
    let process: Arc<dyn ProcessControl> = Arc::new(SystemProcessControl::default());
    let mut out = String::new();
    for profile in &config.load_locales()?.locales {
        let state = StateStore::new(config.state_dir_for(profile.locale));
        let job = JobRegistry::new(state.clone(), process.clone())
            .get(PERSIST_JOB)
            .await?;
        let rollup: Option<NaiveDate> = state.read(rollup::ROLLUP_MARKER).await?;
        let relaunch: Option<DateTime<Utc>> = state.read(orchestrator::RELAUNCH_MARKER).await?;
        let hourly = cycle::read_hourly_targets(&state).await?;

        out.push_str(&format!("[{}]\n", profile.locale));
        match job {
            Some(job) => out.push_str(&format!(
                "  persist: pid {} ({}) started {}\n",
                job.pid,
                if process.is_alive(job.pid) { "alive" } else { "dead" },
                job.start_time.to_rfc3339()
            )),
            None => out.push_str("  persist: idle\n"),
        }
        out.push_str(&format!(
            "  last rollup: {}\n",
            rollup.map_or_else(|| "never".to_string(), |d| d.to_string())
        ));
        if let Some(slot) = relaunch {
            out.push_str(&format!("  last self-restart: {}\n", slot.to_rfc3339()));
        }
        if let Some(hourly) = hourly {
            out.push_str(&format!(
                "  hourly targets: {} rooms for {}\n",
                hourly.rooms.len(),
                hourly.date
            ));
        }
    }
    Ok(out)
}
