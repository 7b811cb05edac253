//! The scheduled hourly entrypoint: rollup, detached persistence, download, supervision.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use roomrank_adapters::{download_all, DownloadSummary, RankingFeed};
use roomrank_core::{HourSlotClock, JobState, Locale};
use roomrank_storage::{StagingArea, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::filter_cache::{DailyTargets, MemberChangeFilterCache};
use crate::notify::Notifier;
use crate::orchestrator::PERSIST_JOB;
use crate::position_store::RankingPositionStore;
use crate::registry::{JobRegistry, ProcessControl, SupervisorError};
use crate::repository::{RankingRepository, RoomCatalog};
use crate::rollup::{HourlyToDailyRollup, RollupOutcome};

pub const HOURLY_TARGETS: &str = "targets/hourly";
pub const DAILY_TARGETS: &str = "targets/daily";

/// Room selection published for the outer crawl layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot<T> {
    pub date: NaiveDate,
    pub rooms: T,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub download_batch: usize,
    pub persist_timeout: Duration,
    pub supervisor_grace: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
}

impl CycleSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            download_batch: config.download_batch,
            persist_timeout: config.persist_timeout,
            supervisor_grace: config.supervisor_grace,
            poll_interval: config.poll_interval,
            kill_grace: config.kill_grace,
        }
    }

    /// The foreground waits a little longer than the background self-monitor, so a stalled
    /// persistence process gets the chance to restart the cycle itself.
    pub fn supervisor_ceiling(&self) -> Duration {
        self.persist_timeout + self.supervisor_grace
    }
}

pub struct CycleParts {
    pub feed: Arc<dyn RankingFeed>,
    pub repo: Arc<dyn RankingRepository>,
    pub catalog: Arc<dyn RoomCatalog>,
    pub process: Arc<dyn ProcessControl>,
    pub notifier: Arc<dyn Notifier>,
    pub staging: StagingArea,
    pub state: StateStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub hour_slot: DateTime<Utc>,
    /// `None` when the rollup failed this cycle; the next cycle tries again.
    pub rollup: Option<RollupOutcome>,
    pub download: DownloadSummary,
    pub hourly_targets: Option<usize>,
}

pub struct HourlyCycle {
    run_id: Uuid,
    locale: Locale,
    clock: HourSlotClock,
    categories: Vec<i32>,
    feed: Arc<dyn RankingFeed>,
    notifier: Arc<dyn Notifier>,
    staging: StagingArea,
    state: StateStore,
    registry: JobRegistry,
    rollup: HourlyToDailyRollup,
    filters: MemberChangeFilterCache,
    settings: CycleSettings,
}

impl HourlyCycle {
    pub fn new(
        run_id: Uuid,
        locale: Locale,
        clock: HourSlotClock,
        categories: Vec<i32>,
        parts: CycleParts,
        settings: CycleSettings,
    ) -> Self {
        Self {
            run_id,
            locale,
            clock,
            categories,
            registry: JobRegistry::new(parts.state.clone(), parts.process),
            rollup: HourlyToDailyRollup::new(
                locale,
                clock,
                parts.repo.clone(),
                parts.catalog,
                parts.state.clone(),
            ),
            filters: MemberChangeFilterCache::new(parts.repo, parts.state.clone()),
            feed: parts.feed,
            notifier: parts.notifier,
            staging: parts.staging,
            state: parts.state,
            settings,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run once; a persistence timeout is retried once with a fresh hour-slot reading.
    pub async fn run_with_retry(&self) -> Result<CycleSummary, SupervisorError> {
        match self.run(Utc::now(), 1).await {
            Err(err) if err.is_timeout() => {
                warn!(run_id = %self.run_id, locale = %self.locale, error = %err, "retrying cycle");
                self.notifier
                    .notify(
                        "cycle retry",
                        &format!("locale {}: {err}; retrying once", self.locale),
                    )
                    .await;
                let retried = self.run(Utc::now(), 2).await;
                if let Err(err) = &retried {
                    self.report_failure(err).await;
                }
                retried
            }
            Err(err) => {
                self.report_failure(&err).await;
                Err(err)
            }
            ok => ok,
        }
    }

    async fn report_failure(&self, err: &SupervisorError) {
        if matches!(err, SupervisorError::Other(_)) {
            return;
        }
        self.notifier
            .notify("cycle failed", &format!("locale {}: {err}", self.locale))
            .await;
    }

    pub async fn run(
        &self,
        now: DateTime<Utc>,
        attempt: u32,
    ) -> Result<CycleSummary, SupervisorError> {
        let span = info_span!("cycle", run_id = %self.run_id, locale = %self.locale, attempt);
        self.run_inner(now).instrument(span).await
    }

    async fn run_inner(&self, now: DateTime<Utc>) -> Result<CycleSummary, SupervisorError> {
        let hour_slot = self.clock.slot_for(now);
        let processing_date = self.processing_date(hour_slot);

        let rollup = self.roll_up(processing_date).await;
        self.await_previous_persistence().await?;

        let process = self.registry.process().clone();
        let parent = process.current_pid();
        let args = vec![
            "persist".to_string(),
            "--locale".to_string(),
            self.locale.to_string(),
            "--hour-slot".to_string(),
            hour_slot.to_rfc3339(),
            "--parent-pid".to_string(),
            parent.to_string(),
        ];
        let child = process.spawn_detached(&args)?;
        self.registry
            .register(
                PERSIST_JOB,
                &JobState {
                    pid: child,
                    parent_pid: Some(parent),
                    start_time: Utc::now(),
                },
            )
            .await?;
        info!(%hour_slot, persist_pid = child, "persistence process launched");

        let store = RankingPositionStore::new(self.staging.clone(), hour_slot);
        let download = match download_all(
            self.feed.as_ref(),
            &store,
            &self.categories,
            self.settings.download_batch,
        )
        .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "download pass failed; stopping persistence");
                process.terminate(child, self.settings.kill_grace).await;
                self.registry.clear(PERSIST_JOB, child).await?;
                return Err(err.into());
            }
        };

        self.registry
            .wait_for(
                PERSIST_JOB,
                self.settings.supervisor_ceiling(),
                self.settings.poll_interval,
                self.settings.kill_grace,
            )
            .await?;

        let hourly_targets = match self.filters.get_for_hourly(processing_date).await {
            Ok(hourly) => {
                let count = hourly.len();
                self.publish(HOURLY_TARGETS, processing_date, hourly).await?;
                Some(count)
            }
            Err(err) => {
                warn!(error = ?err, "hourly target selection failed");
                None
            }
        };

        info!(
            %hour_slot,
            entries = download.entries,
            failed_cells = download.failed_cells.len(),
            hourly_targets = ?hourly_targets,
            "cycle complete"
        );
        Ok(CycleSummary {
            run_id: self.run_id,
            hour_slot,
            rollup,
            download,
            hourly_targets,
        })
    }

    /// Roll up `date` and publish its daily targets if they are not out yet.
    ///
    /// Failures are logged; ingestion for the hour goes ahead regardless.
    async fn roll_up(&self, date: NaiveDate) -> Option<RollupOutcome> {
        let rollup = match self.rollup.run(date).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%date, error = ?err, "daily rollup failed");
                return None;
            }
        };
        if let Err(err) = self.publish_daily_targets(date).await {
            warn!(%date, error = ?err, "daily target selection failed");
        }
        Some(rollup)
    }

    async fn publish_daily_targets(&self, date: NaiveDate) -> anyhow::Result<()> {
        let current: Option<TargetSnapshot<DailyTargets>> = self.state.read(DAILY_TARGETS).await?;
        if current.is_some_and(|snapshot| snapshot.date >= date) {
            return Ok(());
        }
        let targets = self.filters.get_for_daily(date).await?;
        self.publish(DAILY_TARGETS, date, targets).await?;
        info!(%date, "daily targets published");
        Ok(())
    }

    /// A persistence process from an earlier cycle owns the staging files until it exits.
    async fn await_previous_persistence(&self) -> Result<(), SupervisorError> {
        let Some(job) = self.registry.get(PERSIST_JOB).await? else {
            return Ok(());
        };
        if !self.registry.process().is_alive(job.pid) {
            debug!(pid = job.pid, "discarding stale persistence record");
            return Ok(());
        }
        warn!(pid = job.pid, "previous persistence still running; waiting");
        match self
            .registry
            .wait_for(
                PERSIST_JOB,
                self.settings.supervisor_ceiling(),
                self.settings.poll_interval,
                self.settings.kill_grace,
            )
            .await
        {
            Err(SupervisorError::Other(err)) => Err(SupervisorError::Other(err)),
            Err(err) => {
                warn!(error = %err, "previous persistence ended abnormally");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// The most recent complete local day at `hour_slot`.
    fn processing_date(&self, hour_slot: DateTime<Utc>) -> NaiveDate {
        let today = self.clock.local_date(hour_slot);
        today.pred_opt().unwrap_or(today)
    }

    async fn publish<T: Serialize>(
        &self,
        key: &str,
        date: NaiveDate,
        rooms: T,
    ) -> anyhow::Result<()> {
        self.state.write(key, &TargetSnapshot { date, rooms }).await
    }
}

/// Read back a published target set.
pub async fn read_hourly_targets(
    state: &StateStore,
) -> anyhow::Result<Option<TargetSnapshot<BTreeSet<i64>>>> {
    state.read(HOURLY_TARGETS).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::notify::testing::RecordingNotifier;
    use crate::orchestrator::{
        BackgroundPersistenceOrchestrator, OrchestratorOutcome, OrchestratorParts,
        OrchestratorSettings,
    };
    use crate::registry::testing::FakeProcessControl;
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use roomrank_adapters::{FeedError, FeedPage};
    use roomrank_core::{Cell, RankType, StagedEntry};

    const CYCLE_PID: u32 = 700;
    const CHILD_PID: u32 = 10_001;

    /// One page per cell: rooms a and b in ranking, b and c in rising.
    struct TwoRoomFeed;

    #[async_trait]
    impl RankingFeed for TwoRoomFeed {
        async fn fetch_page(&self, cell: Cell, token: &str) -> Result<FeedPage, FeedError> {
            if token != "0" {
                return Ok(FeedPage {
                    entries: Vec::new(),
                    next_token: None,
                });
            }
            let ids = match cell.rank_type {
                RankType::Ranking => ["a", "b"],
                RankType::Rising => ["b", "c"],
            };
            Ok(FeedPage {
                entries: ids
                    .iter()
                    .enumerate()
                    .map(|(i, id)| StagedEntry {
                        external_id: id.to_string(),
                        name: id.to_string(),
                        member_count: 100 + cell.category,
                        position: i as i32 + 1,
                    })
                    .collect(),
                next_token: Some("1".to_string()),
            })
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        repo: Arc<MemoryRepository>,
        fake: Arc<FakeProcessControl>,
        notifier: Arc<RecordingNotifier>,
        clock: HourSlotClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tmp: tempfile::tempdir().unwrap(),
                repo: Arc::new(MemoryRepository::with_rooms(&[("a", 1), ("b", 2), ("c", 3)])),
                fake: Arc::new(FakeProcessControl::with_current(CYCLE_PID)),
                notifier: Arc::new(RecordingNotifier::default()),
                clock: HourSlotClock::new(FixedOffset::east_opt(7 * 3600).unwrap(), 30),
            }
        }

        fn staging(&self) -> StagingArea {
            StagingArea::new(self.tmp.path().join("staging"))
        }

        fn state(&self) -> StateStore {
            StateStore::new(self.tmp.path().join("state"))
        }

        fn cycle(&self, persist_timeout: Duration) -> HourlyCycle {
            HourlyCycle::new(
                Uuid::new_v4(),
                Locale::Th,
                self.clock,
                vec![0, 2],
                CycleParts {
                    feed: Arc::new(TwoRoomFeed),
                    repo: self.repo.clone(),
                    catalog: self.repo.clone(),
                    process: self.fake.clone(),
                    notifier: self.notifier.clone(),
                    staging: self.staging(),
                    state: self.state(),
                },
                CycleSettings {
                    download_batch: 2,
                    persist_timeout,
                    supervisor_grace: Duration::ZERO,
                    poll_interval: Duration::from_millis(10),
                    kill_grace: Duration::from_millis(10),
                },
            )
        }

        /// Plays the detached persistence process in-process once the cycle has launched it.
        fn spawn_child(&self, hour_slot: DateTime<Utc>) -> tokio::task::JoinHandle<OrchestratorOutcome> {
            let state = self.state();
            let launched = JobRegistry::new(state.clone(), self.fake.clone());
            let staging = self.staging();
            let repo = self.repo.clone();
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                // pids above 10_000 come from the fake spawner
                let pid = loop {
                    match launched.get(PERSIST_JOB).await.unwrap() {
                        Some(job) if job.pid > 10_000 => break job.pid,
                        _ => tokio::time::sleep(Duration::from_millis(5)).await,
                    }
                };
                let child_process = Arc::new(FakeProcessControl::with_current(pid));
                let parts = OrchestratorParts {
                    staging,
                    state: state.clone(),
                    registry: JobRegistry::new(state, child_process),
                    repo: repo.clone(),
                    catalog: repo,
                    notifier,
                };
                let mut orchestrator = BackgroundPersistenceOrchestrator::new(
                    Locale::Th,
                    hour_slot,
                    &[0, 2],
                    parts,
                    OrchestratorSettings {
                        timeout: Duration::from_secs(5),
                        poll_interval: Duration::from_millis(10),
                        kill_grace: Duration::from_millis(10),
                    },
                );
                orchestrator.run(Some(CYCLE_PID)).await.unwrap()
            })
        }

        async fn daily_targets(&self) -> Option<TargetSnapshot<DailyTargets>> {
            self.state().read(DAILY_TARGETS).await.unwrap()
        }
    }

    #[tokio::test]
    async fn cycle_hands_off_to_persistence_and_publishes_targets() {
        let f = Fixture::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 3, 40, 0).unwrap();
        let hour_slot = f.clock.slot_for(now);
        let child = f.spawn_child(hour_slot);

        let summary = f.cycle(Duration::from_secs(5)).run(now, 1).await.unwrap();
        assert!(matches!(
            child.await.unwrap(),
            OrchestratorOutcome::Completed { cells: 4, .. }
        ));

        assert_eq!(summary.hour_slot, hour_slot);
        assert_eq!(summary.download.entries, 8);
        assert!(summary.download.failed_cells.is_empty());
        assert!(matches!(summary.rollup, Some(RollupOutcome::Completed { .. })));

        let spawned = f.fake.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(&spawned[0][..3], ["persist", "--locale", "th"]);
        assert!(spawned[0].contains(&hour_slot.to_rfc3339()));

        assert_eq!(f.repo.ranking_rows().len(), 8);
        assert_eq!(f.repo.totals().len(), 1);
        let hourly = read_hourly_targets(&f.state()).await.unwrap().unwrap();
        assert_eq!(hourly.date, NaiveDate::from_ymd_opt(2026, 7, 31).unwrap());
        // nothing has daily history yet, so every room is new
        assert_eq!(hourly.rooms, BTreeSet::from([1, 2, 3]));
        assert_eq!(summary.hourly_targets, Some(3));
        let daily = f.daily_targets().await.unwrap();
        assert_eq!(daily.date, hourly.date);
    }

    #[tokio::test]
    async fn failed_daily_selection_is_published_by_the_next_cycle() {
        let f = Fixture::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 3, 40, 0).unwrap();
        let hour_slot = f.clock.slot_for(now);
        let processing_date = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        f.repo.fail_member_change_queries(1);

        let child = f.spawn_child(hour_slot);
        let first = f.cycle(Duration::from_secs(5)).run(now, 1).await.unwrap();
        child.await.unwrap();
        assert!(matches!(first.rollup, Some(RollupOutcome::Completed { .. })));
        assert_eq!(first.download.entries, 8);
        assert!(f.daily_targets().await.is_none());

        let child = f.spawn_child(hour_slot);
        let second = f.cycle(Duration::from_secs(5)).run(now, 1).await.unwrap();
        child.await.unwrap();
        assert!(matches!(second.rollup, Some(RollupOutcome::Skipped { .. })));
        assert_eq!(f.daily_targets().await.unwrap().date, processing_date);
        assert_eq!(f.fake.spawned().len(), 2);
    }

    #[tokio::test]
    async fn launch_waits_for_a_running_persistence_process() {
        let f = Fixture::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 3, 40, 0).unwrap();
        let hour_slot = f.clock.slot_for(now);
        let registry = JobRegistry::new(f.state(), f.fake.clone());
        f.fake.set_alive(777);
        registry
            .register(
                PERSIST_JOB,
                &JobState {
                    pid: 777,
                    parent_pid: Some(1),
                    start_time: Utc::now(),
                },
            )
            .await
            .unwrap();

        let fake = f.fake.clone();
        let previous = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let launched_early = !fake.spawned().is_empty();
            registry.clear(PERSIST_JOB, 777).await.unwrap();
            fake.set_dead(777);
            launched_early
        });
        let child = f.spawn_child(hour_slot);
        let summary = f.cycle(Duration::from_secs(5)).run(now, 1).await.unwrap();
        child.await.unwrap();

        assert!(!previous.await.unwrap());
        assert_eq!(summary.download.entries, 8);
        assert_eq!(f.fake.spawned().len(), 1);
        assert!(f.fake.terminated().is_empty());
    }

    #[tokio::test]
    async fn stalled_persistence_is_killed_and_retried_once() {
        let f = Fixture::new();
        let cycle = f.cycle(Duration::from_millis(60));

        let err = cycle.run_with_retry().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(f.fake.spawned().len(), 2);
        assert_eq!(f.fake.terminated(), vec![CHILD_PID, CHILD_PID + 1]);
        assert_eq!(
            f.notifier.subjects(),
            vec!["cycle retry".to_string(), "cycle failed".to_string()]
        );
    }
}
