//! Detached persistence process: drains staged cells into the database and supervises itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use roomrank_core::{Cell, HourlyTotal, JobState, Locale};
use roomrank_storage::{StagingArea, StateStore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::notify::Notifier;
use crate::persistence::PersistenceProcess;
use crate::position_store::RankingPositionStore;
use crate::registry::JobRegistry;
use crate::repository::{RankingRepository, RoomCatalog};

/// Job name the persistence process registers under.
pub const PERSIST_JOB: &str = "persist";

/// State key holding the hour-slot of the last self-restart.
pub const RELAUNCH_MARKER: &str = "recovery/last_relaunch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    TimedOut,
    KillParent,
    RelaunchEntrypoint,
    Finished,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    Completed { cells: usize, total: HourlyTotal },
    /// Timed out and started a fresh cycle as `pid`.
    Relaunched { pid: u32 },
    /// Timed out again within an hour-slot that was already relaunched once.
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
}

pub struct OrchestratorParts {
    pub staging: StagingArea,
    pub state: StateStore,
    pub registry: JobRegistry,
    pub repo: Arc<dyn RankingRepository>,
    pub catalog: Arc<dyn RoomCatalog>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct BackgroundPersistenceOrchestrator {
    locale: Locale,
    hour_slot: DateTime<Utc>,
    cells: BTreeMap<Cell, CellStatus>,
    staging: StagingArea,
    state: StateStore,
    registry: JobRegistry,
    repo: Arc<dyn RankingRepository>,
    persistence: PersistenceProcess,
    notifier: Arc<dyn Notifier>,
    settings: OrchestratorSettings,
}

impl BackgroundPersistenceOrchestrator {
    pub fn new(
        locale: Locale,
        hour_slot: DateTime<Utc>,
        categories: &[i32],
        parts: OrchestratorParts,
        settings: OrchestratorSettings,
    ) -> Self {
        let cells = Cell::grid(categories)
            .into_iter()
            .map(|cell| (cell, CellStatus::Pending))
            .collect();
        Self {
            locale,
            hour_slot,
            cells,
            staging: parts.staging,
            state: parts.state,
            registry: parts.registry,
            persistence: PersistenceProcess::new(parts.repo.clone(), parts.catalog),
            repo: parts.repo,
            notifier: parts.notifier,
            settings,
        }
    }

    pub fn status(&self, cell: Cell) -> Option<CellStatus> {
        self.cells.get(&cell).copied()
    }

    fn pending(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .filter(|(_, status)| **status == CellStatus::Pending)
            .map(|(cell, _)| *cell)
            .collect()
    }

    pub async fn run(&mut self, parent_pid: Option<u32>) -> Result<OrchestratorOutcome> {
        let process = self.registry.process().clone();
        self.registry
            .register(
                PERSIST_JOB,
                &JobState {
                    pid: process.current_pid(),
                    parent_pid,
                    start_time: Utc::now(),
                },
            )
            .await?;
        info!(
            locale = %self.locale,
            hour_slot = %self.hour_slot,
            cells = self.cells.len(),
            "persistence started"
        );

        let started = Instant::now();
        loop {
            self.poll_once().await?;
            if self.pending().is_empty() {
                return self.finalize().await;
            }
            if started.elapsed() >= self.settings.timeout {
                return self.recover(parent_pid).await;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Persist every pending cell whose staged file is ready. Returns how many flipped to done.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let mut flipped = 0;
        for cell in self.pending() {
            let Some(entries) =
                RankingPositionStore::load(&self.staging, cell, self.hour_slot).await?
            else {
                continue;
            };
            self.persistence
                .persist_cell(cell, &entries, self.hour_slot)
                .await?;
            self.cells.insert(cell, CellStatus::Done);
            flipped += 1;
        }
        if flipped > 0 {
            debug!(flipped, remaining = self.pending().len(), "cells persisted");
        }
        Ok(flipped)
    }

    async fn finalize(&mut self) -> Result<OrchestratorOutcome> {
        let total = self.repo.count_rooms_at(self.hour_slot).await?;
        self.repo.insert_hourly_total(&total).await?;
        let pruned = self
            .repo
            .delete_samples_before(self.hour_slot - chrono::Duration::days(1))
            .await?;
        self.persistence.catalog().clear().await;
        self.registry
            .clear(PERSIST_JOB, self.registry.process().current_pid())
            .await?;
        info!(
            locale = %self.locale,
            hour_slot = %self.hour_slot,
            ranking_rooms = total.ranking_rooms,
            rising_rooms = total.rising_rooms,
            pruned,
            "persistence finished"
        );
        Ok(OrchestratorOutcome::Completed {
            cells: self.cells.len(),
            total,
        })
    }

    async fn recover(&mut self, parent_pid: Option<u32>) -> Result<OrchestratorOutcome> {
        let process = self.registry.process().clone();
        let mut relaunched = None;
        let mut step = RecoveryStep::TimedOut;
        loop {
            info!(
                event = "persistence_recovery",
                step = ?step,
                locale = %self.locale,
                hour_slot = %self.hour_slot,
                pending = self.pending().len(),
                "recovery step"
            );
            step = match step {
                RecoveryStep::TimedOut => {
                    let last: Option<DateTime<Utc>> = self.state.read(RELAUNCH_MARKER).await?;
                    let repeat = last == Some(self.hour_slot);
                    let action = if repeat {
                        "already restarted once in this hour-slot, giving up"
                    } else {
                        "restarting the cycle"
                    };
                    let body = format!(
                        "locale {} hour-slot {}: {} cells still pending after {}s; {action}",
                        self.locale,
                        self.hour_slot.to_rfc3339(),
                        self.pending().len(),
                        self.settings.timeout.as_secs(),
                    );
                    self.notifier.notify("persistence timeout", &body).await;
                    if repeat {
                        RecoveryStep::Abandoned
                    } else {
                        RecoveryStep::KillParent
                    }
                }
                RecoveryStep::KillParent => {
                    if let Some(parent) = parent_pid.filter(|pid| process.is_alive(*pid)) {
                        if !process.terminate(parent, self.settings.kill_grace).await {
                            warn!(parent, "parent cycle survived termination");
                        }
                    }
                    RecoveryStep::RelaunchEntrypoint
                }
                RecoveryStep::RelaunchEntrypoint => {
                    self.state.write(RELAUNCH_MARKER, &self.hour_slot).await?;
                    self.registry
                        .clear(PERSIST_JOB, process.current_pid())
                        .await?;
                    let args = vec![
                        "cycle".to_string(),
                        "--locale".to_string(),
                        self.locale.to_string(),
                    ];
                    relaunched = Some(process.spawn_detached(&args)?);
                    RecoveryStep::Finished
                }
                RecoveryStep::Finished => {
                    return Ok(match relaunched {
                        Some(pid) => OrchestratorOutcome::Relaunched { pid },
                        None => OrchestratorOutcome::Abandoned,
                    });
                }
                RecoveryStep::Abandoned => {
                    self.registry
                        .clear(PERSIST_JOB, process.current_pid())
                        .await?;
                    return Ok(OrchestratorOutcome::Abandoned);
                }
            };
        }
    }
}
