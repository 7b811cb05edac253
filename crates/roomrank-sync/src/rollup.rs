use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use roomrank_core::{
    aggregate_members, aggregate_positions, HourSlotClock, Locale, MemberOhlc, PositionOhlc,
    RankType,
};
use roomrank_storage::StateStore;
use tracing::info;

use crate::repository::{RankingRepository, RoomCatalog};

/// State key holding the last local date rolled up.
pub const ROLLUP_MARKER: &str = "rollup/last_processed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupOutcome {
    Skipped {
        last_processed: NaiveDate,
    },
    Completed {
        date: NaiveDate,
        member_rows: u64,
        position_rows: u64,
    },
}

type Series = Vec<(DateTime<Utc>, i32)>;

/// Hourly samples of one local day into daily OHLC rows.
pub struct HourlyToDailyRollup {
    locale: Locale,
    clock: HourSlotClock,
    repo: Arc<dyn RankingRepository>,
    catalog: Arc<dyn RoomCatalog>,
    state: StateStore,
}

impl HourlyToDailyRollup {
    pub fn new(
        locale: Locale,
        clock: HourSlotClock,
        repo: Arc<dyn RankingRepository>,
        catalog: Arc<dyn RoomCatalog>,
        state: StateStore,
    ) -> Self {
        Self {
            locale,
            clock,
            repo,
            catalog,
            state,
        }
    }

    pub async fn last_processed(&self) -> Result<Option<NaiveDate>> {
        self.state.read(ROLLUP_MARKER).await
    }

    /// Roll up `date` unless it (or a later date) was already processed.
    pub async fn run(&self, date: NaiveDate) -> Result<RollupOutcome> {
        if let Some(last_processed) = self.last_processed().await?.filter(|last| *last >= date) {
            info!(locale = %self.locale, %date, %last_processed, "daily rollup already done; skipping");
            return Ok(RollupOutcome::Skipped { last_processed });
        }
        let outcome = self.aggregate(date).await?;
        self.state.write(ROLLUP_MARKER, &date).await?;
        Ok(outcome)
    }

    /// Roll up `date` regardless of the marker. The marker only ever moves forward.
    pub async fn backfill(&self, date: NaiveDate) -> Result<RollupOutcome> {
        let outcome = self.aggregate(date).await?;
        if self.last_processed().await?.is_none_or(|last| last < date) {
            self.state.write(ROLLUP_MARKER, &date).await?;
        }
        Ok(outcome)
    }

    async fn aggregate(&self, date: NaiveDate) -> Result<RollupOutcome> {
        let (start, end) = self.clock.day_bounds(date);
        let expected = self.clock.expected_slots(date);

        let mut positions: BTreeMap<(i64, i32, RankType), Series> = BTreeMap::new();
        for sample in self.repo.ranking_samples_between(start, end).await? {
            positions
                .entry((sample.room_id, sample.category, sample.rank_type))
                .or_default()
                .push((sample.hour_slot, sample.position));
        }
        let position_rows: Vec<PositionOhlc> = positions
            .iter()
            .filter_map(|((room_id, category, rank_type), series)| {
                aggregate_positions(series, &expected).map(|values| {
                    PositionOhlc::from_values(*room_id, *category, *rank_type, date, values)
                })
            })
            .collect();

        let mut members: BTreeMap<i64, Series> = BTreeMap::new();
        for sample in self.repo.member_samples_between(start, end).await? {
            members
                .entry(sample.room_id)
                .or_default()
                .push((sample.hour_slot, sample.member_count));
        }
        let room_ids: Vec<i64> = members.keys().copied().collect();
        let existing = self.catalog.existing_ids(&room_ids).await?;
        let member_rows: Vec<MemberOhlc> = members
            .iter()
            .filter(|(room_id, _)| existing.contains(room_id))
            .filter_map(|(room_id, series)| {
                aggregate_members(series).map(|values| MemberOhlc::from_values(*room_id, date, values))
            })
            .collect();

        let member_inserted = self.repo.insert_member_ohlc(&member_rows).await?;
        let position_inserted = self.repo.insert_position_ohlc(&position_rows).await?;
        info!(
            locale = %self.locale,
            %date,
            member_rows = member_inserted,
            position_rows = position_inserted,
            dropped_rooms = room_ids.len() - existing.len(),
            "daily rollup complete"
        );
        Ok(RollupOutcome::Completed {
            date,
            member_rows: member_inserted,
            position_rows: position_inserted,
        })
    }
}
