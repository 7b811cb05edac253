use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use roomrank_core::FilterPurpose;
use roomrank_storage::StateStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::repository::RankingRepository;

/// Days of daily history a room needs before it stops counting as new.
pub const NEW_ROOM_MIN_RECORDS: i64 = 8;

/// Lookback, in days before the processing date, for member changes and staleness.
pub const LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedIds {
    date: NaiveDate,
    ids: BTreeSet<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTargets {
    pub member_change: BTreeSet<i64>,
    pub new_room: BTreeSet<i64>,
    pub stale_room: BTreeSet<i64>,
}

impl DailyTargets {
    pub fn union(&self) -> BTreeSet<i64> {
        self.member_change
            .iter()
            .chain(&self.new_room)
            .chain(&self.stale_room)
            .copied()
            .collect()
    }
}

/// Date-tagged cache over the full-scan room selections.
pub struct MemberChangeFilterCache {
    repo: Arc<dyn RankingRepository>,
    state: StateStore,
}

impl MemberChangeFilterCache {
    pub fn new(repo: Arc<dyn RankingRepository>, state: StateStore) -> Self {
        Self { repo, state }
    }

    fn key(purpose: FilterPurpose) -> String {
        format!("filter_cache/{}", purpose.as_str())
    }

    async fn compute(&self, purpose: FilterPurpose, date: NaiveDate) -> Result<BTreeSet<i64>> {
        let since = date - Duration::days(LOOKBACK_DAYS);
        match purpose {
            FilterPurpose::MemberChange => self.repo.rooms_with_member_change(since, date).await,
            FilterPurpose::NewRoom => self.repo.rooms_with_few_records(NEW_ROOM_MIN_RECORDS).await,
            FilterPurpose::StaleRoom => self.repo.rooms_unchanged_since(since).await,
        }
    }

    async fn cached(&self, purpose: FilterPurpose, date: NaiveDate) -> Result<BTreeSet<i64>> {
        let key = Self::key(purpose);
        if let Some(entry) = self.state.read::<CachedIds>(&key).await? {
            if entry.date == date {
                debug!(purpose = purpose.as_str(), %date, "filter cache hit");
                return Ok(entry.ids);
            }
        }
        let ids = self.compute(purpose, date).await?;
        self.state
            .write(
                &key,
                &CachedIds {
                    date,
                    ids: ids.clone(),
                },
            )
            .await?;
        debug!(purpose = purpose.as_str(), %date, rooms = ids.len(), "filter cache refreshed");
        Ok(ids)
    }

    /// Rooms to refresh every hour: recent member movers plus rooms that are still new.
    pub async fn get_for_hourly(&self, date: NaiveDate) -> Result<BTreeSet<i64>> {
        let mut ids = self.cached(FilterPurpose::MemberChange, date).await?;
        ids.extend(self.compute(FilterPurpose::NewRoom, date).await?);
        Ok(ids)
    }

    pub async fn get_for_daily(&self, date: NaiveDate) -> Result<DailyTargets> {
        Ok(DailyTargets {
            member_change: self.cached(FilterPurpose::MemberChange, date).await?,
            new_room: self.cached(FilterPurpose::NewRoom, date).await?,
            stale_room: self.cached(FilterPurpose::StaleRoom, date).await?,
        })
    }
}
