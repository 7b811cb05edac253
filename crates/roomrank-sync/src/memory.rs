//! In-memory repository with the same keying and conflict rules as the Postgres schema.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use roomrank_core::{
    HourlyTotal, MemberOhlc, MemberSample, PositionOhlc, RankType, RankingSample,
};

use crate::repository::{RankingRepository, RoomCatalog};

#[derive(Debug, Default)]
struct Tables {
    rooms: BTreeMap<String, i64>,
    ranking: BTreeMap<(i64, i32, RankType, DateTime<Utc>), RankingSample>,
    members: BTreeMap<(i64, DateTime<Utc>), MemberSample>,
    totals: BTreeMap<DateTime<Utc>, HourlyTotal>,
    member_ohlc: BTreeMap<(i64, NaiveDate), MemberOhlc>,
    position_ohlc: BTreeMap<(i64, i32, RankType, NaiveDate), PositionOhlc>,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    member_change_failures: AtomicUsize,
}

impl MemoryRepository {
    pub fn with_rooms(rooms: &[(&str, i64)]) -> Self {
        let repo = Self::default();
        for (external_id, id) in rooms {
            repo.add_room(external_id, *id);
        }
        repo
    }

    pub fn add_room(&self, external_id: &str, id: i64) {
        self.tables
            .lock()
            .unwrap()
            .rooms
            .insert(external_id.to_string(), id);
    }

    /// Make the next `count` member-change queries fail.
    pub fn fail_member_change_queries(&self, count: usize) {
        self.member_change_failures.store(count, Ordering::SeqCst);
    }

    pub fn remove_room(&self, external_id: &str) {
        self.tables.lock().unwrap().rooms.remove(external_id);
    }

    pub fn ranking_rows(&self) -> Vec<RankingSample> {
        self.tables.lock().unwrap().ranking.values().cloned().collect()
    }

    pub fn member_rows(&self) -> Vec<MemberSample> {
        self.tables.lock().unwrap().members.values().cloned().collect()
    }

    pub fn totals(&self) -> Vec<HourlyTotal> {
        self.tables.lock().unwrap().totals.values().cloned().collect()
    }

    pub fn member_ohlc_rows(&self) -> Vec<MemberOhlc> {
        self.tables.lock().unwrap().member_ohlc.values().cloned().collect()
    }

    pub fn position_ohlc_rows(&self) -> Vec<PositionOhlc> {
        self.tables.lock().unwrap().position_ohlc.values().cloned().collect()
    }
}

#[async_trait]
impl RoomCatalog for MemoryRepository {
    async fn resolve_ids(&self, external_ids: &[String]) -> Result<HashMap<String, i64>> {
        let tables = self.tables.lock().unwrap();
        Ok(external_ids
            .iter()
            .filter_map(|id| tables.rooms.get(id).map(|room| (id.clone(), *room)))
            .collect())
    }

    async fn existing_ids(&self, room_ids: &[i64]) -> Result<HashSet<i64>> {
        let tables = self.tables.lock().unwrap();
        let known: HashSet<i64> = tables.rooms.values().copied().collect();
        Ok(room_ids.iter().copied().filter(|id| known.contains(id)).collect())
    }
}

#[async_trait]
impl RankingRepository for MemoryRepository {
    async fn insert_ranking_samples(&self, rows: &[RankingSample]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for row in rows {
            let key = (row.room_id, row.category, row.rank_type, row.hour_slot);
            if !tables.ranking.contains_key(&key) {
                tables.ranking.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_member_samples(&self, rows: &[MemberSample]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for row in rows {
            let key = (row.room_id, row.hour_slot);
            if !tables.members.contains_key(&key) {
                tables.members.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_rooms_at(&self, hour_slot: DateTime<Utc>) -> Result<HourlyTotal> {
        let tables = self.tables.lock().unwrap();
        let mut ranking = BTreeSet::new();
        let mut rising = BTreeSet::new();
        for row in tables.ranking.values().filter(|r| r.hour_slot == hour_slot) {
            match row.rank_type {
                RankType::Ranking => ranking.insert(row.room_id),
                RankType::Rising => rising.insert(row.room_id),
            };
        }
        Ok(HourlyTotal {
            hour_slot,
            ranking_rooms: ranking.len() as i64,
            rising_rooms: rising.len() as i64,
        })
    }

    async fn insert_hourly_total(&self, total: &HourlyTotal) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .totals
            .entry(total.hour_slot)
            .or_insert_with(|| total.clone());
        Ok(())
    }

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.ranking.len() + tables.members.len();
        tables.ranking.retain(|_, row| row.hour_slot >= cutoff);
        tables.members.retain(|_, row| row.hour_slot >= cutoff);
        Ok((before - tables.ranking.len() - tables.members.len()) as u64)
    }

    async fn ranking_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RankingSample>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .ranking
            .values()
            .filter(|r| r.hour_slot >= start && r.hour_slot < end)
            .cloned()
            .collect())
    }

    async fn member_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MemberSample>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .members
            .values()
            .filter(|r| r.hour_slot >= start && r.hour_slot < end)
            .cloned()
            .collect())
    }

    async fn insert_member_ohlc(&self, rows: &[MemberOhlc]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for row in rows {
            let key = (row.room_id, row.date);
            if !tables.member_ohlc.contains_key(&key) {
                tables.member_ohlc.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_position_ohlc(&self, rows: &[PositionOhlc]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0;
        for row in rows {
            let key = (row.room_id, row.category, row.rank_type, row.date);
            if !tables.position_ohlc.contains_key(&key) {
                tables.position_ohlc.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn rooms_with_member_change(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<BTreeSet<i64>> {
        let failing = self
            .member_change_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("connection reset while querying member changes");
        }
        let tables = self.tables.lock().unwrap();
        let mut ranges: BTreeMap<i64, (i32, i32)> = BTreeMap::new();
        for row in tables
            .member_ohlc
            .values()
            .filter(|r| r.date >= since && r.date <= until)
        {
            let range = ranges
                .entry(row.room_id)
                .or_insert((row.high_member, row.low_member));
            range.0 = range.0.max(row.high_member);
            range.1 = range.1.min(row.low_member);
        }
        Ok(ranges
            .into_iter()
            .filter(|(_, (high, low))| high != low)
            .map(|(id, _)| id)
            .collect())
    }

    async fn rooms_with_few_records(&self, min_records: i64) -> Result<BTreeSet<i64>> {
        let tables = self.tables.lock().unwrap();
        let mut counts: BTreeMap<i64, i64> =
            tables.rooms.values().map(|id| (*id, 0)).collect();
        for row in tables.member_ohlc.values() {
            if let Some(count) = counts.get_mut(&row.room_id) {
                *count += 1;
            }
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count < min_records)
            .map(|(id, _)| id)
            .collect())
    }

    async fn rooms_unchanged_since(&self, cutoff: NaiveDate) -> Result<BTreeSet<i64>> {
        let tables = self.tables.lock().unwrap();
        let mut latest: BTreeMap<i64, NaiveDate> = BTreeMap::new();
        for row in tables.member_ohlc.values() {
            let entry = latest.entry(row.room_id).or_insert(row.date);
            if row.date > *entry {
                *entry = row.date;
            }
        }
        Ok(latest
            .into_iter()
            .filter(|(_, date)| *date <= cutoff)
            .map(|(id, _)| id)
            .collect())
    }
}
