//! Core domain model for the room ranking tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ohlc;

pub use ohlc::{aggregate_members, aggregate_positions, MemberOhlcValues, PositionOhlcValues};

pub const CRATE_NAME: &str = "roomrank-core";

/// Category id of the provider's all-genre leaderboard.
pub const OVERALL_CATEGORY: i32 = 0;

/// Hour-slots the rollup expects per calendar day.
pub const SLOTS_PER_DAY: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown locale `{0}`")]
    Locale(String),
    #[error("unknown rank type `{0}`")]
    RankType(String),
}

/// Provider market a pipeline run operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Ja,
    Tw,
    Th,
}

impl Locale {
    pub fn all() -> &'static [Locale] {
        &[Locale::Ja, Locale::Tw, Locale::Th]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Locale::Ja => "ja",
            Locale::Tw => "tw",
            Locale::Th => "th",
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Locale {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ja" => Ok(Locale::Ja),
            "tw" => Ok(Locale::Tw),
            "th" => Ok(Locale::Th),
            other => Err(ParseError::Locale(other.to_string())),
        }
    }
}

/// Leaderboard flavour: the general ranking or the trending ("rising") list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankType {
    Ranking,
    Rising,
}

impl RankType {
    pub fn all() -> &'static [RankType] {
        &[RankType::Ranking, RankType::Rising]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RankType::Ranking => "ranking",
            RankType::Rising => "rising",
        }
    }
}

impl fmt::Display for RankType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ranking" => Ok(RankType::Ranking),
            "rising" => Ok(RankType::Rising),
            other => Err(ParseError::RankType(other.to_string())),
        }
    }
}

/// One (category, rank type) unit of download and persistence work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub category: i32,
    pub rank_type: RankType,
}

impl Cell {
    pub fn new(category: i32, rank_type: RankType) -> Self {
        Self {
            category,
            rank_type,
        }
    }

    /// Every cell for a category list, ranking cells first.
    pub fn grid(categories: &[i32]) -> Vec<Cell> {
        RankType::all()
            .iter()
            .flat_map(|rank_type| categories.iter().map(|c| Cell::new(*c, *rank_type)))
            .collect()
    }

    /// Whether entries of this cell also carry the membership sample for the hour.
    pub fn records_members(&self) -> bool {
        self.category == OVERALL_CATEGORY || self.rank_type == RankType::Ranking
    }

    /// Stable key used for staging file names.
    pub fn key(&self) -> String {
        format!("{}/{}", self.rank_type, self.category)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank_type, self.category)
    }
}

/// Leaderboard entry as handed from the downloader to the persistence process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    pub external_id: String,
    pub name: String,
    pub member_count: i32,
    /// 1-based position in feed order.
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSample {
    pub room_id: i64,
    pub category: i32,
    pub rank_type: RankType,
    pub position: i32,
    pub hour_slot: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSample {
    pub room_id: i64,
    pub member_count: i32,
    pub hour_slot: DateTime<Utc>,
}

/// Aggregate row written once every cell of an hour-slot has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyTotal {
    pub hour_slot: DateTime<Utc>,
    pub ranking_rooms: i64,
    pub rising_rooms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberOhlc {
    pub room_id: i64,
    pub date: NaiveDate,
    pub open_member: i32,
    pub high_member: i32,
    pub low_member: i32,
    pub close_member: i32,
}

impl MemberOhlc {
    pub fn from_values(room_id: i64, date: NaiveDate, values: MemberOhlcValues) -> Self {
        Self {
            room_id,
            date,
            open_member: values.open,
            high_member: values.high,
            low_member: values.low,
            close_member: values.close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOhlc {
    pub room_id: i64,
    pub category: i32,
    pub rank_type: RankType,
    pub date: NaiveDate,
    pub open_position: i32,
    pub high_position: i32,
    /// `None` when the room was out of rank for at least one expected slot.
    pub low_position: Option<i32>,
    pub close_position: i32,
}

impl PositionOhlc {
    pub fn from_values(
        room_id: i64,
        category: i32,
        rank_type: RankType,
        date: NaiveDate,
        values: PositionOhlcValues,
    ) -> Self {
        Self {
            room_id,
            category,
            rank_type,
            date,
            open_position: values.open,
            high_position: values.high,
            low_position: values.low,
            close_position: values.close,
        }
    }
}

/// Liveness record of a detached background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub start_time: DateTime<Utc>,
}

/// Room selections cached by the member-change filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPurpose {
    /// Member count changed at least once in the last 8 days.
    MemberChange,
    /// Fewer than 8 daily records.
    NewRoom,
    /// Latest daily record is 7 or more days old.
    StaleRoom,
}

impl FilterPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPurpose::MemberChange => "member_change",
            FilterPurpose::NewRoom => "new_room",
            FilterPurpose::StaleRoom => "stale_room",
        }
    }
}

/// Hour-slot arithmetic for one locale.
///
/// Cycles run once an hour at `slot_minute` past the hour, locale time. Every sample taken by a
/// cycle carries that cycle's slot, and a locale calendar day owns exactly [`SLOTS_PER_DAY`] slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourSlotClock {
    offset: FixedOffset,
    slot_minute: u32,
}

impl HourSlotClock {
    pub fn new(offset: FixedOffset, slot_minute: u32) -> Self {
        Self {
            offset,
            slot_minute: slot_minute.min(59),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The most recent slot at or before `now`.
    pub fn slot_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let truncated = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .and_then(|t| t.with_minute(self.slot_minute))
            .unwrap_or(local);
        let slot = if local.minute() < self.slot_minute {
            truncated - Duration::hours(1)
        } else {
            truncated
        };
        slot.with_timezone(&Utc)
    }

    /// Locale calendar date a slot belongs to.
    pub fn local_date(&self, slot: DateTime<Utc>) -> NaiveDate {
        slot.with_timezone(&self.offset).date_naive()
    }

    /// `[start, end)` in UTC covering one locale calendar day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self
            .offset
            .from_local_datetime(&date.and_time(chrono::NaiveTime::MIN))
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN).and_utc());
        (start, start + Duration::days(1))
    }

    /// All slots a fully observed day produces, in chronological order.
    pub fn expected_slots(&self, date: NaiveDate) -> Vec<DateTime<Utc>> {
        (0..SLOTS_PER_DAY as u32)
            .filter_map(|hour| date.and_hms_opt(hour, self.slot_minute, 0))
            .filter_map(|naive| self.offset.from_local_datetime(&naive).single())
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }
}
