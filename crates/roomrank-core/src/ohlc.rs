//! Daily open/high/low/close aggregation of hourly samples.
//!
//! Both aggregators take the samples of one period in any order and produce at most one record.
//! An empty period yields `None`: a room that never appeared has no row, not a row of sentinels.
//!
//! Positions follow the leaderboard convention where a lower number is a better rank. `high` is
//! the numerically largest (worst observed) position and `low` the smallest (best). `low` is only
//! reported when the room was in rank for every expected slot of the day; a single unobserved slot
//! means the room may have been anywhere during that hour.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberOhlcValues {
    pub open: i32,
    pub high: i32,
    pub low: i32,
    pub close: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOhlcValues {
    pub open: i32,
    pub high: i32,
    pub low: Option<i32>,
    pub close: i32,
}

/// Running open/high/low/close over chronologically ordered values.
#[derive(Debug, Clone, Copy)]
struct Bar {
    open: i32,
    high: i32,
    low: i32,
    close: i32,
}

impl Bar {
    fn new(value: i32) -> Self {
        Self {
            open: value,
            high: value,
            low: value,
            close: value,
        }
    }

    fn update(&mut self, value: i32) {
        if value > self.high {
            self.high = value;
        }
        if value < self.low {
            self.low = value;
        }
        self.close = value;
    }
}

fn fold_bar(samples: &[(DateTime<Utc>, i32)]) -> Option<Bar> {
    let mut ordered = samples.to_vec();
    ordered.sort_by_key(|(slot, _)| *slot);
    let mut iter = ordered.into_iter();
    let (_, first) = iter.next()?;
    let mut bar = Bar::new(first);
    for (_, value) in iter {
        bar.update(value);
    }
    Some(bar)
}

/// Member-count OHLC. Membership is observable every hour, so there is no gap rule.
pub fn aggregate_members(samples: &[(DateTime<Utc>, i32)]) -> Option<MemberOhlcValues> {
    fold_bar(samples).map(|bar| MemberOhlcValues {
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
    })
}

/// Leaderboard-position OHLC with the out-of-rank rule on `low`.
pub fn aggregate_positions(
    samples: &[(DateTime<Utc>, i32)],
    expected_slots: &[DateTime<Utc>],
) -> Option<PositionOhlcValues> {
    let bar = fold_bar(samples)?;
    let observed: BTreeSet<DateTime<Utc>> = samples.iter().map(|(slot, _)| *slot).collect();
    let full_coverage = expected_slots.iter().all(|slot| observed.contains(slot));
    Some(PositionOhlcValues {
        open: bar.open,
        high: bar.high,
        low: full_coverage.then_some(bar.low),
        close: bar.close,
    })
}
