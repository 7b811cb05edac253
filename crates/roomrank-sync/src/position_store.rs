use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomrank_adapters::CellSink;
use roomrank_core::{Cell, StagedEntry};
use roomrank_storage::StagingArea;
use tracing::{debug, warn};

/// Buffers downloaded entries per cell and publishes each cell as one staged file stamped with
/// the cycle's hour-slot.
pub struct RankingPositionStore {
    staging: StagingArea,
    hour_slot: DateTime<Utc>,
    buffers: Mutex<HashMap<Cell, Vec<StagedEntry>>>,
}

impl RankingPositionStore {
    pub fn new(staging: StagingArea, hour_slot: DateTime<Utc>) -> Self {
        Self {
            staging,
            hour_slot,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn hour_slot(&self) -> DateTime<Utc> {
        self.hour_slot
    }

    /// Staged entries for `cell`, or `None` while the file has not been published for `expected`.
    ///
    /// An unreadable batch counts as an empty one.
    pub async fn load(
        staging: &StagingArea,
        cell: Cell,
        expected: DateTime<Utc>,
    ) -> Result<Option<Vec<StagedEntry>>> {
        let Some(bytes) = staging.read_if_ready(&cell.key(), expected).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(entries) => Ok(Some(entries)),
            Err(err) => {
                warn!(%cell, error = %err, "staged batch is not valid json; treating as empty");
                Ok(Some(Vec::new()))
            }
        }
    }
}

#[async_trait]
impl CellSink for RankingPositionStore {
    fn add(&self, cell: Cell, entries: Vec<StagedEntry>) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cell)
            .or_default()
            .extend(entries);
    }

    fn discard(&self, cell: Cell) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cell);
    }

    async fn commit(&self, cell: Cell) -> Result<usize> {
        let entries = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cell)
            .unwrap_or_default();
        let bytes = serde_json::to_vec(&entries)
            .with_context(|| format!("serializing staged batch for {cell}"))?;
        let path = self.staging.put(&cell.key(), &bytes, self.hour_slot).await?;
        debug!(%cell, entries = entries.len(), path = %path.display(), "staged batch published");
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use roomrank_core::RankType;

    fn entry(id: &str, position: i32) -> StagedEntry {
        StagedEntry {
            external_id: id.to_string(),
            name: id.to_uppercase(),
            member_count: 50,
            position,
        }
    }

    #[tokio::test]
    async fn pages_accumulate_until_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path());
        let slot = Utc.with_ymd_and_hms(2026, 5, 2, 3, 30, 0).unwrap();
        let store = RankingPositionStore::new(staging.clone(), slot);
        let cell = Cell::new(4, RankType::Ranking);

        store.add(cell, vec![entry("a", 1), entry("b", 2)]);
        store.add(cell, vec![entry("c", 3)]);
        assert_eq!(
            RankingPositionStore::load(&staging, cell, slot).await.unwrap(),
            None
        );

        assert_eq!(store.commit(cell).await.unwrap(), 3);
        let loaded = RankingPositionStore::load(&staging, cell, slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(tmp.path().join("ranking/4.json").exists());

        let next_slot = slot + chrono::Duration::hours(1);
        assert_eq!(
            RankingPositionStore::load(&staging, cell, next_slot).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn discarded_cell_is_published_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path());
        let slot = Utc.with_ymd_and_hms(2026, 5, 2, 4, 30, 0).unwrap();
        let store = RankingPositionStore::new(staging.clone(), slot);
        let cell = Cell::new(0, RankType::Rising);

        store.add(cell, vec![entry("a", 1)]);
        store.discard(cell);
        assert_eq!(store.commit(cell).await.unwrap(), 0);
        assert_eq!(
            RankingPositionStore::load(&staging, cell, slot).await.unwrap(),
            Some(Vec::new())
        );
    }

    #[tokio::test]
    async fn corrupt_batch_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path());
        let slot = Utc.with_ymd_and_hms(2026, 5, 2, 5, 30, 0).unwrap();
        let cell = Cell::new(9, RankType::Ranking);
        staging.put(&cell.key(), b"{not json", slot).await.unwrap();
        assert_eq!(
            RankingPositionStore::load(&staging, cell, slot).await.unwrap(),
            Some(Vec::new())
        );
    }
}
