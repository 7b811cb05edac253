use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use roomrank_core::{Cell, MemberSample, RankingSample, StagedEntry};
use tokio::sync::Mutex;
use tracing::debug;

use crate::repository::{RankingRepository, RoomCatalog};

/// Catalog front with a process-lifetime external-id cache.
pub struct CachedRoomCatalog {
    inner: Arc<dyn RoomCatalog>,
    cache: Mutex<HashMap<String, i64>>,
}

impl CachedRoomCatalog {
    pub fn new(inner: Arc<dyn RoomCatalog>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve ids, asking the catalog only for ids not seen before.
    pub async fn resolve(&self, external_ids: &[String]) -> Result<HashMap<String, i64>> {
        let mut cache = self.cache.lock().await;
        let missing: Vec<String> = external_ids
            .iter()
            .filter(|id| !cache.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            cache.extend(self.inner.resolve_ids(&missing).await?);
        }
        Ok(external_ids
            .iter()
            .filter_map(|id| cache.get(id).map(|room| (id.clone(), *room)))
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub ranking_rows: u64,
    pub member_rows: u64,
    pub unresolved: usize,
}

/// Turns one staged cell into sample rows.
pub struct PersistenceProcess {
    repo: Arc<dyn RankingRepository>,
    catalog: CachedRoomCatalog,
}

impl PersistenceProcess {
    pub fn new(repo: Arc<dyn RankingRepository>, catalog: Arc<dyn RoomCatalog>) -> Self {
        Self {
            repo,
            catalog: CachedRoomCatalog::new(catalog),
        }
    }

    pub fn catalog(&self) -> &CachedRoomCatalog {
        &self.catalog
    }

    pub async fn persist_cell(
        &self,
        cell: Cell,
        entries: &[StagedEntry],
        hour_slot: DateTime<Utc>,
    ) -> Result<PersistOutcome> {
        if entries.is_empty() {
            return Ok(PersistOutcome::default());
        }
        let external_ids: Vec<String> = entries.iter().map(|e| e.external_id.clone()).collect();
        let ids = self.catalog.resolve(&external_ids).await?;

        let mut ranking = Vec::with_capacity(entries.len());
        let mut members = Vec::new();
        let mut unresolved = 0;
        for entry in entries {
            let Some(room_id) = ids.get(&entry.external_id).copied() else {
                unresolved += 1;
                continue;
            };
            ranking.push(RankingSample {
                room_id,
                category: cell.category,
                rank_type: cell.rank_type,
                position: entry.position,
                hour_slot,
            });
            if cell.records_members() {
                members.push(MemberSample {
                    room_id,
                    member_count: entry.member_count,
                    hour_slot,
                });
            }
        }

        let outcome = PersistOutcome {
            ranking_rows: self.repo.insert_ranking_samples(&ranking).await?,
            member_rows: self.repo.insert_member_samples(&members).await?,
            unresolved,
        };
        debug!(
            %cell,
            ranking_rows = outcome.ranking_rows,
            member_rows = outcome.member_rows,
            unresolved,
            "cell persisted"
        );
        Ok(outcome)
    }
}
