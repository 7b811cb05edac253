//! Durable row storage for samples, daily OHLC history, and the room catalog.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use roomrank_core::{
    HourlyTotal, MemberOhlc, MemberSample, PositionOhlc, RankType, RankingSample,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// Rows per multi-value INSERT, well under the Postgres bind-parameter limit.
const INSERT_CHUNK: usize = 1_000;

/// External room catalog: resolves provider ids and confirms rooms still exist.
#[async_trait]
pub trait RoomCatalog: Send + Sync {
    /// Known rooms among `external_ids`; unknown ids are simply absent from the map.
    async fn resolve_ids(&self, external_ids: &[String]) -> Result<HashMap<String, i64>>;

    async fn existing_ids(&self, room_ids: &[i64]) -> Result<HashSet<i64>>;
}

#[async_trait]
pub trait RankingRepository: Send + Sync {
    /// Returns the number of rows actually inserted; existing keys are left alone.
    async fn insert_ranking_samples(&self, rows: &[RankingSample]) -> Result<u64>;
    async fn insert_member_samples(&self, rows: &[MemberSample]) -> Result<u64>;
    async fn count_rooms_at(&self, hour_slot: DateTime<Utc>) -> Result<HourlyTotal>;
    async fn insert_hourly_total(&self, total: &HourlyTotal) -> Result<()>;
    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn ranking_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RankingSample>>;
    async fn member_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MemberSample>>;

    async fn insert_member_ohlc(&self, rows: &[MemberOhlc]) -> Result<u64>;
    async fn insert_position_ohlc(&self, rows: &[PositionOhlc]) -> Result<u64>;

    /// Rooms whose daily member range moved within `[since, until]`.
    async fn rooms_with_member_change(&self, since: NaiveDate, until: NaiveDate)
        -> Result<BTreeSet<i64>>;
    /// Catalog rooms with fewer than `min_records` daily member rows.
    async fn rooms_with_few_records(&self, min_records: i64) -> Result<BTreeSet<i64>>;
    /// Rooms whose latest daily member row is on or before `cutoff`.
    async fn rooms_unchanged_since(&self, cutoff: NaiveDate) -> Result<BTreeSet<i64>>;
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn parse_rank_type(value: &str) -> Result<RankType> {
    value
        .parse()
        .with_context(|| format!("unexpected rank_type column value {value}"))
}

fn id_set(rows: Vec<sqlx::postgres::PgRow>) -> Result<BTreeSet<i64>> {
    rows.into_iter()
        .map(|row| row.try_get::<i64, _>("room_id").map_err(anyhow::Error::from))
        .collect()
}

#[async_trait]
impl RoomCatalog for PgRepository {
    async fn resolve_ids(&self, external_ids: &[String]) -> Result<HashMap<String, i64>> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT id, external_id FROM rooms WHERE external_id = ANY($1)")
            .bind(external_ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .context("resolving external room ids")?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("external_id")?, row.try_get("id")?);
        }
        Ok(out)
    }

    async fn existing_ids(&self, room_ids: &[i64]) -> Result<HashSet<i64>> {
        if room_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT id FROM rooms WHERE id = ANY($1)")
            .bind(room_ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .context("checking room existence")?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(anyhow::Error::from))
            .collect()
    }
}

#[async_trait]
impl RankingRepository for PgRepository {
    async fn insert_ranking_samples(&self, rows: &[RankingSample]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO ranking_samples (room_id, category, rank_type, position, hour_slot) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.room_id)
                    .push_bind(row.category)
                    .push_bind(row.rank_type.as_str())
                    .push_bind(row.position)
                    .push_bind(row.hour_slot);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("inserting ranking samples")?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_member_samples(&self, rows: &[MemberSample]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO member_samples (room_id, member_count, hour_slot) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.room_id)
                    .push_bind(row.member_count)
                    .push_bind(row.hour_slot);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("inserting member samples")?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn count_rooms_at(&self, hour_slot: DateTime<Utc>) -> Result<HourlyTotal> {
        let rows = sqlx::query(
            r#"
            SELECT rank_type, COUNT(DISTINCT room_id) AS rooms
              FROM ranking_samples
             WHERE hour_slot = $1
             GROUP BY rank_type
            "#,
        )
        .bind(hour_slot)
        .fetch_all(&self.pool)
        .await
        .context("counting rooms for hour slot")?;

        let mut total = HourlyTotal {
            hour_slot,
            ranking_rooms: 0,
            rising_rooms: 0,
        };
        for row in rows {
            let rooms: i64 = row.try_get("rooms")?;
            match parse_rank_type(row.try_get("rank_type")?)? {
                RankType::Ranking => total.ranking_rooms = rooms,
                RankType::Rising => total.rising_rooms = rooms,
            }
        }
        Ok(total)
    }

    async fn insert_hourly_total(&self, total: &HourlyTotal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hourly_totals (hour_slot, ranking_rooms, rising_rooms)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(total.hour_slot)
        .bind(total.ranking_rooms)
        .bind(total.rising_rooms)
        .execute(&self.pool)
        .await
        .context("inserting hourly total")?;
        Ok(())
    }

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let ranking = sqlx::query("DELETE FROM ranking_samples WHERE hour_slot < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("pruning ranking samples")?;
        let members = sqlx::query("DELETE FROM member_samples WHERE hour_slot < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("pruning member samples")?;
        tx.commit().await?;
        Ok(ranking.rows_affected() + members.rows_affected())
    }

    async fn ranking_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RankingSample>> {
        let rows = sqlx::query(
            r#"
            SELECT room_id, category, rank_type, position, hour_slot
              FROM ranking_samples
             WHERE hour_slot >= $1 AND hour_slot < $2
             ORDER BY hour_slot
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("loading ranking samples")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RankingSample {
                room_id: row.try_get("room_id")?,
                category: row.try_get("category")?,
                rank_type: parse_rank_type(row.try_get("rank_type")?)?,
                position: row.try_get("position")?,
                hour_slot: row.try_get("hour_slot")?,
            });
        }
        Ok(out)
    }

    async fn member_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MemberSample>> {
        let rows = sqlx::query(
            r#"
            SELECT room_id, member_count, hour_slot
              FROM member_samples
             WHERE hour_slot >= $1 AND hour_slot < $2
             ORDER BY hour_slot
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("loading member samples")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MemberSample {
                room_id: row.try_get("room_id")?,
                member_count: row.try_get("member_count")?,
                hour_slot: row.try_get("hour_slot")?,
            });
        }
        Ok(out)
    }

    async fn insert_member_ohlc(&self, rows: &[MemberOhlc]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO member_ohlc (room_id, date, open_member, high_member, low_member, close_member) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.room_id)
                    .push_bind(row.date)
                    .push_bind(row.open_member)
                    .push_bind(row.high_member)
                    .push_bind(row.low_member)
                    .push_bind(row.close_member);
            });
            qb.push(" ON CONFLICT (room_id, date) DO NOTHING");
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("inserting member ohlc")?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_position_ohlc(&self, rows: &[PositionOhlc]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO position_ohlc (room_id, category, rank_type, date, open_position, high_position, low_position, close_position) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.room_id)
                    .push_bind(row.category)
                    .push_bind(row.rank_type.as_str())
                    .push_bind(row.date)
                    .push_bind(row.open_position)
                    .push_bind(row.high_position)
                    .push_bind(row.low_position)
                    .push_bind(row.close_position);
            });
            qb.push(" ON CONFLICT (room_id, category, rank_type, date) DO NOTHING");
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("inserting position ohlc")?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn rooms_with_member_change(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<BTreeSet<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT room_id
              FROM member_ohlc
             WHERE date BETWEEN $1 AND $2
             GROUP BY room_id
            HAVING MAX(high_member) <> MIN(low_member)
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .context("selecting rooms with member changes")?;
        id_set(rows)
    }

    async fn rooms_with_few_records(&self, min_records: i64) -> Result<BTreeSet<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id AS room_id
              FROM rooms r
              LEFT JOIN member_ohlc m ON m.room_id = r.id
             GROUP BY r.id
            HAVING COUNT(m.room_id) < $1
            "#,
        )
        .bind(min_records)
        .fetch_all(&self.pool)
        .await
        .context("selecting rooms with few records")?;
        id_set(rows)
    }

    async fn rooms_unchanged_since(&self, cutoff: NaiveDate) -> Result<BTreeSet<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT room_id
              FROM member_ohlc
             GROUP BY room_id
            HAVING MAX(date) <= $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("selecting stale rooms")?;
        id_set(rows)
    }
}
