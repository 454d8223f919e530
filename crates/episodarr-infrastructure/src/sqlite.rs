// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use episodarr_domain::{
    normalize_series_name, EntityId, EntityRef, IdentifiedBy, Quality, Release, ReleaseId, Series,
    SeriesEntity, SeriesId,
};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state_store::{majority_mode, synthetic_floor, EntityKey, ScanMutations, StateStore};

/// SQLx-backed state store
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    // Try RFC3339 first
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Fallback to SQLite default CURRENT_TIMESTAMP format: "YYYY-MM-DD HH:MM:SS"
    let ndt = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn row_to_series(row: &sqlx::sqlite::SqliteRow) -> Result<Series> {
    let id_str: String = row.try_get("id")?;
    let id = SeriesId::from_uuid(Uuid::parse_str(&id_str)?);

    let name: String = row.try_get("name")?;
    let name_normalized: String = row.try_get("name_normalized")?;
    let alternate_names_s: String = row.try_get("alternate_names")?;
    let identified_by_s: String = row.try_get("identified_by")?;
    let begin_s: Option<String> = row.try_get("begin_ref")?;
    let created_at_s: String = row.try_get("created_at")?;
    let updated_at_s: String = row.try_get("updated_at")?;

    let begin = match begin_s {
        Some(s) => Some(
            EntityRef::parse_str(&s).ok_or_else(|| anyhow!("invalid begin ref: {}", s))?,
        ),
        None => None,
    };

    Ok(Series {
        id,
        name,
        name_normalized,
        alternate_names: serde_json::from_str(&alternate_names_s)?,
        identified_by: IdentifiedBy::parse_str(&identified_by_s)
            .ok_or_else(|| anyhow!("invalid identified_by: {}", identified_by_s))?,
        begin,
        created_at: parse_dt(created_at_s)?,
        updated_at: parse_dt(updated_at_s)?,
    })
}

fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<SeriesEntity> {
    let id_str: String = row.try_get("id")?;
    let series_id_str: String = row.try_get("series_id")?;

    let season: Option<i64> = row.try_get("season")?;
    let episode: Option<i64> = row.try_get("episode")?;
    let date_s: Option<String> = row.try_get("date")?;
    let is_season_pack: bool = row.try_get("is_season_pack")?;
    let identified_by_s: String = row.try_get("identified_by")?;
    let first_seen_s: String = row.try_get("first_seen")?;

    let date = match date_s {
        Some(s) => Some(NaiveDate::parse_from_str(&s, "%Y-%m-%d")?),
        None => None,
    };

    Ok(SeriesEntity {
        id: EntityId::from_uuid(Uuid::parse_str(&id_str)?),
        series_id: SeriesId::from_uuid(Uuid::parse_str(&series_id_str)?),
        season: season.map(|s| s as u32),
        episode: episode.map(|e| e as u32),
        date,
        is_season_pack,
        identified_by: IdentifiedBy::parse_str(&identified_by_s)
            .ok_or_else(|| anyhow!("invalid identified_by: {}", identified_by_s))?,
        first_seen: parse_dt(first_seen_s)?,
    })
}

fn row_to_release(row: &sqlx::sqlite::SqliteRow) -> Result<Release> {
    let id_str: String = row.try_get("id")?;
    let entity_id_str: String = row.try_get("entity_id")?;

    let title: String = row.try_get("title")?;
    let quality_s: String = row.try_get("quality")?;
    let proper_count: i64 = row.try_get("proper_count")?;
    let downloaded: bool = row.try_get("downloaded")?;
    let first_seen_s: String = row.try_get("first_seen")?;

    Ok(Release {
        id: ReleaseId::from_uuid(Uuid::parse_str(&id_str)?),
        entity_id: EntityId::from_uuid(Uuid::parse_str(&entity_id_str)?),
        title,
        quality: Quality::parse(&quality_s),
        proper_count: proper_count as u32,
        downloaded,
        first_seen: parse_dt(first_seen_s)?,
    })
}

async fn find_series_tx<'a, E>(executor: E, name: &str) -> Result<Option<Series>>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    let normalized = normalize_series_name(name);
    let row = sqlx::query(
        r#"
        SELECT * FROM series
        WHERE name_normalized = ?1
           OR EXISTS (
               SELECT 1 FROM json_each(series.alternate_names)
               WHERE json_each.value = ?1
           )
        LIMIT 1
        "#,
    )
    .bind(&normalized)
    .fetch_optional(executor)
    .await?;
    if let Some(r) = row {
        Ok(Some(row_to_series(&r)?))
    } else {
        Ok(None)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn find_series(&self, name: &str) -> Result<Option<Series>> {
        debug!(target: "state_store", series = %name, "looking up series");
        find_series_tx(&self.pool, name).await
    }

    async fn ensure_series(
        &self,
        name: &str,
        alternate_names: &[String],
        identified_by: IdentifiedBy,
    ) -> Result<Series> {
        let mut tx = self.pool.begin().await?;

        let existing = find_series_tx(&mut *tx, name).await?;
        let id = match existing {
            Some(series) => series.id,
            None => {
                let series = Series::new(name);
                debug!(target: "state_store", series = %name, "creating series");
                sqlx::query(
                    r#"
                    INSERT INTO series (
                        id, name, name_normalized, alternate_names, identified_by,
                        begin_ref, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(series.id.to_string())
                .bind(series.name.clone())
                .bind(series.name_normalized.clone())
                .bind("[]")
                .bind(series.identified_by.to_string())
                .bind(Option::<String>::None)
                .bind(series.created_at.to_rfc3339())
                .bind(series.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                series.id
            }
        };

        // Alternate names are unique across all series; one already claimed
        // elsewhere is skipped with a warning.
        let mut accepted: Vec<String> = Vec::new();
        for alt in alternate_names {
            let normalized = normalize_series_name(alt);
            if normalized.is_empty() {
                continue;
            }
            let owner = find_series_tx(&mut *tx, &normalized).await?;
            match owner {
                Some(other) if other.id != id => {
                    warn!(
                        target: "state_store",
                        series = %name,
                        alternate_name = %normalized,
                        claimed_by = %other.name,
                        "alternate name already claimed by another series; skipping"
                    );
                }
                _ => accepted.push(normalized),
            }
        }

        let identified_by_sql = if identified_by.is_concrete() {
            Some(identified_by.to_string())
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE series SET
                alternate_names = ?,
                identified_by = COALESCE(?, identified_by),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(&accepted)?)
        .bind(identified_by_sql)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM series WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let series = row_to_series(&row)?;
        tx.commit().await?;
        Ok(series)
    }

    async fn set_begin(&self, series_id: SeriesId, begin: Option<EntityRef>) -> Result<()> {
        debug!(target: "state_store", %series_id, "updating begin point");
        sqlx::query("UPDATE series SET begin_ref = ?, updated_at = ? WHERE id = ?")
            .bind(begin.map(|b| b.to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(series_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_entity(
        &self,
        series_id: SeriesId,
        key: &EntityKey,
    ) -> Result<Option<SeriesEntity>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM series_entities
            WHERE series_id = ?
              AND identified_by = ?
              AND is_season_pack = ?
              AND COALESCE(season, -1) = COALESCE(?, -1)
              AND COALESCE(episode, -1) = COALESCE(?, -1)
              AND COALESCE(date, '') = COALESCE(?, '')
            LIMIT 1
            "#,
        )
        .bind(series_id.to_string())
        .bind(key.identified_by.to_string())
        .bind(key.is_season_pack)
        .bind(key.season.map(|s| s as i64))
        .bind(key.episode.map(|e| e as i64))
        .bind(key.date.map(|d| d.format("%Y-%m-%d").to_string()))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(r) = row {
            Ok(Some(row_to_entity(&r)?))
        } else {
            Ok(None)
        }
    }

    async fn entities(&self, series_id: SeriesId) -> Result<Vec<SeriesEntity>> {
        let rows = sqlx::query("SELECT * FROM series_entities WHERE series_id = ?")
            .bind(series_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_entity(&r)?);
        }
        out.sort_by_key(|e| e.sort_key());
        Ok(out)
    }

    async fn releases(&self, entity_id: EntityId) -> Result<Vec<Release>> {
        let rows =
            sqlx::query("SELECT * FROM releases WHERE entity_id = ? ORDER BY first_seen")
                .bind(entity_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_release(&r)?);
        }
        Ok(out)
    }

    async fn downloaded_releases(&self, entity_id: EntityId) -> Result<Vec<Release>> {
        let rows = sqlx::query(
            "SELECT * FROM releases WHERE entity_id = ? AND downloaded = 1 ORDER BY first_seen",
        )
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_release(&r)?);
        }
        Ok(out)
    }

    async fn completed_seasons(&self, series_id: SeriesId) -> Result<BTreeSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT e.season AS season
            FROM series_entities e
            JOIN releases r ON r.entity_id = e.id AND r.downloaded = 1
            WHERE e.series_id = ? AND e.is_season_pack = 1 AND e.season IS NOT NULL
            "#,
        )
        .bind(series_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeSet::new();
        for r in rows {
            let season: i64 = r.try_get("season")?;
            out.insert(season as u32);
        }
        Ok(out)
    }

    async fn downloaded_episode_count(&self, series_id: SeriesId, season: u32) -> Result<u32> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT e.id) AS n
            FROM series_entities e
            JOIN releases r ON r.entity_id = e.id AND r.downloaded = 1
            WHERE e.series_id = ? AND e.is_season_pack = 0 AND e.season = ?
            "#,
        )
        .bind(series_id.to_string())
        .bind(season as i64)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    async fn latest_release(&self, series: &Series) -> Result<Option<SeriesEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT e.*
            FROM series_entities e
            JOIN releases r ON r.entity_id = e.id AND r.downloaded = 1
            WHERE e.series_id = ?
            "#,
        )
        .bind(series.id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut latest: Option<SeriesEntity> = None;
        for r in rows {
            let entity = row_to_entity(&r)?;
            let newer = latest
                .as_ref()
                .map(|l| entity.sort_key() > l.sort_key())
                .unwrap_or(true);
            if newer {
                latest = Some(entity);
            }
        }
        let floor = synthetic_floor(series);
        Ok(match (latest, floor) {
            (Some(latest), Some(floor)) if floor.sort_key() > latest.sort_key() => Some(floor),
            (Some(latest), _) => Some(latest),
            (None, floor) => floor,
        })
    }

    async fn infer_identified_by(&self, series_id: SeriesId) -> Result<IdentifiedBy> {
        let row = sqlx::query("SELECT * FROM series WHERE id = ? LIMIT 1")
            .bind(series_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("unknown series {}", series_id))?;
        let series = row_to_series(&row)?;
        if series.identified_by != IdentifiedBy::Auto {
            return Ok(series.identified_by);
        }
        let entities = self.entities(series_id).await?;
        match majority_mode(&entities) {
            Some(mode) => {
                debug!(
                    target: "state_store",
                    series = %series.name,
                    mode = %mode,
                    "inferred identification mode"
                );
                sqlx::query("UPDATE series SET identified_by = ?, updated_at = ? WHERE id = ?")
                    .bind(mode.to_string())
                    .bind(Utc::now().to_rfc3339())
                    .bind(series_id.to_string())
                    .execute(&self.pool)
                    .await?;
                Ok(mode)
            }
            None => Ok(IdentifiedBy::Auto),
        }
    }

    async fn commit_scan(&self, mutations: ScanMutations) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for entity in &mutations.new_entities {
            // The unique expression index makes re-insertion of an already
            // known entity a no-op.
            sqlx::query(
                r#"
                INSERT INTO series_entities (
                    id, series_id, season, episode, date, is_season_pack,
                    identified_by, first_seen
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(entity.id.to_string())
            .bind(entity.series_id.to_string())
            .bind(entity.season.map(|s| s as i64))
            .bind(entity.episode.map(|e| e as i64))
            .bind(entity.date.map(|d| d.format("%Y-%m-%d").to_string()))
            .bind(entity.is_season_pack)
            .bind(entity.identified_by.to_string())
            .bind(entity.first_seen.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for release in &mutations.releases {
            // Entity id may differ from the in-memory one when the entity row
            // already existed; resolve through the key of the entity carried
            // alongside the release.
            let entity_id: String = match mutations
                .new_entities
                .iter()
                .find(|e| e.id == release.entity_id)
            {
                Some(entity) => {
                    let row = sqlx::query(
                        r#"
                        SELECT id FROM series_entities
                        WHERE series_id = ?
                          AND identified_by = ?
                          AND is_season_pack = ?
                          AND COALESCE(season, -1) = COALESCE(?, -1)
                          AND COALESCE(episode, -1) = COALESCE(?, -1)
                          AND COALESCE(date, '') = COALESCE(?, '')
                        LIMIT 1
                        "#,
                    )
                    .bind(entity.series_id.to_string())
                    .bind(entity.identified_by.to_string())
                    .bind(entity.is_season_pack)
                    .bind(entity.season.map(|s| s as i64))
                    .bind(entity.episode.map(|e| e as i64))
                    .bind(entity.date.map(|d| d.format("%Y-%m-%d").to_string()))
                    .fetch_one(&mut *tx)
                    .await?;
                    row.try_get("id")?
                }
                None => release.entity_id.to_string(),
            };

            sqlx::query(
                r#"
                INSERT INTO releases (
                    id, entity_id, title, quality, proper_count, downloaded, first_seen
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (entity_id, quality, proper_count) DO UPDATE SET
                    first_seen = MIN(first_seen, excluded.first_seen)
                "#,
            )
            .bind(release.id.to_string())
            .bind(entity_id)
            .bind(release.title.clone())
            .bind(release.quality.to_string())
            .bind(release.proper_count as i64)
            .bind(release.downloaded)
            .bind(release.first_seen.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for series_id in &mutations.infer_modes {
            let row = sqlx::query("SELECT * FROM series WHERE id = ? LIMIT 1")
                .bind(series_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else { continue };
            let series = row_to_series(&row)?;
            if series.identified_by != IdentifiedBy::Auto {
                continue;
            }
            let rows = sqlx::query("SELECT * FROM series_entities WHERE series_id = ?")
                .bind(series_id.to_string())
                .fetch_all(&mut *tx)
                .await?;
            let mut entities = Vec::with_capacity(rows.len());
            for r in rows {
                entities.push(row_to_entity(&r)?);
            }
            if let Some(mode) = majority_mode(&entities) {
                debug!(
                    target: "state_store",
                    series = %series.name,
                    mode = %mode,
                    "inferred identification mode"
                );
                sqlx::query("UPDATE series SET identified_by = ?, updated_at = ? WHERE id = ?")
                    .bind(mode.to_string())
                    .bind(Utc::now().to_rfc3339())
                    .bind(series_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_downloaded(&self, release_ids: &[ReleaseId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in release_ids {
            sqlx::query("UPDATE releases SET downloaded = 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
