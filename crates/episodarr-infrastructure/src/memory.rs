// SPDX-License-Identifier: GPL-3.0-or-later

//! In-process [`StateStore`] backed by hash maps. Used by the decision
//! pipeline's tests and as a throwaway store for dry runs; behavior must
//! stay interchangeable with the sqlite adapter.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use episodarr_domain::{
    normalize_series_name, EntityId, EntityRef, IdentifiedBy, Release, ReleaseId, Series,
    SeriesEntity, SeriesId,
};
use tracing::{debug, warn};

use crate::state_store::{majority_mode, synthetic_floor, EntityKey, ScanMutations, StateStore};

#[derive(Debug, Default)]
struct Inner {
    series: HashMap<SeriesId, Series>,
    entities: HashMap<EntityId, SeriesEntity>,
    releases: HashMap<ReleaseId, Release>,
}

impl Inner {
    fn series_by_name(&self, name: &str) -> Option<&Series> {
        let normalized = normalize_series_name(name);
        self.series.values().find(|s| {
            s.name_normalized == normalized || s.alternate_names.contains(&normalized)
        })
    }

    fn downloaded(&self, entity_id: EntityId) -> Vec<Release> {
        self.releases
            .values()
            .filter(|r| r.entity_id == entity_id && r.downloaded)
            .cloned()
            .collect()
    }

    fn has_downloaded(&self, entity_id: EntityId) -> bool {
        self.releases
            .values()
            .any(|r| r.entity_id == entity_id && r.downloaded)
    }

    fn apply(&mut self, mutations: ScanMutations) {
        for entity in mutations.new_entities {
            let key = EntityKey::of(&entity);
            let exists = self
                .entities
                .values()
                .any(|e| e.series_id == entity.series_id && key.matches(e));
            if !exists {
                self.entities.insert(entity.id, entity);
            }
        }

        for release in mutations.releases {
            let existing = self
                .releases
                .values()
                .find(|r| {
                    r.entity_id == release.entity_id
                        && r.quality == release.quality
                        && r.proper_count == release.proper_count
                })
                .map(|r| r.id);
            match existing.and_then(|id| self.releases.get_mut(&id)) {
                Some(row) => {
                    if release.first_seen < row.first_seen {
                        row.first_seen = release.first_seen;
                    }
                }
                None => {
                    self.releases.insert(release.id, release);
                }
            }
        }

        for series_id in mutations.infer_modes {
            let entities: Vec<SeriesEntity> = self
                .entities
                .values()
                .filter(|e| e.series_id == series_id)
                .cloned()
                .collect();
            if let Some(series) = self.series.get_mut(&series_id) {
                if series.identified_by == IdentifiedBy::Auto {
                    if let Some(mode) = majority_mode(&entities) {
                        debug!(
                            target: "state_store",
                            series = %series.name,
                            mode = %mode,
                            "inferred identification mode"
                        );
                        series.identified_by = mode;
                        series.updated_at = Utc::now();
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn find_series(&self, name: &str) -> Result<Option<Series>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.series_by_name(name).cloned())
    }

    async fn ensure_series(
        &self,
        name: &str,
        alternate_names: &[String],
        identified_by: IdentifiedBy,
    ) -> Result<Series> {
        let mut inner = self.inner.lock().expect("store lock");

        let normalized_alts: Vec<String> = alternate_names
            .iter()
            .map(|n| normalize_series_name(n))
            .filter(|n| !n.is_empty())
            .collect();

        let id = inner.series_by_name(name).map(|s| s.id);
        let id = match id {
            Some(id) => id,
            None => {
                let series = Series::new(name);
                let id = series.id;
                debug!(target: "state_store", series = %name, "creating series");
                inner.series.insert(id, series);
                id
            }
        };

        // Alternate names are unique across all series; a name already
        // claimed elsewhere is skipped with a warning.
        let claimed: Vec<String> = normalized_alts
            .iter()
            .filter(|&alt| {
                inner
                    .series
                    .values()
                    .any(|s| s.id != id && (s.name_normalized == *alt || s.alternate_names.contains(alt)))
            })
            .cloned()
            .collect();
        for alt in &claimed {
            warn!(
                target: "state_store",
                series = %name,
                alternate_name = %alt,
                "alternate name already claimed by another series; skipping"
            );
        }

        let series = inner
            .series
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("series vanished during ensure"))?;
        series.alternate_names = normalized_alts
            .into_iter()
            .filter(|alt| !claimed.contains(alt))
            .collect();
        if identified_by.is_concrete() {
            series.identified_by = identified_by;
        }
        series.updated_at = Utc::now();
        Ok(series.clone())
    }

    async fn set_begin(&self, series_id: SeriesId, begin: Option<EntityRef>) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(series) = inner.series.get_mut(&series_id) {
            series.begin = begin;
            series.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_entity(
        &self,
        series_id: SeriesId,
        key: &EntityKey,
    ) -> Result<Option<SeriesEntity>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .entities
            .values()
            .find(|e| e.series_id == series_id && key.matches(e))
            .cloned())
    }

    async fn entities(&self, series_id: SeriesId) -> Result<Vec<SeriesEntity>> {
        let inner = self.inner.lock().expect("store lock");
        let mut out: Vec<SeriesEntity> = inner
            .entities
            .values()
            .filter(|e| e.series_id == series_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sort_key());
        Ok(out)
    }

    async fn releases(&self, entity_id: EntityId) -> Result<Vec<Release>> {
        let inner = self.inner.lock().expect("store lock");
        let mut out: Vec<Release> = inner
            .releases
            .values()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.first_seen);
        Ok(out)
    }

    async fn downloaded_releases(&self, entity_id: EntityId) -> Result<Vec<Release>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.downloaded(entity_id))
    }

    async fn completed_seasons(&self, series_id: SeriesId) -> Result<BTreeSet<u32>> {
        let inner = self.inner.lock().expect("store lock");
        let seasons = inner
            .entities
            .values()
            .filter(|e| {
                e.series_id == series_id && e.is_season_pack && inner.has_downloaded(e.id)
            })
            .filter_map(|e| e.season)
            .collect();
        Ok(seasons)
    }

    async fn downloaded_episode_count(&self, series_id: SeriesId, season: u32) -> Result<u32> {
        let inner = self.inner.lock().expect("store lock");
        let count = inner
            .entities
            .values()
            .filter(|e| {
                e.series_id == series_id
                    && !e.is_season_pack
                    && e.season == Some(season)
                    && inner.has_downloaded(e.id)
            })
            .count();
        Ok(count as u32)
    }

    async fn latest_release(&self, series: &Series) -> Result<Option<SeriesEntity>> {
        let inner = self.inner.lock().expect("store lock");
        let latest_downloaded = inner
            .entities
            .values()
            .filter(|e| e.series_id == series.id && inner.has_downloaded(e.id))
            .max_by_key(|e| e.sort_key())
            .cloned();
        let floor = synthetic_floor(series);
        Ok(match (latest_downloaded, floor) {
            (Some(latest), Some(floor)) if floor.sort_key() > latest.sort_key() => Some(floor),
            (Some(latest), _) => Some(latest),
            (None, floor) => floor,
        })
    }

    async fn infer_identified_by(&self, series_id: SeriesId) -> Result<IdentifiedBy> {
        let mut inner = self.inner.lock().expect("store lock");
        let entities: Vec<SeriesEntity> = inner
            .entities
            .values()
            .filter(|e| e.series_id == series_id)
            .cloned()
            .collect();
        let series = inner
            .series
            .get_mut(&series_id)
            .ok_or_else(|| anyhow::anyhow!("unknown series {}", series_id))?;
        if series.identified_by == IdentifiedBy::Auto {
            if let Some(mode) = majority_mode(&entities) {
                series.identified_by = mode;
                series.updated_at = Utc::now();
            }
        }
        Ok(series.identified_by)
    }

    async fn commit_scan(&self, mutations: ScanMutations) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.apply(mutations);
        Ok(())
    }

    async fn mark_downloaded(&self, release_ids: &[ReleaseId]) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        for id in release_ids {
            if let Some(release) = inner.releases.get_mut(id) {
                release.downloaded = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use episodarr_domain::Quality;

    fn release_for(entity: &SeriesEntity, title: &str, quality: &str, proper: u32) -> Release {
        let mut release = Release::new(entity.id, title, Quality::parse(quality));
        release.proper_count = proper;
        release
    }

    #[tokio::test]
    async fn ensure_series_is_idempotent_and_updates_alternates() {
        let store = MemoryStateStore::new();
        let first = store
            .ensure_series("Foo", &["Foo US".to_string()], IdentifiedBy::Auto)
            .await
            .unwrap();
        let second = store
            .ensure_series("foo", &["Foo 2024".to_string()], IdentifiedBy::Ep)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        // Alternate names replaced wholesale, concrete mode sticks.
        assert_eq!(second.alternate_names, vec!["foo 2024"]);
        assert_eq!(second.identified_by, IdentifiedBy::Ep);

        let third = store.ensure_series("Foo", &[], IdentifiedBy::Auto).await.unwrap();
        assert_eq!(third.identified_by, IdentifiedBy::Ep);
    }

    #[tokio::test]
    async fn alternate_name_lookup_and_global_uniqueness() {
        let store = MemoryStateStore::new();
        let foo = store
            .ensure_series("Foo", &["Shared Name".to_string()], IdentifiedBy::Auto)
            .await
            .unwrap();
        let bar = store
            .ensure_series("Bar", &["Shared Name".to_string()], IdentifiedBy::Auto)
            .await
            .unwrap();

        // Second claim is skipped; lookup still resolves to the first.
        assert!(bar.alternate_names.is_empty());
        let found = store.find_series("shared name").await.unwrap().unwrap();
        assert_eq!(found.id, foo.id);
    }

    #[tokio::test]
    async fn record_release_is_idempotent_keeping_earliest_first_seen() {
        let store = MemoryStateStore::new();
        let series = store.ensure_series("Foo", &[], IdentifiedBy::Ep).await.unwrap();
        let entity = SeriesEntity::new_episode(series.id, 1, 1);

        let mut early = release_for(&entity, "Foo.S01E01.720p", "720p", 0);
        early.first_seen = Utc::now() - chrono::Duration::hours(5);
        let late = release_for(&entity, "Foo.S01E01.720p", "720p", 0);

        store
            .commit_scan(ScanMutations {
                new_entities: vec![entity.clone()],
                releases: vec![late],
                infer_modes: vec![],
            })
            .await
            .unwrap();
        store
            .commit_scan(ScanMutations {
                new_entities: vec![entity.clone()],
                releases: vec![early.clone()],
                infer_modes: vec![],
            })
            .await
            .unwrap();

        let releases = store.releases(entity.id).await.unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].first_seen, early.first_seen);
    }

    #[tokio::test]
    async fn completed_seasons_and_episode_counts() {
        let store = MemoryStateStore::new();
        let series = store.ensure_series("Foo", &[], IdentifiedBy::Ep).await.unwrap();
        let pack = SeriesEntity::new_season_pack(series.id, 1);
        let ep = SeriesEntity::new_episode(series.id, 2, 1);
        let pack_release = release_for(&pack, "Foo.S01.720p", "720p", 0);
        let ep_release = release_for(&ep, "Foo.S02E01.720p", "720p", 0);
        let pack_release_id = pack_release.id;
        let ep_release_id = ep_release.id;

        store
            .commit_scan(ScanMutations {
                new_entities: vec![pack.clone(), ep.clone()],
                releases: vec![pack_release, ep_release],
                infer_modes: vec![],
            })
            .await
            .unwrap();

        assert!(store.completed_seasons(series.id).await.unwrap().is_empty());

        store
            .mark_downloaded(&[pack_release_id, ep_release_id])
            .await
            .unwrap();

        let completed = store.completed_seasons(series.id).await.unwrap();
        assert_eq!(completed.into_iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.downloaded_episode_count(series.id, 2).await.unwrap(), 1);
        assert_eq!(store.downloaded_episode_count(series.id, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn latest_release_uses_begin_as_floor() {
        let store = MemoryStateStore::new();
        let series = store.ensure_series("Foo", &[], IdentifiedBy::Ep).await.unwrap();

        assert!(store.latest_release(&series).await.unwrap().is_none());

        store
            .set_begin(series.id, EntityRef::parse_str("S03E01"))
            .await
            .unwrap();
        let series = store.find_series("Foo").await.unwrap().unwrap();
        let floor = store.latest_release(&series).await.unwrap().unwrap();
        assert_eq!(floor.sort_key(), (3, 1));

        // A downloaded episode below the floor does not displace it.
        let ep = SeriesEntity::new_episode(series.id, 1, 1);
        let release = release_for(&ep, "Foo.S01E01.720p", "720p", 0);
        let release_id = release.id;
        store
            .commit_scan(ScanMutations {
                new_entities: vec![ep],
                releases: vec![release],
                infer_modes: vec![],
            })
            .await
            .unwrap();
        store.mark_downloaded(&[release_id]).await.unwrap();

        let latest = store.latest_release(&series).await.unwrap().unwrap();
        assert_eq!(latest.sort_key(), (3, 1));
    }

    #[tokio::test]
    async fn identification_mode_inferred_during_commit() {
        let store = MemoryStateStore::new();
        let series = store.ensure_series("Foo", &[], IdentifiedBy::Auto).await.unwrap();

        let entities = vec![
            SeriesEntity::new_episode(series.id, 1, 1),
            SeriesEntity::new_episode(series.id, 1, 2),
            SeriesEntity::new_episode(series.id, 1, 3),
        ];
        store
            .commit_scan(ScanMutations {
                new_entities: entities,
                releases: vec![],
                infer_modes: vec![series.id],
            })
            .await
            .unwrap();

        let series = store.find_series("Foo").await.unwrap().unwrap();
        assert_eq!(series.identified_by, IdentifiedBy::Ep);
    }
}
