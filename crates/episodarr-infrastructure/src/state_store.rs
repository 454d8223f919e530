// SPDX-License-Identifier: GPL-3.0-or-later

//! State Store contract. The store exclusively owns persistence of Series,
//! SeriesEntity and Release rows; the decision engine only reads snapshots
//! and requests mutations through this API. All writes of one feed scan are
//! applied as a single atomic unit via [`StateStore::commit_scan`].

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use episodarr_domain::{
    EntityId, EntityRef, IdentifiedBy, Release, ReleaseId, Series, SeriesEntity, SeriesId,
};

/// Identity of an entity within a series: season/episode (or date) plus
/// the season-pack flag and identification mode. Two entities with equal
/// keys under the same series are the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub date: Option<NaiveDate>,
    pub is_season_pack: bool,
    pub identified_by: IdentifiedBy,
}

impl EntityKey {
    pub fn of(entity: &SeriesEntity) -> Self {
        Self {
            season: entity.season,
            episode: entity.episode,
            date: entity.date,
            is_season_pack: entity.is_season_pack,
            identified_by: entity.identified_by,
        }
    }

    pub fn matches(&self, entity: &SeriesEntity) -> bool {
        *self == Self::of(entity)
    }
}

/// All writes produced by one feed scan. Either every mutation is persisted
/// or none, so a crash mid-scan never leaves partial state.
#[derive(Debug, Clone, Default)]
pub struct ScanMutations {
    /// Entities first observed during this scan.
    pub new_entities: Vec<SeriesEntity>,
    /// Releases observed during this scan; upserted by the
    /// (entity, quality, proper_count) identity, keeping the earliest
    /// `first_seen`.
    pub releases: Vec<Release>,
    /// Series whose `auto` identification mode should be re-inferred from
    /// history inside the same transaction.
    pub infer_modes: Vec<SeriesId>,
}

impl ScanMutations {
    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty() && self.releases.is_empty() && self.infer_modes.is_empty()
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Look up a series by display name, normalized name or alternate name.
    async fn find_series(&self, name: &str) -> Result<Option<Series>>;

    /// Idempotent create-or-update. Replaces the alternate-name set
    /// wholesale; a concrete `identified_by` hint overrides, an `auto` hint
    /// never downgrades an already-concrete mode.
    async fn ensure_series(
        &self,
        name: &str,
        alternate_names: &[String],
        identified_by: IdentifiedBy,
    ) -> Result<Series>;

    async fn set_begin(&self, series_id: SeriesId, begin: Option<EntityRef>) -> Result<()>;

    async fn find_entity(
        &self,
        series_id: SeriesId,
        key: &EntityKey,
    ) -> Result<Option<SeriesEntity>>;

    async fn entities(&self, series_id: SeriesId) -> Result<Vec<SeriesEntity>>;

    /// Every release observed for an entity, downloaded or not.
    async fn releases(&self, entity_id: EntityId) -> Result<Vec<Release>>;

    async fn downloaded_releases(&self, entity_id: EntityId) -> Result<Vec<Release>>;

    /// Seasons for which a season-pack release was downloaded.
    async fn completed_seasons(&self, series_id: SeriesId) -> Result<BTreeSet<u32>>;

    /// Number of individual (non-pack) episodes of a season with a
    /// downloaded release; feeds the season-pack threshold policy.
    async fn downloaded_episode_count(&self, series_id: SeriesId, season: u32) -> Result<u32>;

    /// The most advanced entity with at least one downloaded release,
    /// with the series' `begin` acting as a synthetic floor when it is
    /// ahead of everything downloaded.
    async fn latest_release(&self, series: &Series) -> Result<Option<SeriesEntity>>;

    /// Majority vote over the series' entities; persists and returns the
    /// winner when the series is still `auto` and enough history exists.
    async fn infer_identified_by(&self, series_id: SeriesId) -> Result<IdentifiedBy>;

    /// Apply one scan's mutations atomically.
    async fn commit_scan(&self, mutations: ScanMutations) -> Result<()>;

    /// Learn step: flip `downloaded` on the given releases.
    async fn mark_downloaded(&self, release_ids: &[ReleaseId]) -> Result<()>;
}

/// Build the synthetic floor entity for a series' `begin` cutoff, used by
/// `latest_release` when nothing downloaded is ahead of it.
pub fn synthetic_floor(series: &Series) -> Option<SeriesEntity> {
    let begin = series.begin?;
    let entity = match begin {
        EntityRef::Episode { season, episode } => {
            SeriesEntity::new_episode(series.id, season, episode)
        }
        EntityRef::Date(date) => SeriesEntity::new_date(series.id, date),
        EntityRef::Sequence(number) => SeriesEntity::new_sequence(series.id, number),
    };
    Some(entity)
}

/// Majority vote over entity identification modes with a deterministic
/// tie-break: highest count first, then mode name ascending. Specials do
/// not vote. Returns `None` below the minimum history size.
pub fn majority_mode(entities: &[SeriesEntity]) -> Option<IdentifiedBy> {
    const MIN_ENTITIES: usize = 3;

    let votes: Vec<IdentifiedBy> = entities
        .iter()
        .map(|e| e.identified_by)
        .filter(|m| m.is_concrete() && *m != IdentifiedBy::Special)
        .collect();
    if votes.len() < MIN_ENTITIES {
        return None;
    }

    let mut counts: Vec<(IdentifiedBy, usize)> = Vec::new();
    for vote in votes {
        match counts.iter_mut().find(|(mode, _)| *mode == vote) {
            Some((_, count)) => *count += 1,
            None => counts.push((vote, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.to_string().cmp(&b.0.to_string())));
    counts.first().map(|(mode, _)| *mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_mode_requires_history() {
        let series = SeriesId::new();
        let few = vec![
            SeriesEntity::new_episode(series, 1, 1),
            SeriesEntity::new_episode(series, 1, 2),
        ];
        assert_eq!(majority_mode(&few), None);
    }

    #[test]
    fn majority_mode_picks_most_common() {
        let series = SeriesId::new();
        let entities = vec![
            SeriesEntity::new_episode(series, 1, 1),
            SeriesEntity::new_episode(series, 1, 2),
            SeriesEntity::new_sequence(series, 3),
            SeriesEntity::new_episode(series, 1, 3),
        ];
        assert_eq!(majority_mode(&entities), Some(IdentifiedBy::Ep));
    }

    #[test]
    fn majority_mode_tie_breaks_by_name() {
        let series = SeriesId::new();
        let entities = vec![
            SeriesEntity::new_episode(series, 1, 1),
            SeriesEntity::new_episode(series, 1, 2),
            SeriesEntity::new_sequence(series, 1),
            SeriesEntity::new_sequence(series, 2),
        ];
        // Two votes each; "ep" < "sequence".
        assert_eq!(majority_mode(&entities), Some(IdentifiedBy::Ep));
    }

    #[test]
    fn majority_mode_ignores_specials() {
        let series = SeriesId::new();
        let entities = vec![
            SeriesEntity::new_special(series, Some(0), Some(1)),
            SeriesEntity::new_special(series, Some(0), Some(2)),
            SeriesEntity::new_special(series, Some(0), Some(3)),
            SeriesEntity::new_episode(series, 1, 1),
        ];
        assert_eq!(majority_mode(&entities), None);
    }

    #[test]
    fn synthetic_floor_mirrors_begin() {
        let mut series = Series::new("Foo");
        assert!(synthetic_floor(&series).is_none());

        series.begin = EntityRef::parse_str("S03E01");
        let floor = synthetic_floor(&series).unwrap();
        assert_eq!(floor.sort_key(), (3, 1));
        assert_eq!(floor.series_id, series.id);
    }
}
