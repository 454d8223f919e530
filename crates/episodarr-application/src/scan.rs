// SPDX-License-Identifier: GPL-3.0-or-later

//! One feed scan end to end: parse every title per configured series,
//! group candidates by entity, drive the decision pipeline, and commit
//! all writes atomically. The learn step lives here too, as a separate
//! phase run only after accepted candidates were actually delivered.

use anyhow::Result;
use chrono::Utc;
use episodarr_config::SeriesSettings;
use episodarr_domain::{
    EntityRef, IdentifiedBy, ParsedRelease, Release, ReleaseId, Series, SeriesEntity,
};
use episodarr_infrastructure::{EntityKey, ScanMutations, StateStore};
use tracing::{debug, info, warn};

use crate::adapters::{BacklogAdapter, ParseOptions, ParsingAdapter};
use crate::engine::{decide, Candidate, EngineError, EntityContext, RunState};

/// One recorded decision, ready for display or logging.
#[derive(Debug, Clone)]
pub struct ScanDecision {
    pub series: String,
    pub entity: String,
    pub title: String,
    pub reason: String,
    pub release_id: ReleaseId,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub accepted: Vec<ScanDecision>,
    pub rejected: Vec<ScanDecision>,
    pub deferred: u32,
    /// Per-series configuration errors; the scan continues with the
    /// remaining series.
    pub errors: Vec<(String, String)>,
}

pub async fn run_scan(
    titles: &[String],
    series_settings: &[(String, SeriesSettings)],
    parser: &dyn ParsingAdapter,
    store: &dyn StateStore,
    backlog: &dyn BacklogAdapter,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut mutations = ScanMutations::default();
    let mut run = RunState::default();

    for (name, settings) in series_settings {
        let mut series = store
            .ensure_series(name, &settings.alternate_names, settings.identified_by)
            .await?;

        if let Some(err) = apply_begin(store, &mut series, settings).await? {
            warn!(target: "scan", series = %series.name, error = %err, "skipping series");
            report.errors.push((series.name.clone(), err.to_string()));
            continue;
        }

        let options = ParseOptions {
            identified_by: series.identified_by,
            alternate_names: settings.alternate_names.clone(),
            name_regexps: settings.name_regexps.clone(),
            strict_name: settings.exact.unwrap_or(false),
            allow_groups: settings.allow_groups.clone(),
        };

        let mut groups: Vec<EntityGroup> = Vec::new();
        for title in titles {
            let parsed = parser.parse(title, &series.name, &options);
            if !parsed.valid {
                continue;
            }
            if !group_allowed(settings, &parsed) {
                debug!(
                    target: "scan",
                    series = %series.name,
                    title = %title,
                    "release group not allowed; skipping"
                );
                continue;
            }
            for prototype in entities_of(&series, &parsed) {
                collect_candidate(store, &mut groups, prototype, title, &parsed).await?;
            }
        }

        // Season packs first, highest season first; then episodes in
        // ascending order.
        groups.sort_by(|a, b| {
            use std::cmp::Ordering;
            match (a.entity.is_season_pack, b.entity.is_season_pack) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (true, true) => b.entity.sort_key().cmp(&a.entity.sort_key()),
                (false, false) => a.entity.sort_key().cmp(&b.entity.sort_key()),
            }
        });

        let latest_downloaded = store.latest_release(&series).await?;
        let completed_seasons = store.completed_seasons(series.id).await?;

        for group in groups {
            let EntityGroup {
                entity,
                candidates,
                is_new,
            } = group;

            let downloaded = if is_new {
                Vec::new()
            } else {
                store.downloaded_releases(entity.id).await?
            };
            let downloaded_in_season = match (entity.is_season_pack, entity.season) {
                (true, Some(season)) => store.downloaded_episode_count(series.id, season).await?,
                _ => 0,
            };

            let ctx = EntityContext {
                series: &series,
                entity: &entity,
                settings,
                downloaded,
                latest_downloaded: latest_downloaded.clone(),
                completed_seasons: completed_seasons.clone(),
                downloaded_in_season,
                now: Utc::now(),
            };
            run.note_entity();

            for candidate in &candidates {
                mutations.releases.push(candidate.release.clone());
            }
            if is_new {
                mutations.new_entities.push(entity.clone());
            }

            let outcome = decide(&ctx, candidates, &mut run);
            for (candidate, decision) in outcome.decisions {
                let record = ScanDecision {
                    series: series.name.clone(),
                    entity: entity.identifier(),
                    title: candidate.release.title.clone(),
                    reason: decision.reason().to_string(),
                    release_id: candidate.release.id,
                };
                if decision.is_accept() {
                    report.accepted.push(record);
                } else {
                    report.rejected.push(record);
                }
            }
            if let Some(candidate) = outcome.deferred {
                backlog.add(&candidate, &series.name);
                report.deferred += 1;
            }
        }

        if series.identified_by == IdentifiedBy::Auto {
            mutations.infer_modes.push(series.id);
        }
    }

    store.commit_scan(mutations).await?;
    info!(
        target: "scan",
        accepted = report.accepted.len(),
        rejected = report.rejected.len(),
        deferred = report.deferred,
        errors = report.errors.len(),
        "scan complete"
    );
    Ok(report)
}

/// Flip `downloaded` for releases confirmed delivered downstream.
/// Completed seasons follow from downloaded season-pack releases.
pub async fn learn(store: &dyn StateStore, accepted: &[ReleaseId]) -> Result<()> {
    info!(target: "scan", count = accepted.len(), "learning delivered releases");
    store.mark_downloaded(accepted).await
}

struct EntityGroup {
    entity: SeriesEntity,
    candidates: Vec<Candidate>,
    is_new: bool,
}

/// Resolve the begin setting against the store. A malformed value is a
/// per-series error returned as `Some`; a mode mismatch clears the begin
/// with a warning.
async fn apply_begin(
    store: &dyn StateStore,
    series: &mut Series,
    settings: &SeriesSettings,
) -> Result<Option<EngineError>> {
    let Some(text) = &settings.begin else {
        return Ok(None);
    };
    let Some(begin) = EntityRef::parse_str(text) else {
        return Ok(Some(EngineError::InvalidBegin {
            series: series.name.clone(),
            value: text.clone(),
        }));
    };
    if series.identified_by.is_concrete() && begin.kind() != series.identified_by {
        warn!(
            target: "scan",
            series = %series.name,
            begin = %begin,
            mode = %series.identified_by,
            "begin does not match identification mode; clearing"
        );
        store.set_begin(series.id, None).await?;
        series.begin = None;
        return Ok(None);
    }
    store.set_begin(series.id, Some(begin)).await?;
    series.begin = Some(begin);
    Ok(None)
}

fn group_allowed(settings: &SeriesSettings, parsed: &ParsedRelease) -> bool {
    if settings.allow_groups.is_empty() {
        return true;
    }
    parsed.group.as_deref().is_some_and(|group| {
        settings
            .allow_groups
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(group))
    })
}

/// A multi-episode title expands to one entity per episode.
fn entities_of(series: &Series, parsed: &ParsedRelease) -> Vec<SeriesEntity> {
    if parsed.id_kind == IdentifiedBy::Special {
        return vec![SeriesEntity::new_special(
            series.id,
            parsed.season,
            parsed.episodes.first().copied(),
        )];
    }
    if parsed.season_pack {
        return parsed
            .season
            .map(|season| vec![SeriesEntity::new_season_pack(series.id, season)])
            .unwrap_or_default();
    }
    if let Some(date) = parsed.date {
        return vec![SeriesEntity::new_date(series.id, date)];
    }
    if let Some(number) = parsed.sequence {
        return vec![SeriesEntity::new_sequence(series.id, number)];
    }
    match parsed.season {
        Some(season) => parsed
            .episodes
            .iter()
            .map(|&episode| SeriesEntity::new_episode(series.id, season, episode))
            .collect(),
        None => Vec::new(),
    }
}

async fn collect_candidate(
    store: &dyn StateStore,
    groups: &mut Vec<EntityGroup>,
    prototype: SeriesEntity,
    title: &str,
    parsed: &ParsedRelease,
) -> Result<()> {
    let key = EntityKey::of(&prototype);
    let position = groups.iter().position(|g| key.matches(&g.entity));
    let index = match position {
        Some(index) => index,
        None => {
            let (entity, is_new) = match store.find_entity(prototype.series_id, &key).await? {
                Some(existing) => (existing, false),
                None => (prototype, true),
            };
            groups.push(EntityGroup {
                entity,
                candidates: Vec::new(),
                is_new,
            });
            groups.len() - 1
        }
    };

    let group = &mut groups[index];
    let mut release = Release::new(group.entity.id, title, parsed.quality);
    release.proper_count = parsed.proper_count;
    if !group.is_new {
        // Keep the earliest sighting so timeframe windows survive restarts.
        let known = store.releases(group.entity.id).await?;
        if let Some(existing) = known
            .iter()
            .find(|r| r.quality == release.quality && r.proper_count == release.proper_count)
        {
            release.id = existing.id;
            release.first_seen = existing.first_seen;
            release.downloaded = existing.downloaded;
        }
    }
    group.candidates.push(Candidate::new(release));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NullBacklog;
    use episodarr_domain::Quality;
    use episodarr_infrastructure::MemoryStateStore;
    use std::sync::Mutex;

    /// Understands `<Name>.SxxEyy.<quality tokens>[.PROPER]` and
    /// `<Name>.Sxx.<quality tokens>` titles.
    struct FakeParser;

    impl ParsingAdapter for FakeParser {
        fn parse(&self, title: &str, series_name: &str, _options: &ParseOptions) -> ParsedRelease {
            let tokens: Vec<&str> = title.split('.').collect();
            let marker = tokens.iter().position(|t| {
                t.len() >= 2
                    && t.starts_with('S')
                    && t[1..].chars().all(|c| c.is_ascii_digit() || c == 'E')
            });
            let Some(marker) = marker else {
                return ParsedRelease::invalid(series_name);
            };
            let name = tokens[..marker].join(" ");
            if !name.eq_ignore_ascii_case(series_name) {
                return ParsedRelease::invalid(series_name);
            }

            let identifier = tokens[marker];
            let rest = &tokens[marker + 1..];
            let proper_count = rest.iter().filter(|t| *t == &"PROPER").count() as u32;
            let quality = Quality::parse(&rest.join(" "));

            let mut parsed = ParsedRelease::invalid(series_name);
            parsed.series_name = name;
            parsed.quality = quality;
            parsed.proper_count = proper_count;
            parsed.id_kind = IdentifiedBy::Ep;
            parsed.valid = true;
            match identifier[1..].split_once('E') {
                Some((season, episode)) => {
                    parsed.season = season.parse().ok();
                    parsed.episodes = episode.parse().ok().into_iter().collect();
                    if parsed.season.is_none() || parsed.episodes.is_empty() {
                        return ParsedRelease::invalid(series_name);
                    }
                }
                None => {
                    parsed.season = identifier[1..].parse().ok();
                    parsed.season_pack = true;
                    if parsed.season.is_none() {
                        return ParsedRelease::invalid(series_name);
                    }
                }
            }
            parsed
        }
    }

    #[derive(Default)]
    struct RecordingBacklog {
        items: Mutex<Vec<String>>,
    }

    impl BacklogAdapter for RecordingBacklog {
        fn add(&self, candidate: &Candidate, series_scope: &str) {
            self.items
                .lock()
                .unwrap()
                .push(format!("{}: {}", series_scope, candidate.release.title));
        }
    }

    fn settings() -> SeriesSettings {
        SeriesSettings::default()
    }

    #[tokio::test]
    async fn scan_accepts_matching_quality_and_learns() {
        let store = MemoryStateStore::new();
        let mut s = settings();
        s.quality = Some(episodarr_domain::Requirement::parse("720p").unwrap());
        let config = vec![("Foo".to_string(), s)];
        let titles = vec![
            "Foo.S01E01.720p".to_string(),
            "Foo.S01E01.1080p".to_string(),
        ];

        let report = run_scan(&titles, &config, &FakeParser, &store, &NullBacklog)
            .await
            .unwrap();

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].title, "Foo.S01E01.720p");
        assert_eq!(report.rejected.len(), 1);

        let accepted_ids: Vec<ReleaseId> =
            report.accepted.iter().map(|d| d.release_id).collect();
        learn(&store, &accepted_ids).await.unwrap();

        // The next run sees the download and rejects both qualities.
        let report = run_scan(&titles, &config, &FakeParser, &store, &NullBacklog)
            .await
            .unwrap();
        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected.len(), 2);
    }

    #[tokio::test]
    async fn season_pack_processed_first_claims_the_season() {
        let store = MemoryStateStore::new();
        let mut s = settings();
        s.season_packs = episodarr_config::SeasonPackPolicy::On;
        let config = vec![("Foo".to_string(), s)];
        // Episode listed before the pack; ordering still favors the pack.
        let titles = vec!["Foo.S01E02.720p".to_string(), "Foo.S01.720p".to_string()];

        let report = run_scan(&titles, &config, &FakeParser, &store, &NullBacklog)
            .await
            .unwrap();

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].title, "Foo.S01.720p");
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0]
            .reason
            .contains("already accepted season pack"));
    }

    #[tokio::test]
    async fn invalid_begin_skips_only_that_series() {
        let store = MemoryStateStore::new();
        let mut bad = settings();
        bad.begin = Some("not-a-begin".to_string());
        let config = vec![
            ("Foo".to_string(), bad),
            ("Bar".to_string(), settings()),
        ];
        let titles = vec!["Foo.S01E01.720p".to_string(), "Bar.S01E01.720p".to_string()];

        let report = run_scan(&titles, &config, &FakeParser, &store, &NullBacklog)
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "Foo");
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].series, "Bar");
    }

    #[tokio::test]
    async fn begin_mode_mismatch_is_cleared_with_warning() {
        let store = MemoryStateStore::new();
        let mut s = settings();
        s.identified_by = IdentifiedBy::Ep;
        s.begin = Some("2024-01-05".to_string());
        let config = vec![("Foo".to_string(), s)];
        let titles = vec!["Foo.S01E01.720p".to_string()];

        let report = run_scan(&titles, &config, &FakeParser, &store, &NullBacklog)
            .await
            .unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.accepted.len(), 1);
        let series = store.find_series("Foo").await.unwrap().unwrap();
        assert!(series.begin.is_none());
    }

    #[tokio::test]
    async fn timeframe_defers_to_backlog_and_persists_sighting() {
        let store = MemoryStateStore::new();
        let backlog = RecordingBacklog::default();
        let mut s = settings();
        s.target = Some(episodarr_domain::Requirement::parse("1080p").unwrap());
        s.timeframe = Some(chrono::Duration::hours(6));
        let config = vec![("Foo".to_string(), s)];
        let titles = vec!["Foo.S01E01.720p".to_string()];

        let report = run_scan(&titles, &config, &FakeParser, &store, &backlog)
            .await
            .unwrap();

        assert_eq!(report.deferred, 1);
        assert!(report.accepted.is_empty());
        assert_eq!(
            backlog.items.lock().unwrap().as_slice(),
            &["Foo: Foo.S01E01.720p".to_string()]
        );

        // The sighting was committed, so the window keeps counting from
        // the first run.
        let series = store.find_series("Foo").await.unwrap().unwrap();
        let entities = store.entities(series.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(store.releases(entities[0].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn proper_upgrade_across_runs() {
        let store = MemoryStateStore::new();
        let config = vec![("Foo".to_string(), settings())];

        let first = run_scan(
            &["Foo.S01E01.720p".to_string()],
            &config,
            &FakeParser,
            &store,
            &NullBacklog,
        )
        .await
        .unwrap();
        let ids: Vec<ReleaseId> = first.accepted.iter().map(|d| d.release_id).collect();
        assert_eq!(ids.len(), 1);
        learn(&store, &ids).await.unwrap();

        let second = run_scan(
            &["Foo.S01E01.720p.PROPER".to_string()],
            &config,
            &FakeParser,
            &store,
            &NullBacklog,
        )
        .await
        .unwrap();
        assert_eq!(second.accepted.len(), 1);
        assert_eq!(second.accepted[0].reason, "proper");
    }

    #[tokio::test]
    async fn learned_pack_completes_the_season() {
        let store = MemoryStateStore::new();
        let mut s = settings();
        s.season_packs = episodarr_config::SeasonPackPolicy::On;
        let config = vec![("Foo".to_string(), s)];

        let report = run_scan(
            &["Foo.S01.720p".to_string()],
            &config,
            &FakeParser,
            &store,
            &NullBacklog,
        )
        .await
        .unwrap();
        let ids: Vec<ReleaseId> = report.accepted.iter().map(|d| d.release_id).collect();
        learn(&store, &ids).await.unwrap();

        let series = store.find_series("Foo").await.unwrap().unwrap();
        let completed = store.completed_seasons(series.id).await.unwrap();
        assert!(completed.contains(&1));

        // Individual episodes of the completed season are now rejected.
        let report = run_scan(
            &["Foo.S01E03.720p".to_string()],
            &config,
            &FakeParser,
            &store,
            &NullBacklog,
        )
        .await
        .unwrap();
        assert!(report.accepted.is_empty());
        assert!(report.rejected[0]
            .reason
            .contains("already downloaded as a season pack"));
    }

    #[tokio::test]
    async fn multi_episode_title_expands_to_separate_entities() {
        let store = MemoryStateStore::new();
        let config = vec![("Foo".to_string(), settings())];

        // Two distinct episode titles share a run; both are accepted and
        // become separate entities.
        let report = run_scan(
            &["Foo.S01E01.720p".to_string(), "Foo.S01E02.720p".to_string()],
            &config,
            &FakeParser,
            &store,
            &NullBacklog,
        )
        .await
        .unwrap();
        assert_eq!(report.accepted.len(), 2);

        let series = store.find_series("Foo").await.unwrap().unwrap();
        assert_eq!(store.entities(series.id).await.unwrap().len(), 2);
    }
}
