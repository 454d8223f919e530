// SPDX-License-Identifier: GPL-3.0-or-later

//! The per-entity decision pipeline. Candidates for one entity run through
//! twelve ordered filters; the first filter that empties the list ends
//! processing, and every removal carries a reason. The pipeline is pure:
//! it reads a snapshot assembled by the caller and emits decisions without
//! touching persistence.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use episodarr_config::{ProperPolicy, SeriesSettings, TrackingPolicy};
use episodarr_domain::{IdentifiedBy, Quality, Release, Series, SeriesEntity, SeriesId};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("series '{series}': invalid begin value '{value}'")]
    InvalidBegin { series: String, value: String },
}

/// Terminal outcome for one candidate in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(String),
    Reject(String),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Accept(reason) | Self::Reject(reason) => reason,
        }
    }
}

/// One feed title resolved to an entity, carrying its would-be release
/// row. `release.first_seen` is the earliest sighting across runs when
/// the release was already known.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub release: Release,
}

impl Candidate {
    pub fn new(release: Release) -> Self {
        Self { release }
    }

    fn quality(&self) -> Quality {
        self.release.quality
    }

    fn rank(&self) -> (Quality, u32) {
        (self.release.quality, self.release.proper_count)
    }
}

/// Snapshot of everything the pipeline may consult for one entity.
#[derive(Debug)]
pub struct EntityContext<'a> {
    pub series: &'a Series,
    pub entity: &'a SeriesEntity,
    pub settings: &'a SeriesSettings,
    /// Releases already downloaded for this entity.
    pub downloaded: Vec<Release>,
    /// Most advanced entity of the series with a downloaded release,
    /// `begin` considered as a synthetic floor.
    pub latest_downloaded: Option<SeriesEntity>,
    /// Seasons fully downloaded via season pack.
    pub completed_seasons: BTreeSet<u32>,
    /// Individually downloaded episodes of this entity's season.
    pub downloaded_in_season: u32,
    pub now: DateTime<Utc>,
}

/// Mutable state shared by all entities of one run.
#[derive(Debug, Default)]
pub struct RunState {
    /// `(series, season)` pairs for which a season pack was accepted
    /// earlier in this run.
    pub accepted_packs: HashSet<(SeriesId, u32)>,
    /// Distinct entities processed so far, including the current one.
    pub entities_seen: u32,
}

impl RunState {
    pub fn note_entity(&mut self) {
        self.entities_seen += 1;
    }

    fn grace(&self) -> i64 {
        i64::from(self.entities_seen) + 2
    }
}

/// Result of one entity's pipeline run. Candidates absent from
/// `decisions` were deliberately left open for a later run.
#[derive(Debug, Default)]
pub struct EntityOutcome {
    pub decisions: Vec<(Candidate, Decision)>,
    pub undecided: Vec<Candidate>,
    /// Best remaining candidate when a timeframe is still open; the
    /// caller forwards it to the backlog.
    pub deferred: Option<Candidate>,
}

impl EntityOutcome {
    pub fn accepted(&self) -> impl Iterator<Item = &Candidate> {
        self.decisions
            .iter()
            .filter(|(_, d)| d.is_accept())
            .map(|(c, _)| c)
    }

    fn has_accept(&self) -> bool {
        self.decisions.iter().any(|(_, d)| d.is_accept())
    }

    fn reject_all(&mut self, candidates: Vec<Candidate>, reason: String) {
        for candidate in candidates {
            self.decisions.push((candidate, Decision::Reject(reason.clone())));
        }
    }
}

/// Run the filter pipeline for one entity's candidates.
pub fn decide(
    ctx: &EntityContext<'_>,
    candidates: Vec<Candidate>,
    run: &mut RunState,
) -> EntityOutcome {
    let outcome = run_filters(ctx, candidates, run);

    if ctx.entity.is_season_pack && outcome.has_accept() {
        if let Some(season) = ctx.entity.season {
            run.accepted_packs.insert((ctx.series.id, season));
        }
    }

    for (candidate, decision) in &outcome.decisions {
        debug!(
            target: "engine",
            series = %ctx.series.name,
            entity = %ctx.entity.identifier(),
            title = %candidate.release.title,
            accept = decision.is_accept(),
            reason = decision.reason(),
            "decided"
        );
    }
    outcome
}

fn run_filters(
    ctx: &EntityContext<'_>,
    candidates: Vec<Candidate>,
    run: &mut RunState,
) -> EntityOutcome {
    let mut out = EntityOutcome::default();
    if candidates.is_empty() {
        return out;
    }
    let settings = ctx.settings;
    let entity = ctx.entity;

    // 1. An accepted season pack claims its whole season for this run.
    if let Some(season) = entity.season {
        if run.accepted_packs.contains(&(ctx.series.id, season)) {
            out.reject_all(
                candidates,
                format!("already accepted season pack for season {} in this task", season),
            );
            return out;
        }
    }

    // 2. Season-pack policy.
    if entity.is_season_pack && !settings.season_packs.packs_allowed() {
        out.reject_all(candidates, "season packs disabled".to_string());
        return out;
    }
    if !entity.is_season_pack && !settings.season_packs.episodes_allowed() {
        out.reject_all(candidates, "season pack only mode".to_string());
        return out;
    }

    // 3. Begin cutoff.
    if let Some(begin) = &ctx.series.begin {
        if entity.is_before(begin) {
            out.reject_all(
                candidates,
                format!("{} is before begin {}", entity.identifier(), begin),
            );
            return out;
        }
    }

    // 4. Specials gate: no decision either way.
    if !settings.specials && entity.identified_by == IdentifiedBy::Special {
        debug!(
            target: "engine",
            series = %ctx.series.name,
            entity = %entity.identifier(),
            "specials disabled; leaving candidates undecided"
        );
        out.undecided = candidates;
        return out;
    }

    let mut remaining = candidates;
    // Acceptances pending the tracking check in filter 10.
    let mut tentative: Vec<(Candidate, String)> = Vec::new();

    // 5. Quality filter.
    if let Some(req) = &settings.quality {
        let (keep, dropped): (Vec<_>, Vec<_>) =
            remaining.into_iter().partition(|c| req.allows(&c.quality()));
        for candidate in dropped {
            let reason = format!(
                "quality {} does not satisfy {}",
                candidate.quality(),
                req.text()
            );
            out.decisions.push((candidate, Decision::Reject(reason)));
        }
        remaining = keep;
        if remaining.is_empty() {
            return out;
        }
    }

    // 6. Propers. Within each quality only the highest proper count
    // survives; an improving proper over a downloaded release of the same
    // quality is accepted immediately, subject to the proper policy.
    let mut best_pc: BTreeMap<Quality, u32> = BTreeMap::new();
    for candidate in &remaining {
        let entry = best_pc.entry(candidate.quality()).or_insert(0);
        *entry = (*entry).max(candidate.release.proper_count);
    }
    let (keep, nuked): (Vec<_>, Vec<_>) = remaining
        .into_iter()
        .partition(|c| c.release.proper_count == best_pc[&c.quality()]);
    for candidate in nuked {
        out.decisions
            .push((candidate, Decision::Reject("superseded by a better proper".to_string())));
    }
    remaining = keep;
    if remaining.is_empty() {
        return out;
    }

    if settings.propers != ProperPolicy::Off {
        let mut downloaded_pc: BTreeMap<Quality, u32> = BTreeMap::new();
        for release in &ctx.downloaded {
            let entry = downloaded_pc.entry(release.quality).or_insert(0);
            *entry = (*entry).max(release.proper_count);
        }
        let mut still = Vec::new();
        for candidate in remaining {
            let improving = downloaded_pc
                .get(&candidate.quality())
                .map(|&pc| candidate.release.proper_count > pc)
                .unwrap_or(false);
            if !improving {
                still.push(candidate);
                continue;
            }
            match settings.propers {
                ProperPolicy::Window(window) if ctx.now - entity.first_seen > window => {
                    out.decisions.push((
                        candidate,
                        Decision::Reject("proper window expired".to_string()),
                    ));
                }
                _ => {
                    out.decisions
                        .push((candidate, Decision::Accept("proper".to_string())));
                }
            }
        }
        remaining = still;
        if remaining.is_empty() {
            return out;
        }
    }

    // 7. Exact quality already downloaded.
    let downloaded_qualities: BTreeSet<Quality> =
        ctx.downloaded.iter().map(|r| r.quality).collect();
    let (keep, dupes): (Vec<_>, Vec<_>) = remaining
        .into_iter()
        .partition(|c| !downloaded_qualities.contains(&c.quality()));
    for candidate in dupes {
        let reason = format!("quality {} already downloaded", candidate.quality());
        out.decisions.push((candidate, Decision::Reject(reason)));
    }
    remaining = keep;
    if remaining.is_empty() {
        return out;
    }

    // 8. Upgrade mode never regresses.
    let best_downloaded = ctx.downloaded.iter().map(|r| r.quality).max();
    if settings.upgrade {
        if let Some(best) = best_downloaded {
            let (keep, regressions): (Vec<_>, Vec<_>) =
                remaining.into_iter().partition(|c| c.quality() > best);
            for candidate in regressions {
                let reason = format!("not an upgrade over {}", best);
                out.decisions.push((candidate, Decision::Reject(reason)));
            }
            remaining = keep;
            if remaining.is_empty() {
                return out;
            }
        }
    }

    // 9. Configuration branch.
    let gated = settings.target.is_some() || !settings.qualities.is_empty();
    if let Some(target) = &settings.target {
        if ctx.downloaded.iter().any(|r| target.allows(&r.quality)) {
            let reason = format!("target quality {} already reached", target.text());
            out.reject_all(std::mem::take(&mut remaining), reason);
            return out;
        }
        if let Some(pos) = remaining.iter().position(|c| target.allows(&c.quality())) {
            let chosen = remaining.remove(pos);
            tentative.push((chosen, format!("meets target quality {}", target.text())));
            for candidate in remaining.drain(..) {
                let reason = if target.allows(&candidate.quality()) {
                    format!("target quality {} already reached", target.text())
                } else {
                    format!("does not match target {}", target.text())
                };
                out.decisions.push((candidate, Decision::Reject(reason)));
            }
        } else if settings.timeframe.is_none() {
            let reason = format!("does not match target {}", target.text());
            out.reject_all(std::mem::take(&mut remaining), reason);
            return out;
        }
        // No match with a timeframe configured: filter 11 decides.
    } else if !settings.qualities.is_empty() {
        let mut fulfilled: Vec<bool> = settings
            .qualities
            .iter()
            .map(|req| ctx.downloaded.iter().any(|r| req.allows(&r.quality)))
            .collect();
        let mut still = Vec::new();
        for candidate in remaining {
            let wanted = settings
                .qualities
                .iter()
                .enumerate()
                .find(|(i, req)| !fulfilled[*i] && req.allows(&candidate.quality()));
            match wanted {
                Some((i, req)) => {
                    fulfilled[i] = true;
                    tentative.push((candidate, format!("wanted quality {}", req.text())));
                }
                None => still.push(candidate),
            }
        }
        remaining = still;
        if settings.timeframe.is_none() {
            out.reject_all(
                std::mem::take(&mut remaining),
                "no unfulfilled wanted quality".to_string(),
            );
        }
    } else if settings.upgrade && best_downloaded.is_some() {
        if !remaining.is_empty() {
            let chosen = remaining.remove(best_index(&remaining));
            let reason = match best_downloaded {
                Some(best) => format!("upgrade over {}", best),
                None => "upgrade".to_string(),
            };
            tentative.push((chosen, reason));
            out.reject_all(
                std::mem::take(&mut remaining),
                "a better candidate was accepted".to_string(),
            );
        }
    } else if !ctx.downloaded.is_empty() {
        out.reject_all(std::mem::take(&mut remaining), "already downloaded".to_string());
        return out;
    }

    // 10. Episode tracking overrides anything accepted in filter 9.
    if let Some(reason) = tracking_violation(ctx, run) {
        for (candidate, _) in tentative.drain(..) {
            out.decisions.push((candidate, Decision::Reject(reason.clone())));
        }
        out.reject_all(std::mem::take(&mut remaining), reason);
        return out;
    }

    // 11. Timeframe: defer while the window is open, lift the quality
    // restriction once it expires.
    let any_accept = out.has_accept() || !tentative.is_empty();
    let mut lifted = false;
    if gated && !any_accept && !remaining.is_empty() {
        if let Some(window) = settings.timeframe {
            let first_seen = remaining
                .iter()
                .map(|c| c.release.first_seen)
                .min()
                .unwrap_or(ctx.now);
            if ctx.now - first_seen < window {
                let best = remaining.remove(best_index(&remaining));
                debug!(
                    target: "engine",
                    series = %ctx.series.name,
                    entity = %entity.identifier(),
                    title = %best.release.title,
                    "timeframe open; deferring to backlog"
                );
                out.deferred = Some(best);
                out.undecided.extend(remaining);
                return out;
            }
            debug!(
                target: "engine",
                series = %ctx.series.name,
                entity = %entity.identifier(),
                "timeframe expired; lifting quality restriction"
            );
            lifted = true;
        }
    }

    // 12. Fallback acceptance.
    if !any_accept && !remaining.is_empty() && (!gated || lifted) {
        let chosen = remaining.remove(best_index(&remaining));
        tentative.push((chosen, "choosing first acceptable match".to_string()));
        out.reject_all(
            std::mem::take(&mut remaining),
            "a better candidate was accepted".to_string(),
        );
    }

    for (candidate, reason) in tentative {
        out.decisions.push((candidate, Decision::Accept(reason)));
    }
    out.undecided.extend(remaining);
    out
}

/// Descending by `(quality, proper_count)`; ties keep the earliest
/// candidate, preserving feed order.
fn best_index(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        if candidate.rank() > candidates[best].rank() {
            best = i;
        }
    }
    best
}

fn tracking_violation(ctx: &EntityContext<'_>, run: &RunState) -> Option<String> {
    let settings = ctx.settings;
    let entity = ctx.entity;

    if settings.tracking == TrackingPolicy::Off {
        return None;
    }
    if !matches!(entity.identified_by, IdentifiedBy::Ep | IdentifiedBy::Sequence) {
        return None;
    }

    if entity.is_season_pack {
        if let (Some(threshold), Some(season)) =
            (settings.season_packs.threshold(), entity.season)
        {
            if ctx.downloaded_in_season > threshold {
                return Some(format!(
                    "{} episodes of season {} already downloaded",
                    ctx.downloaded_in_season, season
                ));
            }
        }
    } else if let Some(season) = entity.season {
        if ctx.completed_seasons.contains(&season) {
            return Some(format!("season {} already downloaded as a season pack", season));
        }
    }

    let latest = ctx.latest_downloaded.as_ref()?;
    let key_entity = entity.sort_key();
    let key_latest = latest.sort_key();

    let behind = if entity.is_season_pack {
        entity.season.unwrap_or(0) < key_latest.0
    } else {
        key_entity < key_latest
    };
    if behind && settings.tracking != TrackingPolicy::Backfill {
        return Some(format!(
            "older than latest downloaded {}; enable backfill to fetch old entities",
            latest.identifier()
        ));
    }

    let grace = run.grace();
    let ahead: i64 = if entity.is_season_pack {
        // A pack for the next season is fine, anything further is not.
        if key_entity.0 > key_latest.0 + 1 {
            grace + 1
        } else {
            0
        }
    } else if key_entity.0 == key_latest.0 {
        i64::from(key_entity.1) - i64::from(key_latest.1)
    } else if key_entity.0 == key_latest.0 + 1 {
        // Episode numbering restarts with the season.
        i64::from(key_entity.1)
    } else if key_entity.0 > key_latest.0 {
        grace + 1
    } else {
        0
    };
    if ahead > grace {
        return Some(format!(
            "too new compared to latest downloaded {} (grace {}); disable tracking to override",
            latest.identifier(),
            grace
        ));
    }
    None
}
