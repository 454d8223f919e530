// SPDX-License-Identifier: GPL-3.0-or-later

//! Canonical per-series settings. All dynamic configuration shapes
//! (bool | string | number | map for the same field) are resolved into
//! these types once during normalization, so the decision engine never
//! branches on raw values.

use std::collections::BTreeMap;

use chrono::Duration;
use episodarr_domain::{IdentifiedBy, Requirement};
use serde_json::Value;

/// Proper (re-release) handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProperPolicy {
    /// Accept improving propers at any time.
    #[default]
    On,
    /// Never accept a release solely because it is a proper.
    Off,
    /// Accept improving propers only within this window after the entity
    /// was first seen.
    Window(Duration),
}

/// Season-pack handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeasonPackPolicy {
    #[default]
    Off,
    On,
    /// Accept only season packs, rejecting individual episodes.
    Only,
    /// Accept a pack only while at most this many individual episodes of
    /// the season have been downloaded.
    Threshold(u32),
    /// Threshold plus optional episode rejection ("only" with a threshold).
    Custom { threshold: u32, reject_eps: bool },
}

impl SeasonPackPolicy {
    pub fn packs_allowed(self) -> bool {
        !matches!(self, Self::Off)
    }

    pub fn episodes_allowed(self) -> bool {
        !matches!(
            self,
            Self::Only
                | Self::Custom {
                    reject_eps: true,
                    ..
                }
        )
    }

    pub fn threshold(self) -> Option<u32> {
        match self {
            Self::Threshold(n) | Self::Custom { threshold: n, .. } => Some(n),
            _ => None,
        }
    }
}

/// Episode-advancement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackingPolicy {
    #[default]
    On,
    Off,
    /// Allow fetching episodes behind the most recent download.
    Backfill,
}

/// Canonical settings for one configured series, output of the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSettings {
    pub quality: Option<Requirement>,
    pub qualities: Vec<Requirement>,
    pub target: Option<Requirement>,
    pub timeframe: Option<Duration>,
    pub upgrade: bool,
    pub propers: ProperPolicy,
    pub season_packs: SeasonPackPolicy,
    pub specials: bool,
    pub tracking: TrackingPolicy,
    pub begin: Option<String>,
    pub exact: Option<bool>,
    pub alternate_names: Vec<String>,
    pub identified_by: IdentifiedBy,
    pub name_regexps: Vec<String>,
    pub allow_groups: Vec<String>,
    pub set: BTreeMap<String, Value>,
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            quality: None,
            qualities: Vec::new(),
            target: None,
            timeframe: None,
            upgrade: false,
            propers: ProperPolicy::On,
            season_packs: SeasonPackPolicy::Off,
            specials: true,
            tracking: TrackingPolicy::On,
            begin: None,
            exact: None,
            alternate_names: Vec::new(),
            identified_by: IdentifiedBy::Auto,
            name_regexps: Vec::new(),
            allow_groups: Vec::new(),
            set: BTreeMap::new(),
        }
    }
}

/// Parse a human duration like `"6 hours"`, `"2 days"`, `"90 minutes"` or
/// `"1 week"`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let mut parts = text.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.trim_end_matches('s');
    if parts.next().is_some() || amount < 0 {
        return None;
    }
    match unit {
        "minute" => Some(Duration::minutes(amount)),
        "hour" => Some(Duration::hours(amount)),
        "day" => Some(Duration::days(amount)),
        "week" => Some(Duration::weeks(amount)),
        _ => None,
    }
}
