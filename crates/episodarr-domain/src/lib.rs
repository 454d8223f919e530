// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub mod quality;

pub use quality::{Codec, Quality, QualityError, Requirement, Resolution, Source};

// ============================================================================
// Value Objects & IDs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesId(pub Uuid);

impl SeriesId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SeriesId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseId(pub Uuid);

impl ReleaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ReleaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Enums
// ============================================================================

/// How entities of a series are identified. `Auto` means the concrete mode
/// is inferred from history once enough entities have been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifiedBy {
    #[default]
    Auto,
    Ep,
    Date,
    Sequence,
    Id,
    Special,
}

impl IdentifiedBy {
    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Auto)
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "ep" => Some(Self::Ep),
            "date" => Some(Self::Date),
            "sequence" => Some(Self::Sequence),
            "id" => Some(Self::Id),
            "special" => Some(Self::Special),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdentifiedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Ep => write!(f, "ep"),
            Self::Date => write!(f, "date"),
            Self::Sequence => write!(f, "sequence"),
            Self::Id => write!(f, "id"),
            Self::Special => write!(f, "special"),
        }
    }
}

// ============================================================================
// Name normalization
// ============================================================================

/// Fold a series name into its canonical lookup key: NFKD-decomposed with
/// combining marks stripped, lowercased, punctuation replaced by spaces and
/// whitespace collapsed. Unique across all series and alternate names.
pub fn normalize_series_name(name: &str) -> String {
    let folded: String = name
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();
    folded
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Entity references (begin cutoff)
// ============================================================================

/// A point in a series, used as the `begin` cutoff below which candidates
/// are always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    Episode { season: u32, episode: u32 },
    Date(NaiveDate),
    Sequence(u32),
}

impl EntityRef {
    /// Parse a begin-point string.
    ///
    /// Supported forms:
    /// - `SxxEyy` (case-insensitive): season/episode
    /// - `YYYY-MM-DD`: date-identified series
    /// - bare digits: sequence number
    pub fn parse_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let upper = s.to_uppercase();
        if let Some(rest) = upper.strip_prefix('S') {
            if let Some((season, episode)) = rest.split_once('E') {
                let season: u32 = season.parse().ok()?;
                let episode: u32 = episode.parse().ok()?;
                return Some(Self::Episode { season, episode });
            }
        }

        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(Self::Date(date));
        }

        if s.chars().all(|c| c.is_ascii_digit()) {
            return s.parse().ok().map(Self::Sequence);
        }

        None
    }

    pub fn kind(&self) -> IdentifiedBy {
        match self {
            Self::Episode { .. } => IdentifiedBy::Ep,
            Self::Date(_) => IdentifiedBy::Date,
            Self::Sequence(_) => IdentifiedBy::Sequence,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Episode { season, episode } => write!(f, "S{:02}E{:02}", season, episode),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Sequence(number) => write!(f, "{}", number),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    pub name: String,
    pub name_normalized: String,
    pub alternate_names: Vec<String>,
    pub identified_by: IdentifiedBy,
    pub begin: Option<EntityRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            name_normalized: normalize_series_name(&name),
            id: SeriesId::new(),
            name,
            alternate_names: Vec::new(),
            identified_by: IdentifiedBy::Auto,
            begin: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A season pack, episode or special being tracked for a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntity {
    pub id: EntityId,
    pub series_id: SeriesId,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub date: Option<NaiveDate>,
    pub is_season_pack: bool,
    pub identified_by: IdentifiedBy,
    pub first_seen: DateTime<Utc>,
}

impl SeriesEntity {
    pub fn new_episode(series_id: SeriesId, season: u32, episode: u32) -> Self {
        Self {
            id: EntityId::new(),
            series_id,
            season: Some(season),
            episode: Some(episode),
            date: None,
            is_season_pack: false,
            identified_by: IdentifiedBy::Ep,
            first_seen: Utc::now(),
        }
    }

    pub fn new_season_pack(series_id: SeriesId, season: u32) -> Self {
        Self {
            id: EntityId::new(),
            series_id,
            season: Some(season),
            episode: None,
            date: None,
            is_season_pack: true,
            identified_by: IdentifiedBy::Ep,
            first_seen: Utc::now(),
        }
    }

    pub fn new_date(series_id: SeriesId, date: NaiveDate) -> Self {
        Self {
            id: EntityId::new(),
            series_id,
            season: None,
            episode: None,
            date: Some(date),
            is_season_pack: false,
            identified_by: IdentifiedBy::Date,
            first_seen: Utc::now(),
        }
    }

    pub fn new_sequence(series_id: SeriesId, number: u32) -> Self {
        Self {
            id: EntityId::new(),
            series_id,
            season: None,
            episode: Some(number),
            date: None,
            is_season_pack: false,
            identified_by: IdentifiedBy::Sequence,
            first_seen: Utc::now(),
        }
    }

    pub fn new_special(series_id: SeriesId, season: Option<u32>, episode: Option<u32>) -> Self {
        Self {
            id: EntityId::new(),
            series_id,
            season,
            episode,
            date: None,
            is_season_pack: false,
            identified_by: IdentifiedBy::Special,
            first_seen: Utc::now(),
        }
    }

    /// Ordering key: season then episode. Date entities map to
    /// (year, ordinal day) so they stay comparable within their mode.
    pub fn sort_key(&self) -> (u32, u32) {
        if let Some(date) = self.date {
            return (date.year().max(0) as u32, date.ordinal());
        }
        (self.season.unwrap_or(0), self.episode.unwrap_or(0))
    }

    /// Whether this entity sorts strictly before a begin cutoff. Entities of
    /// a different identification kind never match a cutoff.
    pub fn is_before(&self, begin: &EntityRef) -> bool {
        match (begin, self.identified_by) {
            (EntityRef::Episode { season, episode }, IdentifiedBy::Ep) => {
                if self.is_season_pack {
                    self.season.unwrap_or(0) < *season
                } else {
                    self.sort_key() < (*season, *episode)
                }
            }
            (EntityRef::Date(date), IdentifiedBy::Date) => match self.date {
                Some(d) => d < *date,
                None => false,
            },
            (EntityRef::Sequence(number), IdentifiedBy::Sequence) => {
                self.episode.unwrap_or(0) < *number
            }
            _ => false,
        }
    }

    /// Human-readable identifier used in log lines and rejection reasons.
    pub fn identifier(&self) -> String {
        if let Some(date) = self.date {
            return date.format("%Y-%m-%d").to_string();
        }
        match (self.season, self.episode, self.is_season_pack) {
            (Some(season), _, true) => format!("S{:02}", season),
            (Some(season), Some(episode), false) => format!("S{:02}E{:02}", season, episode),
            (None, Some(number), _) => format!("{}", number),
            _ => "unidentified".to_string(),
        }
    }
}

/// One observed candidate release for an entity at a given quality and
/// proper count. At most one row per distinct (entity, quality,
/// proper_count); re-observation only moves `first_seen` earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub entity_id: EntityId,
    pub title: String,
    pub quality: Quality,
    pub proper_count: u32,
    pub downloaded: bool,
    pub first_seen: DateTime<Utc>,
}

impl Release {
    pub fn new(entity_id: EntityId, title: impl Into<String>, quality: Quality) -> Self {
        Self {
            id: ReleaseId::new(),
            entity_id,
            title: title.into(),
            quality,
            proper_count: 0,
            downloaded: false,
            first_seen: Utc::now(),
        }
    }
}

// ============================================================================
// Parsed release (external parsing-adapter contract)
// ============================================================================

/// Output of the external title parser. Not persisted; an invalid parse is
/// ignored by the decision engine, never rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRelease {
    pub series_name: String,
    pub season: Option<u32>,
    pub episodes: Vec<u32>,
    pub date: Option<NaiveDate>,
    pub sequence: Option<u32>,
    pub id_kind: IdentifiedBy,
    pub quality: Quality,
    pub proper_count: u32,
    pub group: Option<String>,
    pub season_pack: bool,
    pub strict_name: bool,
    pub valid: bool,
}

impl ParsedRelease {
    pub fn invalid(series_name: impl Into<String>) -> Self {
        Self {
            series_name: series_name.into(),
            season: None,
            episodes: Vec::new(),
            date: None,
            sequence: None,
            id_kind: IdentifiedBy::Auto,
            quality: Quality::default(),
            proper_count: 0,
            group: None,
            season_pack: false,
            strict_name: false,
            valid: false,
        }
    }

    pub fn identifier(&self) -> String {
        if let Some(date) = self.date {
            return date.format("%Y-%m-%d").to_string();
        }
        if let Some(number) = self.sequence {
            return format!("{}", number);
        }
        match (self.season, self.episodes.first(), self.season_pack) {
            (Some(season), _, true) => format!("S{:02}", season),
            (Some(season), Some(episode), false) => format!("S{:02}E{:02}", season, episode),
            _ => "unidentified".to_string(),
        }
    }
}

// ============================================================================
// Domain Validation
// ============================================================================

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Result<(), Vec<ValidationError>>;
}

impl Validate for Series {
    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError {
                field: "name",
                message: "name cannot be empty".into(),
            });
        }
        if self.name_normalized != normalize_series_name(&self.name) {
            errors.push(ValidationError {
                field: "name_normalized",
                message: "normalized name out of sync with display name".into(),
            });
        }
        if let Some(begin) = &self.begin {
            if self.identified_by.is_concrete() && begin.kind() != self.identified_by {
                errors.push(ValidationError {
                    field: "begin",
                    message: format!(
                        "begin {} does not match identification mode {}",
                        begin, self.identified_by
                    ),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Validate for Release {
    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.title.trim().is_empty() {
            errors.push(ValidationError {
                field: "title",
                message: "title cannot be empty".into(),
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_punctuation_and_accents() {
        assert_eq!(normalize_series_name("The Show!"), "the show");
        assert_eq!(normalize_series_name("  Foo's   Bar  "), "foo s bar");
        assert_eq!(normalize_series_name("Café Münch"), "cafe munch");
        assert_eq!(
            normalize_series_name("Mr. Robot"),
            normalize_series_name("mr robot")
        );
    }

    #[test]
    fn entity_ref_parses_episode_date_and_sequence() {
        assert_eq!(
            EntityRef::parse_str("s02e03"),
            Some(EntityRef::Episode {
                season: 2,
                episode: 3
            })
        );
        assert_eq!(
            EntityRef::parse_str("2024-05-01"),
            Some(EntityRef::Date(
                NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
            ))
        );
        assert_eq!(EntityRef::parse_str("42"), Some(EntityRef::Sequence(42)));
        assert_eq!(EntityRef::parse_str("season two"), None);
        assert_eq!(EntityRef::parse_str(""), None);
    }

    #[test]
    fn entity_ref_display_round_trips() {
        for text in ["S02E03", "2024-05-01", "42"] {
            let parsed = EntityRef::parse_str(text).unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn entity_ref_kind() {
        assert_eq!(
            EntityRef::parse_str("S01E01").unwrap().kind(),
            IdentifiedBy::Ep
        );
        assert_eq!(
            EntityRef::parse_str("2024-01-01").unwrap().kind(),
            IdentifiedBy::Date
        );
        assert_eq!(
            EntityRef::parse_str("7").unwrap().kind(),
            IdentifiedBy::Sequence
        );
    }

    #[test]
    fn entity_sort_key_orders_by_season_then_episode() {
        let series = SeriesId::new();
        let early = SeriesEntity::new_episode(series, 1, 10);
        let late = SeriesEntity::new_episode(series, 2, 1);
        assert!(early.sort_key() < late.sort_key());

        let pack = SeriesEntity::new_season_pack(series, 2);
        assert!(pack.sort_key() < late.sort_key());
    }

    #[test]
    fn entity_before_begin_cutoff() {
        let series = SeriesId::new();
        let begin = EntityRef::parse_str("S02E05").unwrap();

        assert!(SeriesEntity::new_episode(series, 1, 12).is_before(&begin));
        assert!(SeriesEntity::new_episode(series, 2, 4).is_before(&begin));
        assert!(!SeriesEntity::new_episode(series, 2, 5).is_before(&begin));
        assert!(!SeriesEntity::new_episode(series, 3, 1).is_before(&begin));

        // A pack for the begin season is kept, earlier seasons are cut.
        assert!(SeriesEntity::new_season_pack(series, 1).is_before(&begin));
        assert!(!SeriesEntity::new_season_pack(series, 2).is_before(&begin));

        // Mismatched identification kinds never match the cutoff.
        let seq = SeriesEntity::new_sequence(series, 1);
        assert!(!seq.is_before(&begin));
        assert!(seq.is_before(&EntityRef::Sequence(5)));
    }

    #[test]
    fn entity_identifier_formats() {
        let series = SeriesId::new();
        assert_eq!(
            SeriesEntity::new_episode(series, 2, 3).identifier(),
            "S02E03"
        );
        assert_eq!(SeriesEntity::new_season_pack(series, 2).identifier(), "S02");
        assert_eq!(SeriesEntity::new_sequence(series, 42).identifier(), "42");
        assert_eq!(
            SeriesEntity::new_date(series, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
                .identifier(),
            "2024-05-01"
        );
    }

    #[test]
    fn series_constructor_normalizes_name() {
        let series = Series::new("The Office (US)");
        assert_eq!(series.name, "The Office (US)");
        assert_eq!(series.name_normalized, "the office us");
        assert_eq!(series.identified_by, IdentifiedBy::Auto);
        assert!(series.validate().is_ok());
    }

    #[test]
    fn series_validation_flags_begin_mode_mismatch() {
        let mut series = Series::new("Foo");
        series.identified_by = IdentifiedBy::Date;
        series.begin = EntityRef::parse_str("S01E01");
        let errs = series.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.field == "begin"));
    }

    #[test]
    fn identified_by_parse_and_display() {
        for mode in [
            IdentifiedBy::Auto,
            IdentifiedBy::Ep,
            IdentifiedBy::Date,
            IdentifiedBy::Sequence,
            IdentifiedBy::Id,
            IdentifiedBy::Special,
        ] {
            assert_eq!(IdentifiedBy::parse_str(&mode.to_string()), Some(mode));
        }
        assert_eq!(IdentifiedBy::parse_str("weekly"), None);
        assert!(!IdentifiedBy::Auto.is_concrete());
        assert!(IdentifiedBy::Ep.is_concrete());
    }

    #[test]
    fn release_constructor_defaults() {
        let release = Release::new(EntityId::new(), "Foo.S01E01.720p", Quality::parse("720p"));
        assert_eq!(release.proper_count, 0);
        assert!(!release.downloaded);
        assert!(release.validate().is_ok());
    }

    #[test]
    fn parsed_release_identifier_formats() {
        let mut parsed = ParsedRelease::invalid("Foo");
        parsed.season = Some(1);
        parsed.episodes = vec![2];
        assert_eq!(parsed.identifier(), "S01E02");

        parsed.season_pack = true;
        assert_eq!(parsed.identifier(), "S01");

        let mut seq = ParsedRelease::invalid("Foo");
        seq.sequence = Some(9);
        assert_eq!(seq.identifier(), "9");
    }
}
