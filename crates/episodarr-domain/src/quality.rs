// SPDX-License-Identifier: GPL-3.0-or-later

//! Quality model: ordered components, a totally ordered [`Quality`], and the
//! requirement grammar (`"720p"`, `"<1080p"`, `">720p <2160p"`, `"720p hdtv+"`)
//! used to express per-series quality constraints.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QualityError {
    #[error("unknown quality token: {0}")]
    UnknownToken(String),

    #[error("empty quality requirement")]
    EmptyRequirement,
}

// ============================================================================
// Components
// ============================================================================

/// Video resolution, ordered worst to best. `Unknown` sorts below everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    #[default]
    Unknown,
    R480p,
    R576p,
    R720p,
    R1080p,
    R2160p,
}

impl Resolution {
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::R480p => Some("480p"),
            Self::R576p => Some("576p"),
            Self::R720p => Some("720p"),
            Self::R1080p => Some("1080p"),
            Self::R2160p => Some("2160p"),
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "480p" => Some(Self::R480p),
            "576p" => Some(Self::R576p),
            "720p" => Some(Self::R720p),
            "1080p" => Some(Self::R1080p),
            "2160p" | "4k" => Some(Self::R2160p),
            _ => None,
        }
    }
}

/// Release source, ordered worst to best.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    #[default]
    Unknown,
    Cam,
    Dvdrip,
    Webrip,
    Hdtv,
    Webdl,
    Bluray,
    Remux,
}

impl Source {
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Cam => Some("cam"),
            Self::Dvdrip => Some("dvdrip"),
            Self::Webrip => Some("webrip"),
            Self::Hdtv => Some("hdtv"),
            Self::Webdl => Some("webdl"),
            Self::Bluray => Some("bluray"),
            Self::Remux => Some("remux"),
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "cam" | "ts" => Some(Self::Cam),
            "dvdrip" | "dvd" => Some(Self::Dvdrip),
            "webrip" => Some(Self::Webrip),
            "hdtv" | "pdtv" | "sdtv" => Some(Self::Hdtv),
            "webdl" | "web" => Some(Self::Webdl),
            "bluray" | "bdrip" | "brrip" => Some(Self::Bluray),
            "remux" => Some(Self::Remux),
            _ => None,
        }
    }
}

/// Video codec, ordered worst to best.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    #[default]
    Unknown,
    Xvid,
    H264,
    H265,
    Av1,
}

impl Codec {
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Xvid => Some("xvid"),
            Self::H264 => Some("h264"),
            Self::H265 => Some("h265"),
            Self::Av1 => Some("av1"),
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "xvid" | "divx" => Some(Self::Xvid),
            "h264" | "x264" => Some(Self::H264),
            "h265" | "x265" | "hevc" => Some(Self::H265),
            "av1" => Some(Self::Av1),
            _ => None,
        }
    }
}

// ============================================================================
// Quality
// ============================================================================

/// A structured release quality. The derived ordering (resolution, then
/// source, then codec) is the total order every "best candidate" comparison
/// in the decision engine relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quality {
    pub resolution: Resolution,
    pub source: Source,
    pub codec: Codec,
}

impl Quality {
    pub fn new(resolution: Resolution, source: Source, codec: Codec) -> Self {
        Self {
            resolution,
            source,
            codec,
        }
    }

    /// Scan a quality string (or release-title fragment) for known tokens.
    /// Unrecognized tokens are skipped; an input with no known token yields
    /// an all-unknown quality.
    pub fn parse(text: &str) -> Self {
        let mut quality = Self::default();
        for token in tokenize(text) {
            if let Some(r) = Resolution::from_token(&token) {
                quality.resolution = quality.resolution.max(r);
            } else if let Some(s) = Source::from_token(&token) {
                quality.source = quality.source.max(s);
            } else if let Some(c) = Codec::from_token(&token) {
                quality.codec = quality.codec.max(c);
            }
        }
        quality
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = [
            self.resolution.name(),
            self.source.name(),
            self.codec.name(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::parse(&text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c == ' ' || c == '.' || c == '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.replace('-', ""))
        .collect()
}

// ============================================================================
// Requirement grammar
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    AtLeast,
    AtMost,
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Resolution(Resolution),
    Source(Source),
    Codec(Codec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Constraint {
    op: Op,
    component: Component,
}

impl Constraint {
    fn satisfied_by(&self, quality: &Quality) -> bool {
        match self.component {
            Component::Resolution(want) => compare(self.op, quality.resolution, want),
            Component::Source(want) => compare(self.op, quality.source, want),
            Component::Codec(want) => compare(self.op, quality.codec, want),
        }
    }
}

fn compare<T: Ord>(op: Op, actual: T, wanted: T) -> bool {
    match op {
        Op::Exact => actual == wanted,
        Op::AtLeast => actual >= wanted,
        Op::AtMost => actual <= wanted,
        Op::Above => actual > wanted,
        Op::Below => actual < wanted,
    }
}

/// A parsed quality requirement: whitespace-separated terms, all of which
/// must hold for a quality to be allowed. A bare name means an exact match
/// on that component; `name+` / `name-` mean at-least / at-most; a `<`,
/// `<=`, `>` or `>=` prefix works like the suffix forms but strictly where
/// applicable.
#[derive(Debug, Clone)]
pub struct Requirement {
    text: String,
    constraints: Vec<Constraint>,
}

impl Requirement {
    pub fn parse(text: &str) -> Result<Self, QualityError> {
        let mut constraints = Vec::new();
        for term in text.split_whitespace() {
            constraints.push(parse_term(term)?);
        }
        if constraints.is_empty() {
            return Err(QualityError::EmptyRequirement);
        }
        Ok(Self {
            text: text.trim().to_string(),
            constraints,
        })
    }

    /// Whether a string is a valid requirement expression. The config
    /// normalizer uses this to recognize quality-named groups.
    pub fn is_requirement(text: &str) -> bool {
        Self::parse(text).is_ok()
    }

    pub fn allows(&self, quality: &Quality) -> bool {
        self.constraints.iter().all(|c| c.satisfied_by(quality))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The implicit target applied when a timeframe is configured without
    /// an explicit quality preference.
    pub fn default_target() -> Self {
        Self::parse("720p hdtv+").expect("valid default target")
    }
}

fn parse_term(term: &str) -> Result<Constraint, QualityError> {
    let (mut op, rest) = if let Some(r) = term.strip_prefix(">=") {
        (Op::AtLeast, r)
    } else if let Some(r) = term.strip_prefix("<=") {
        (Op::AtMost, r)
    } else if let Some(r) = term.strip_prefix('>') {
        (Op::Above, r)
    } else if let Some(r) = term.strip_prefix('<') {
        (Op::Below, r)
    } else {
        (Op::Exact, term)
    };

    let name = if op == Op::Exact {
        if let Some(n) = rest.strip_suffix('+') {
            op = Op::AtLeast;
            n
        } else if let Some(n) = rest.strip_suffix('-') {
            op = Op::AtMost;
            n
        } else {
            rest
        }
    } else {
        rest
    };

    let token = name.to_lowercase();
    let component = if let Some(r) = Resolution::from_token(&token) {
        Component::Resolution(r)
    } else if let Some(s) = Source::from_token(&token) {
        Component::Source(s)
    } else if let Some(c) = Codec::from_token(&token) {
        Component::Codec(c)
    } else {
        return Err(QualityError::UnknownToken(name.to_string()));
    };

    Ok(Constraint { op, component })
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.constraints == other.constraints
    }
}

impl Eq for Requirement {}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl Serialize for Requirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(de::Error::custom)
    }
}
