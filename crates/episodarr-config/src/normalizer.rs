// SPDX-License-Identifier: GPL-3.0-or-later

//! Config normalizer: flattens the three accepted series-configuration
//! shapes (bare list, grouped advanced form, flat per-item map) into a
//! canonical `(series name, SeriesSettings)` list with group-setting
//! inheritance, shortcut expansion and auto-exact detection.
//!
//! Output ordering is reverse-alphabetical by normalized name, so longer
//! or more specific names are attempted by the parsing adapter before
//! shorter prefixes within the same scan.

use episodarr_domain::{normalize_series_name, IdentifiedBy, QualityError, Requirement};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::settings::{
    parse_duration, ProperPolicy, SeasonPackPolicy, SeriesSettings, TrackingPolicy,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid quality requirement '{text}': {source}")]
    InvalidRequirement {
        text: String,
        #[source]
        source: QualityError,
    },

    #[error("invalid duration '{text}' for {field}")]
    InvalidDuration { field: &'static str, text: String },

    #[error("invalid value for {field}")]
    InvalidValue { field: &'static str },
}

/// Normalize raw series configuration. Per-series settings errors drop that
/// series with an error log; they never abort the rest of the list.
pub fn normalize(raw: &Value) -> Vec<(String, SeriesSettings)> {
    let groups = reduce_to_groups(raw);

    // Merge entries by normalized name, group settings layered under item
    // settings, later duplicates layered over earlier ones.
    let mut merged: Vec<(String, String, Map<String, Value>)> = Vec::new();
    for group in groups {
        let group_settings = implicit_group_target(group.name.as_str(), group.settings);
        for (name, item_settings) in group.entries {
            let normalized = normalize_series_name(&name);
            if normalized.is_empty() {
                warn!(target: "normalizer", series = %name, "dropping series with empty name");
                continue;
            }
            let settings = deep_merge(&group_settings, &item_settings);
            if let Some(existing) = merged.iter_mut().find(|(n, _, _)| *n == normalized) {
                warn!(
                    target: "normalizer",
                    series = %name,
                    "series configured multiple times; merging settings"
                );
                existing.2 = deep_merge(&existing.2, &settings);
            } else {
                merged.push((normalized, name, settings));
            }
        }
    }

    let mut out: Vec<(String, String, SeriesSettings)> = Vec::new();
    for (normalized, name, map) in merged {
        let map = apply_shortcuts(map);
        match build_settings(&map) {
            Ok(settings) => out.push((normalized, name, settings)),
            Err(err) => {
                error!(
                    target: "normalizer",
                    series = %name,
                    error = %err,
                    "dropping series with invalid settings"
                );
            }
        }
    }

    inject_auto_exact(&mut out);

    out.sort_by(|a, b| b.0.cmp(&a.0));
    out.into_iter().map(|(_, name, s)| (name, s)).collect()
}

struct Group {
    name: String,
    settings: Map<String, Value>,
    entries: Vec<(String, Map<String, Value>)>,
}

/// Reduce any accepted input shape to the grouped advanced form.
fn reduce_to_groups(raw: &Value) -> Vec<Group> {
    match raw {
        Value::Array(items) => vec![Group {
            name: "series".to_string(),
            settings: Map::new(),
            entries: list_entries(items),
        }],
        Value::Object(map) => {
            let grouped = map.contains_key("settings")
                || map.values().any(|v| matches!(v, Value::Array(_)));
            if grouped {
                let group_settings: Map<String, Value> = map
                    .get("settings")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                map.iter()
                    .filter(|(key, _)| key.as_str() != "settings")
                    .filter_map(|(key, value)| match value {
                        Value::Array(items) => Some(Group {
                            name: key.clone(),
                            settings: group_settings
                                .get(key)
                                .and_then(Value::as_object)
                                .cloned()
                                .unwrap_or_default(),
                            entries: list_entries(items),
                        }),
                        other => {
                            warn!(
                                target: "normalizer",
                                group = %key,
                                value = %other,
                                "ignoring non-list group"
                            );
                            None
                        }
                    })
                    .collect()
            } else {
                // Flat per-item form.
                vec![Group {
                    name: "series".to_string(),
                    settings: Map::new(),
                    entries: map
                        .iter()
                        .filter_map(|(name, value)| flat_entry(name, value))
                        .collect(),
                }]
            }
        }
        other => {
            warn!(target: "normalizer", value = %other, "unrecognized series configuration shape");
            Vec::new()
        }
    }
}

fn list_entries(items: &[Value]) -> Vec<(String, Map<String, Value>)> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some((name.clone(), Map::new())),
            Value::Object(map) if map.len() == 1 => {
                let (name, value) = map.iter().next().expect("single entry");
                flat_entry(name, value)
            }
            other => {
                warn!(target: "normalizer", value = %other, "ignoring malformed series entry");
                None
            }
        })
        .collect()
}

fn flat_entry(name: &str, value: &Value) -> Option<(String, Map<String, Value>)> {
    match value {
        Value::Null => Some((name.to_string(), Map::new())),
        Value::Object(settings) => Some((name.to_string(), settings.clone())),
        other => {
            warn!(
                target: "normalizer",
                series = %name,
                value = %other,
                "ignoring malformed series settings"
            );
            None
        }
    }
}

/// A group whose name is itself a quality requirement implies a `target`
/// default for its members.
fn implicit_group_target(name: &str, mut settings: Map<String, Value>) -> Map<String, Value> {
    if Requirement::is_requirement(name)
        && !settings.contains_key("target")
        && !settings.contains_key("quality")
        && !settings.contains_key("qualities")
    {
        debug!(target: "normalizer", group = %name, "group name used as implicit target quality");
        settings.insert("target".to_string(), Value::String(name.to_string()));
    }
    settings
}

/// Deep-merge two settings maps; overlay values win, nested objects merge
/// recursively.
fn deep_merge(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (key, value) in overlay {
        match (out.get(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                out.insert(key.clone(), Value::Object(deep_merge(existing, incoming)));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Expand configuration shortcuts into their canonical keys.
fn apply_shortcuts(mut map: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::String(path)) = map.remove("path") {
        let set = map
            .entry("set")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(set) = set {
            set.entry("path").or_insert(Value::String(path));
        }
    }

    if let Some(watched) = map.remove("watched") {
        map.entry("begin").or_insert(watched);
    }

    if let Some(enough) = map.remove("enough") {
        map.entry("target").or_insert(enough);
    }

    if map.contains_key("timeframe")
        && !map.contains_key("qualities")
        && !map.contains_key("target")
    {
        map.insert(
            "target".to_string(),
            Value::String(Requirement::default_target().text().to_string()),
        );
    }

    map
}

fn build_settings(map: &Map<String, Value>) -> Result<SeriesSettings, NormalizeError> {
    let mut settings = SeriesSettings::default();

    for (key, value) in map {
        match key.as_str() {
            "quality" => settings.quality = Some(requirement(value, "quality")?),
            "qualities" => settings.qualities = requirement_list(value)?,
            "target" => settings.target = Some(requirement(value, "target")?),
            "timeframe" => settings.timeframe = Some(duration(value, "timeframe")?),
            "upgrade" => settings.upgrade = boolean(value, "upgrade")?,
            "propers" => settings.propers = proper_policy(value)?,
            "season_packs" => settings.season_packs = season_pack_policy(value)?,
            "specials" => settings.specials = boolean(value, "specials")?,
            "tracking" => settings.tracking = tracking_policy(value)?,
            "begin" => settings.begin = Some(string(value, "begin")?),
            "exact" => settings.exact = Some(boolean(value, "exact")?),
            "alternate_name" | "alternate_names" => {
                settings.alternate_names = string_list(value, "alternate_names")?
            }
            "identified_by" => {
                let text = string(value, "identified_by")?;
                settings.identified_by = IdentifiedBy::parse_str(&text).ok_or(
                    NormalizeError::InvalidValue {
                        field: "identified_by",
                    },
                )?;
            }
            "name_regexp" | "name_regexps" => {
                settings.name_regexps = string_list(value, "name_regexps")?
            }
            "from_group" | "allow_groups" => {
                settings.allow_groups = string_list(value, "allow_groups")?
            }
            "set" => {
                if let Value::Object(set) = value {
                    settings.set = set.clone().into_iter().collect();
                } else {
                    return Err(NormalizeError::InvalidValue { field: "set" });
                }
            }
            // Unknown keys are the schema validator's concern, not ours.
            other => debug!(target: "normalizer", key = %other, "ignoring unrecognized setting"),
        }
    }

    Ok(settings)
}

fn requirement(value: &Value, field: &'static str) -> Result<Requirement, NormalizeError> {
    let text = string(value, field)?;
    Requirement::parse(&text).map_err(|source| NormalizeError::InvalidRequirement { text, source })
}

fn requirement_list(value: &Value) -> Result<Vec<Requirement>, NormalizeError> {
    match value {
        Value::Array(items) => items.iter().map(|v| requirement(v, "qualities")).collect(),
        single => Ok(vec![requirement(single, "qualities")?]),
    }
}

fn duration(value: &Value, field: &'static str) -> Result<chrono::Duration, NormalizeError> {
    let text = string(value, field)?;
    parse_duration(&text).ok_or(NormalizeError::InvalidDuration { field, text })
}

fn boolean(value: &Value, field: &'static str) -> Result<bool, NormalizeError> {
    value
        .as_bool()
        .ok_or(NormalizeError::InvalidValue { field })
}

fn string(value: &Value, field: &'static str) -> Result<String, NormalizeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(NormalizeError::InvalidValue { field }),
    }
}

fn string_list(value: &Value, field: &'static str) -> Result<Vec<String>, NormalizeError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| string(v, field))
            .collect::<Result<Vec<_>, _>>(),
        _ => Err(NormalizeError::InvalidValue { field }),
    }
}

fn proper_policy(value: &Value) -> Result<ProperPolicy, NormalizeError> {
    match value {
        Value::Bool(true) => Ok(ProperPolicy::On),
        Value::Bool(false) => Ok(ProperPolicy::Off),
        Value::String(text) => parse_duration(text)
            .map(ProperPolicy::Window)
            .ok_or_else(|| NormalizeError::InvalidDuration {
                field: "propers",
                text: text.clone(),
            }),
        _ => Err(NormalizeError::InvalidValue { field: "propers" }),
    }
}

fn season_pack_policy(value: &Value) -> Result<SeasonPackPolicy, NormalizeError> {
    match value {
        Value::Bool(true) => Ok(SeasonPackPolicy::On),
        Value::Bool(false) => Ok(SeasonPackPolicy::Off),
        Value::String(text) if text == "only" => Ok(SeasonPackPolicy::Only),
        Value::Number(n) => n
            .as_u64()
            .map(|n| SeasonPackPolicy::Threshold(n as u32))
            .ok_or(NormalizeError::InvalidValue {
                field: "season_packs",
            }),
        Value::Object(map) => {
            let threshold = map
                .get("threshold")
                .and_then(Value::as_u64)
                .ok_or(NormalizeError::InvalidValue {
                    field: "season_packs.threshold",
                })? as u32;
            let reject_eps = match map.get("reject_eps") {
                Some(v) => boolean(v, "season_packs.reject_eps")?,
                None => false,
            };
            Ok(SeasonPackPolicy::Custom {
                threshold,
                reject_eps,
            })
        }
        _ => Err(NormalizeError::InvalidValue {
            field: "season_packs",
        }),
    }
}

fn tracking_policy(value: &Value) -> Result<TrackingPolicy, NormalizeError> {
    match value {
        Value::Bool(true) => Ok(TrackingPolicy::On),
        Value::Bool(false) => Ok(TrackingPolicy::Off),
        Value::String(text) if text == "backfill" => Ok(TrackingPolicy::Backfill),
        _ => Err(NormalizeError::InvalidValue { field: "tracking" }),
    }
}

/// For every configured pair where one normalized name is a strict prefix
/// of another, inject `exact: true` on the shorter name unless explicitly
/// set, so it cannot swallow releases of the longer-named series.
fn inject_auto_exact(series: &mut [(String, String, SeriesSettings)]) {
    let names: Vec<String> = series.iter().map(|(n, _, _)| n.clone()).collect();
    for (normalized, name, settings) in series.iter_mut() {
        if settings.exact.is_some() {
            continue;
        }
        let is_prefix_of_other = names
            .iter()
            .any(|other| other != normalized && other.starts_with(normalized.as_str()));
        if is_prefix_of_other {
            debug!(
                target: "normalizer",
                series = %name,
                "name is a prefix of another configured series; forcing exact matching"
            );
            settings.exact = Some(true);
        }
    }
}
