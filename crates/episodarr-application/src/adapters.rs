// SPDX-License-Identifier: GPL-3.0-or-later

//! Boundary traits for the upstream collaborators: the title parser that
//! turns feed entries into [`ParsedRelease`] records, and the backlog
//! that re-queues candidates deferred under a timeframe.

use episodarr_domain::{IdentifiedBy, ParsedRelease};

use crate::engine::Candidate;

/// Everything the parser needs to know about one configured series.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Concrete identification mode if known; `Auto` lets the parser
    /// report whatever the title carries.
    pub identified_by: IdentifiedBy,
    /// Normalized alternate names the title may use.
    pub alternate_names: Vec<String>,
    /// User-supplied matching patterns, tried before name matching.
    pub name_regexps: Vec<String>,
    /// Require the series name at the start of the title with no extra
    /// words before the identifier.
    pub strict_name: bool,
    /// When non-empty, only releases from these groups are considered.
    pub allow_groups: Vec<String>,
}

/// Title parser. Pure: domain-level failures come back as a
/// [`ParsedRelease`] with `valid == false`, never as a panic.
pub trait ParsingAdapter: Send + Sync {
    fn parse(&self, title: &str, series_name: &str, options: &ParseOptions) -> ParsedRelease;
}

/// Receives candidates deferred under a timeframe. Fire-and-forget; the
/// decision pipeline never reads anything back.
pub trait BacklogAdapter: Send + Sync {
    fn add(&self, candidate: &Candidate, series_scope: &str);
}

/// Backlog that drops everything. Useful when no timeframe is configured.
#[derive(Debug, Default)]
pub struct NullBacklog;

impl BacklogAdapter for NullBacklog {
    fn add(&self, _candidate: &Candidate, _series_scope: &str) {}
}
