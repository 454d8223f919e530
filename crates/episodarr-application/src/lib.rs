// SPDX-License-Identifier: GPL-3.0-or-later
use episodarr_config::AppConfig;
pub mod adapters;
pub mod engine;
pub mod scan;

pub use adapters::{BacklogAdapter, NullBacklog, ParseOptions, ParsingAdapter};
pub use engine::{decide, Candidate, Decision, EngineError, EntityContext, EntityOutcome, RunState};
pub use scan::{learn, run_scan, ScanDecision, ScanReport};

use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn on_start(&self) {
        info!(target: "application", "application state initialized");
    }
}
