//! Outcome summary of a generation run.

use serde::{Deserialize, Serialize};

use crate::core::scenes::SceneFailure;
use crate::core::SceneIndex;

/// What a generation run did, scene by scene
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    /// Scenes committed as Ready after calling a backend
    pub generated: Vec<SceneIndex>,
    /// Scenes left alone because nothing was stale (or they await a manual retry)
    pub skipped: Vec<SceneIndex>,
    pub failed: Vec<SceneFailure>,
    pub cancelled: Vec<SceneIndex>,
    /// Backend attempts made during the run, retries and rewrites included
    pub backend_calls: u32,
}

impl GenerationReport {
    /// Indices of the scenes that ended Failed
    pub fn failed_scenes(&self) -> Vec<SceneIndex> {
        let mut scenes: Vec<SceneIndex> = self.failed.iter().map(|f| f.scene).collect();
        scenes.dedup();
        scenes
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub(crate) fn sort(&mut self) {
        self.generated.sort_unstable();
        self.skipped.sort_unstable();
        self.cancelled.sort_unstable();
        self.failed
            .sort_by(|a, b| a.scene.cmp(&b.scene).then(a.asset_kind.cmp(&b.asset_kind)));
    }
}
