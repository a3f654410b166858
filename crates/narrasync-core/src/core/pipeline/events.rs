//! Progress events emitted while a pipeline run is in flight.

use serde::{Deserialize, Serialize};

use crate::core::scenes::SceneFailure;
use crate::core::{AssetKind, SceneIndex};

/// Pipeline progress update
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// Generation started for the listed asset kinds
    SceneStarted {
        scene: SceneIndex,
        kinds: Vec<AssetKind>,
    },
    /// One asset came back from its backend (not yet committed)
    AssetGenerated {
        scene: SceneIndex,
        kind: AssetKind,
        attempts: u32,
    },
    /// The scene was committed as Ready
    SceneCommitted { scene: SceneIndex },
    /// The scene was committed as Failed
    SceneFailed {
        scene: SceneIndex,
        failures: Vec<SceneFailure>,
    },
    /// The scene was cancelled and returned to Pending
    SceneCancelled { scene: SceneIndex },
}

impl PipelineEvent {
    pub fn scene(&self) -> SceneIndex {
        match self {
            PipelineEvent::SceneStarted { scene, .. }
            | PipelineEvent::AssetGenerated { scene, .. }
            | PipelineEvent::SceneCommitted { scene }
            | PipelineEvent::SceneFailed { scene, .. }
            | PipelineEvent::SceneCancelled { scene } => *scene,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(PipelineEvent::AssetGenerated {
            scene: 2,
            kind: AssetKind::Audio,
            attempts: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "assetGenerated");
        assert_eq!(json["kind"], "audio");
        assert_eq!(PipelineEvent::SceneCommitted { scene: 4 }.scene(), 4);
    }
}
