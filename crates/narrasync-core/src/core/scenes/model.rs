//! Scene and project state model.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::core::config::GenerationConfig;
use crate::core::{
    AssetKind, BackendId, CoreError, CoreResult, DurationMs, FailureReason, Fingerprint,
    ProjectId, SceneIndex,
};

use super::fingerprint::{content_fingerprint, dirty_marker};

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// =============================================================================
// Scene State Machine
// =============================================================================

/// Per-scene generation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneState {
    Unplanned,
    Pending,
    Generating,
    Ready,
    Failed,
}

impl SceneState {
    /// Legal transitions:
    /// `Unplanned -> Pending -> Generating -> Ready | Failed`,
    /// `Ready -> Pending` on edit, `Failed -> Pending` on retry and
    /// `Generating -> Pending` when a run is cancelled or interrupted.
    pub fn can_transition_to(&self, next: SceneState) -> bool {
        use SceneState::*;
        matches!(
            (self, next),
            (Unplanned, Pending)
                | (Pending, Generating)
                | (Generating, Ready)
                | (Generating, Failed)
                | (Generating, Pending)
                | (Ready, Pending)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SceneState::Unplanned => "unplanned",
            SceneState::Pending => "pending",
            SceneState::Generating => "generating",
            SceneState::Ready => "ready",
            SceneState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SceneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Dirty Reasons
// =============================================================================

/// Which assets a re-roll should regenerate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerollTarget {
    #[default]
    None,
    Image,
    Voice,
    Both,
}

impl RerollTarget {
    pub fn kinds(&self) -> &'static [AssetKind] {
        match self {
            RerollTarget::None => &[],
            RerollTarget::Image => &[AssetKind::Image],
            RerollTarget::Voice => &[AssetKind::Audio],
            RerollTarget::Both => &AssetKind::ALL,
        }
    }
}

impl std::str::FromStr for RerollTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RerollTarget::None),
            "image" => Ok(RerollTarget::Image),
            "voice" | "audio" => Ok(RerollTarget::Voice),
            "both" | "all" => Ok(RerollTarget::Both),
            other => Err(format!("Unknown reroll target: {other}")),
        }
    }
}

/// Why a scene was marked dirty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyReason {
    PromptEdited,
    VoiceEdited,
    Reroll(RerollTarget),
    ConfigChanged,
    ManualRetry,
}

impl DirtyReason {
    pub fn label(&self) -> &'static str {
        match self {
            DirtyReason::PromptEdited => "prompt",
            DirtyReason::VoiceEdited => "voice",
            DirtyReason::Reroll(_) => "reroll",
            DirtyReason::ConfigChanged => "config",
            DirtyReason::ManualRetry => "retry",
        }
    }

    /// Asset kinds whose stored fingerprint is invalidated
    pub fn kinds(&self) -> &'static [AssetKind] {
        match self {
            DirtyReason::PromptEdited => &[AssetKind::Image],
            DirtyReason::VoiceEdited => &[AssetKind::Audio],
            DirtyReason::Reroll(target) => target.kinds(),
            DirtyReason::ConfigChanged => &AssetKind::ALL,
            DirtyReason::ManualRetry => &[],
        }
    }
}

// =============================================================================
// Assets
// =============================================================================

/// Immutable asset file owned by the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub kind: AssetKind,
    /// Path relative to the project directory, `/`-separated
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<DurationMs>,
}

/// Where an asset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOrigin {
    Generated,
    Uploaded,
}

/// An asset committed to a scene, with the fingerprint of the inputs behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset: AssetRef,
    pub fingerprint: Fingerprint,
    pub origin: AssetOrigin,
    pub backend: BackendId,
    /// Backend attempts spent producing this asset
    pub attempts: u32,
    /// Prompt actually sent, when it differs from the scene prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_used: Option<String>,
    pub created_at: String,
}

/// User-visible record of a failed asset generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneFailure {
    pub scene: SceneIndex,
    pub asset_kind: AssetKind,
    pub retryable: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub message: String,
    pub occurred_at: String,
}

impl SceneFailure {
    pub fn from_error(scene: SceneIndex, kind: AssetKind, error: &CoreError) -> Self {
        Self {
            scene,
            asset_kind: kind,
            retryable: error.is_retryable(),
            attempts: error.attempts(),
            reason: error.backend_failure().map(|f| f.reason),
            message: error.to_string(),
            occurred_at: now_rfc3339(),
        }
    }
}

// =============================================================================
// Scene
// =============================================================================

/// One narrated segment of the story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub index: SceneIndex,
    /// Source narration
    pub text: String,
    /// Image prompt derived from the text (user-editable)
    pub prompt: String,
    /// Narration sent to TTS after dictionary substitution
    pub voice_text: String,
    pub state: SceneState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<AssetRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AssetRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_history: Vec<AssetRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_history: Vec<AssetRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SceneFailure>,
}

impl Scene {
    /// Creates an unplanned scene whose prompt and voice text default to the text
    pub fn new(index: SceneIndex, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            index,
            prompt: text.clone(),
            voice_text: text.clone(),
            text,
            state: SceneState::Unplanned,
            image: None,
            audio: None,
            content_fingerprint: None,
            image_history: Vec::new(),
            audio_history: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: SceneState) -> CoreResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(CoreError::Internal(format!(
                "Illegal state transition for scene {}: {} -> {}",
                self.index, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn asset(&self, kind: AssetKind) -> Option<&AssetRecord> {
        match kind {
            AssetKind::Image => self.image.as_ref(),
            AssetKind::Audio => self.audio.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: AssetKind) -> (&mut Option<AssetRecord>, &mut Vec<AssetRecord>) {
        match kind {
            AssetKind::Image => (&mut self.image, &mut self.image_history),
            AssetKind::Audio => (&mut self.audio, &mut self.audio_history),
        }
    }

    /// Replaces the asset of `kind`, keeping at most `history_depth` predecessors
    pub fn set_asset(&mut self, kind: AssetKind, record: AssetRecord, history_depth: usize) {
        let (slot, history) = self.slot_mut(kind);
        if let Some(previous) = slot.replace(record) {
            history.push(previous);
            if history.len() > history_depth {
                let excess = history.len() - history_depth;
                history.drain(..excess);
            }
        }
        self.failures.retain(|f| f.asset_kind != kind);
        self.refresh_content_fingerprint();
    }

    /// Restores the most recent previous asset of `kind`, stamped with `fingerprint`
    pub fn rollback(&mut self, kind: AssetKind, fingerprint: Fingerprint) -> CoreResult<()> {
        let index = self.index;
        let (slot, history) = self.slot_mut(kind);
        let mut previous = history.pop().ok_or_else(|| {
            CoreError::ValidationError(format!("Scene {index} has no previous {kind} asset"))
        })?;
        previous.fingerprint = fingerprint;
        *slot = Some(previous);
        self.failures.retain(|f| f.asset_kind != kind);
        self.refresh_content_fingerprint();
        Ok(())
    }

    /// Invalidates stored fingerprints for the reason's asset kinds
    pub fn mark_dirty(&mut self, reason: DirtyReason) {
        for kind in reason.kinds() {
            let (slot, _) = self.slot_mut(*kind);
            if let Some(record) = slot.as_mut() {
                record.fingerprint = dirty_marker(reason);
            }
        }
        self.refresh_content_fingerprint();
    }

    pub fn refresh_content_fingerprint(&mut self) {
        self.content_fingerprint = if self.image.is_none() && self.audio.is_none() {
            None
        } else {
            Some(content_fingerprint(
                self.image.as_ref().map(|r| r.fingerprint.as_str()),
                self.audio.as_ref().map(|r| r.fingerprint.as_str()),
            ))
        };
    }

    /// Ready with both assets committed
    pub fn is_complete(&self) -> bool {
        self.state == SceneState::Ready && self.image.is_some() && self.audio.is_some()
    }

    /// Every record this scene still references, current and historical
    pub fn referenced_assets(&self) -> impl Iterator<Item = &AssetRef> {
        self.image
            .iter()
            .chain(self.audio.iter())
            .chain(self.image_history.iter())
            .chain(self.audio_history.iter())
            .map(|r| &r.asset)
    }
}

// =============================================================================
// Recomposition Manifest
// =============================================================================

/// One rendered per-scene segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub scene: SceneIndex,
    pub fingerprint: Fingerprint,
    pub path: String,
    pub duration_ms: DurationMs,
}

/// Result of the last successful recomposition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecompositionManifest {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<String>,
    pub segments: Vec<SegmentRecord>,
    pub duration_ms: DurationMs,
    pub completed_at: String,
}

impl RecompositionManifest {
    pub fn segment(&self, scene: SceneIndex) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.scene == scene)
    }
}

// =============================================================================
// Project State
// =============================================================================

/// Durable record of a project: scenes plus the configuration they were built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub id: ProjectId,
    pub name: String,
    pub created_at: String,
    pub modified_at: String,
    pub config: GenerationConfig,
    pub scenes: Vec<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recomposition: Option<RecompositionManifest>,
}

impl ProjectState {
    pub fn new(name: impl Into<String>, config: GenerationConfig) -> Self {
        let now = now_rfc3339();
        Self {
            id: Ulid::new().to_string(),
            name: name.into(),
            created_at: now.clone(),
            modified_at: now,
            config,
            scenes: Vec::new(),
            recomposition: None,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = now_rfc3339();
    }

    pub fn scene(&self, index: SceneIndex) -> CoreResult<&Scene> {
        self.scenes.get(index).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Scene index {index} out of range (project has {} scenes)",
                self.scenes.len()
            ))
        })
    }

    pub fn scene_mut(&mut self, index: SceneIndex) -> CoreResult<&mut Scene> {
        let len = self.scenes.len();
        self.scenes.get_mut(index).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Scene index {index} out of range (project has {len} scenes)"
            ))
        })
    }

    /// Scenes that block a full recomposition
    pub fn incomplete_scenes(&self) -> Vec<SceneIndex> {
        self.scenes
            .iter()
            .filter(|s| !s.is_complete())
            .map(|s| s.index)
            .collect()
    }

    pub fn summary(&self) -> ProjectSummary {
        let count = |state: SceneState| self.scenes.iter().filter(|s| s.state == state).count();
        ProjectSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            total: self.scenes.len(),
            unplanned: count(SceneState::Unplanned),
            pending: count(SceneState::Pending),
            generating: count(SceneState::Generating),
            ready: count(SceneState::Ready),
            failed: count(SceneState::Failed),
            failures: self
                .scenes
                .iter()
                .flat_map(|s| s.failures.iter().cloned())
                .collect(),
            last_output: self.recomposition.as_ref().map(|r| r.output.clone()),
        }
    }
}

/// Counts by state plus outstanding failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
    pub total: usize,
    pub unplanned: usize,
    pub pending: usize,
    pub generating: usize,
    pub ready: usize,
    pub failed: usize,
    pub failures: Vec<SceneFailure>,
    pub last_output: Option<String>,
}
