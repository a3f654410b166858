//! Scene Store
//!
//! Durable record of a project's scenes. The store owns the project directory
//! for as long as it is open (see [`ProjectLock`]) and is the only component
//! that writes `project.json`.
//!
//! Commits are serialized through the write half of a `tokio::sync::RwLock`:
//! the closure passed to [`SceneStore::update`] runs against a copy of the
//! state, the copy is persisted atomically, and only then swapped in. A failed
//! write therefore leaves both disk and memory at the previous state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::GenerationConfig;
use crate::core::fs::{atomic_write_bytes, to_relative_string, ProjectLock};
use crate::core::{AssetKind, CoreError, CoreResult, SceneIndex};

use super::assets::{AssetWriter, ASSETS_DIR};
use super::fingerprint::{bytes_sha256, is_stale, DesiredFingerprints};
use super::model::{DirtyReason, ProjectState, SceneState};

/// Project state file name
pub const PROJECT_FILE: &str = "project.json";
/// Rendered per-scene segments
pub const SEGMENTS_DIR: &str = "segments";
/// Final videos and subtitle sidecars
pub const OUTPUT_DIR: &str = "output";
/// Local pronunciation dictionary
pub const DICTIONARY_FILE: &str = "dictionary.json";

/// Format tag of the on-disk envelope
pub const PROJECT_FORMAT: &str = "narrasync.project";
/// Current envelope version
pub const PROJECT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ProjectEnvelope {
    format: String,
    version: u32,
    checksum: String,
    state: serde_json::Value,
}

/// Files removed by [`SceneStore::prune_assets`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
}

/// Durable, single-writer store for one project
#[derive(Debug)]
pub struct SceneStore {
    root: PathBuf,
    assets: AssetWriter,
    state: RwLock<ProjectState>,
    _lock: ProjectLock,
}

impl SceneStore {
    // =========================================================================
    // Open / Create
    // =========================================================================

    /// Creates a new, empty project in `root`
    pub fn create(root: &Path, name: &str, config: GenerationConfig) -> CoreResult<Self> {
        let lock = ProjectLock::acquire(root)?;
        let file = root.join(PROJECT_FILE);
        if file.exists() {
            return Err(CoreError::ValidationError(format!(
                "Project already exists: {}",
                root.display()
            )));
        }

        let state = ProjectState::new(name, config);
        Self::ensure_layout(root)?;
        Self::save(&file, &state)?;
        info!(project = %state.id, root = %root.display(), "Created project");

        Ok(Self::from_parts(root, state, lock))
    }

    /// Opens an existing project, taking the single-writer lock
    pub fn open(root: &Path) -> CoreResult<Self> {
        let file = root.join(PROJECT_FILE);
        if !file.exists() {
            return Err(CoreError::ProjectNotFound(root.display().to_string()));
        }
        let lock = ProjectLock::acquire(root)?;
        let state = Self::load(&file)?;
        Self::ensure_layout(root)?;
        info!(
            project = %state.id,
            scenes = state.scenes.len(),
            "Opened project"
        );

        Ok(Self::from_parts(root, state, lock))
    }

    fn from_parts(root: &Path, state: ProjectState, lock: ProjectLock) -> Self {
        Self {
            root: root.to_path_buf(),
            assets: AssetWriter::new(root),
            state: RwLock::new(state),
            _lock: lock,
        }
    }

    fn ensure_layout(root: &Path) -> CoreResult<()> {
        for kind in AssetKind::ALL {
            std::fs::create_dir_all(root.join(ASSETS_DIR).join(kind.dir_name()))?;
        }
        std::fs::create_dir_all(root.join(SEGMENTS_DIR))?;
        std::fs::create_dir_all(root.join(OUTPUT_DIR))?;
        Ok(())
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Reads and verifies a project file
    pub fn load(path: &Path) -> CoreResult<ProjectState> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::ProjectNotFound(path.display().to_string()));
            }
            Err(e) => return Err(CoreError::IoError(e)),
        };
        Self::decode(&bytes)
    }

    /// Writes a project file atomically
    pub fn save(path: &Path, state: &ProjectState) -> CoreResult<()> {
        let bytes = Self::encode(state)?;
        atomic_write_bytes(path, &bytes)
    }

    /// Serializes state into the checksummed envelope
    pub fn encode(state: &ProjectState) -> CoreResult<Vec<u8>> {
        let value = serde_json::to_value(state)?;
        let envelope = ProjectEnvelope {
            format: PROJECT_FORMAT.to_string(),
            version: PROJECT_VERSION,
            checksum: bytes_sha256(&serde_json::to_vec(&value)?),
            state: value,
        };
        let mut bytes = serde_json::to_vec_pretty(&envelope)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parses and verifies an envelope. Interrupted generations come back as `Pending`.
    pub fn decode(bytes: &[u8]) -> CoreResult<ProjectState> {
        let envelope: ProjectEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::StorageError(format!("Corrupt project file: {e}")))?;

        if envelope.format != PROJECT_FORMAT {
            return Err(CoreError::StorageError(format!(
                "Unexpected project format '{}'",
                envelope.format
            )));
        }
        if envelope.version != PROJECT_VERSION {
            return Err(CoreError::StorageError(format!(
                "Unsupported project version {} (expected {PROJECT_VERSION})",
                envelope.version
            )));
        }
        let actual = bytes_sha256(&serde_json::to_vec(&envelope.state)?);
        if actual != envelope.checksum {
            return Err(CoreError::StorageError(
                "Project checksum mismatch (file was modified or partially written)".to_string(),
            ));
        }

        let mut state: ProjectState = serde_json::from_value(envelope.state)
            .map_err(|e| CoreError::StorageError(format!("Invalid project state: {e}")))?;

        for scene in state.scenes.iter_mut() {
            if scene.state == SceneState::Generating {
                debug!(scene = scene.index, "Demoting interrupted scene to pending");
                scene.state = SceneState::Pending;
            }
        }
        Ok(state)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets(&self) -> &AssetWriter {
        &self.assets
    }

    pub fn project_file(&self) -> PathBuf {
        self.root.join(PROJECT_FILE)
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join(SEGMENTS_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn dictionary_path(&self) -> PathBuf {
        self.root.join(DICTIONARY_FILE)
    }

    /// Consistent copy of the current state
    pub async fn snapshot(&self) -> ProjectState {
        self.state.read().await.clone()
    }

    pub async fn config(&self) -> GenerationConfig {
        self.state.read().await.config.clone()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Applies `mutate` to a copy of the state, persists it, then publishes it.
    ///
    /// Writers are serialized; readers see either the old or the new state.
    pub async fn update<T, F>(&self, mutate: F) -> CoreResult<T>
    where
        F: FnOnce(&mut ProjectState) -> CoreResult<T>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        next.touch();
        Self::save(&self.project_file(), &next)?;
        *guard = next;
        Ok(out)
    }

    /// Swaps the configuration; scenes whose assets no longer match fall back to `Pending`
    pub async fn set_config(&self, config: GenerationConfig) -> CoreResult<Vec<SceneIndex>> {
        self.update(move |state| {
            state.config = config;
            Ok(reconcile_ready_scenes(state))
        })
        .await
    }

    /// Invalidates the asset kinds named by `reason` for one scene
    pub async fn mark_dirty(&self, index: SceneIndex, reason: DirtyReason) -> CoreResult<()> {
        self.update(move |state| {
            let scene = state.scene_mut(index)?;
            scene.mark_dirty(reason);
            if matches!(scene.state, SceneState::Ready | SceneState::Failed) {
                scene.transition(SceneState::Pending)?;
            }
            debug!(scene = index, reason = reason.label(), "Marked scene dirty");
            Ok(())
        })
        .await
    }

    /// Restores the previous asset of `kind`, treating it as current for the present inputs
    pub async fn rollback_asset(&self, index: SceneIndex, kind: AssetKind) -> CoreResult<()> {
        self.update(move |state| {
            let config = state.config.clone();
            let scene = state.scene_mut(index)?;
            let desired = DesiredFingerprints::for_scene(scene, &config);
            scene.rollback(kind, desired.get(kind).clone())?;
            if scene.state == SceneState::Failed {
                scene.transition(SceneState::Pending)?;
            }
            info!(scene = index, kind = %kind, "Rolled back asset");
            Ok(())
        })
        .await
    }

    /// Deletes asset and segment files no record references any more.
    ///
    /// Files written by an in-flight generation are unreferenced until their
    /// scene commits, so this must not run during a pipeline run.
    pub async fn prune_assets(&self) -> CoreResult<PruneReport> {
        let guard = self.state.write().await;

        let mut referenced: HashSet<String> = guard
            .scenes
            .iter()
            .flat_map(|s| s.referenced_assets())
            .map(|a| a.path.clone())
            .collect();
        if let Some(manifest) = &guard.recomposition {
            referenced.extend(manifest.segments.iter().map(|s| s.path.clone()));
        }

        let mut report = PruneReport::default();
        let mut dirs: Vec<PathBuf> = AssetKind::ALL
            .iter()
            .map(|k| self.assets.asset_dir(*k))
            .collect();
        dirs.push(self.segments_dir());

        for dir in dirs {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CoreError::IoError(e)),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let relative = to_relative_string(&self.root, &path)?;
                if referenced.contains(&relative) {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        report.freed_bytes += size;
                        report.removed.push(relative);
                    }
                    Err(e) => warn!("Failed to prune {}: {}", path.display(), e),
                }
            }
        }

        report.removed.sort();
        info!(
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            "Pruned unreferenced assets"
        );
        Ok(report)
    }
}

/// Moves Ready scenes whose assets went stale back to Pending
pub fn reconcile_ready_scenes(state: &mut ProjectState) -> Vec<SceneIndex> {
    let config = state.config.clone();
    let mut demoted = Vec::new();
    for scene in state.scenes.iter_mut() {
        if scene.state == SceneState::Ready && is_stale(scene, &config) {
            scene.state = SceneState::Pending;
            demoted.push(scene.index);
        }
    }
    demoted
}
