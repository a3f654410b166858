//! Immutable asset files.
//!
//! Every generated or uploaded file is written once under
//! `assets/<kind>/scene_{index:03}-{ulid}.{ext}` and never modified afterwards.
//! Replacing an asset always produces a new file, so a crash mid-generation
//! leaves the previously committed asset untouched.

use std::path::{Path, PathBuf};

use tracing::debug;
use ulid::Ulid;

use crate::core::fs::{atomic_copy, atomic_write_bytes, to_relative_string};
use crate::core::{AssetKind, CoreError, CoreResult, DurationMs, SceneIndex};

use super::fingerprint::{bytes_sha256, file_sha256};
use super::model::AssetRef;

/// Root directory (under the project) holding asset files
pub const ASSETS_DIR: &str = "assets";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "m4a", "flac"];

/// Allowed file extensions for an asset kind
pub fn allowed_extensions(kind: AssetKind) -> &'static [&'static str] {
    match kind {
        AssetKind::Image => IMAGE_EXTENSIONS,
        AssetKind::Audio => AUDIO_EXTENSIONS,
    }
}

/// Writes asset files into a project directory
#[derive(Debug, Clone)]
pub struct AssetWriter {
    root: PathBuf,
}

impl AssetWriter {
    /// `root` is the project directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn asset_dir(&self, kind: AssetKind) -> PathBuf {
        self.root.join(ASSETS_DIR).join(kind.dir_name())
    }

    fn new_path(&self, scene: SceneIndex, kind: AssetKind, ext: &str) -> PathBuf {
        self.asset_dir(kind)
            .join(format!("scene_{scene:03}-{}.{ext}", Ulid::new()))
    }

    /// Writes a new immutable asset from in-memory bytes
    pub fn write(
        &self,
        scene: SceneIndex,
        kind: AssetKind,
        ext: &str,
        bytes: &[u8],
    ) -> CoreResult<AssetRef> {
        let ext = normalize_extension(kind, ext)?;
        if bytes.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Refusing to write empty {kind} asset for scene {scene}"
            )));
        }

        let path = self.new_path(scene, kind, &ext);
        atomic_write_bytes(&path, bytes)?;
        debug!(scene, kind = %kind, path = %path.display(), "Wrote asset");

        Ok(AssetRef {
            kind,
            path: to_relative_string(&self.root, &path)?,
            sha256: bytes_sha256(bytes),
            size_bytes: bytes.len() as u64,
            duration_ms: wav_duration_ms(&ext, &path),
        })
    }

    /// Copies an external file into the project as a new immutable asset
    pub fn import(&self, scene: SceneIndex, kind: AssetKind, source: &Path) -> CoreResult<AssetRef> {
        if !source.is_file() {
            return Err(CoreError::ValidationError(format!(
                "Upload file not found: {}",
                source.display()
            )));
        }
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = normalize_extension(kind, &ext)?;

        let path = self.new_path(scene, kind, &ext);
        let size_bytes = atomic_copy(source, &path)?;
        debug!(scene, kind = %kind, source = %source.display(), "Imported asset");

        Ok(AssetRef {
            kind,
            path: to_relative_string(&self.root, &path)?,
            sha256: file_sha256(&path)?,
            size_bytes,
            duration_ms: wav_duration_ms(&ext, &path),
        })
    }

    /// Absolute path of a stored asset
    pub fn resolve(&self, asset: &AssetRef) -> PathBuf {
        resolve_relative(&self.root, &asset.path)
    }
}

/// Joins a `/`-separated project-relative path onto `root`
pub fn resolve_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

fn normalize_extension(kind: AssetKind, ext: &str) -> CoreResult<String> {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    if allowed_extensions(kind).contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(CoreError::ValidationError(format!(
            "Unsupported {kind} file extension: '{ext}' (expected one of {})",
            allowed_extensions(kind).join(", ")
        )))
    }
}

/// Reads the duration of a WAV file from its header; other formats are probed at render time.
pub fn wav_duration_ms(ext: &str, path: &Path) -> Option<DurationMs> {
    if ext != "wav" {
        return None;
    }
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    let frames = u64::from(reader.duration());
    Some(frames * 1000 / u64::from(spec.sample_rate))
}
