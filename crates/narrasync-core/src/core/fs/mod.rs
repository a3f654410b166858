//! Filesystem utilities.
//!
//! Safe primitives for writing project files in a crash-tolerant way, plus the
//! advisory lock that enforces a single writer per project directory.
//!
//! Why this exists:
//! - `project.json` is the only durable record of scene state and fingerprints.
//! - A partial write (power loss, crash) must not leave the project unrecoverable.
//! - Windows semantics differ from Unix for rename-over-existing; we handle both.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::{CoreError, CoreResult};

/// Name of the advisory lock file inside a project directory
pub const PROJECT_LOCK_FILE: &str = ".narrasync.lock";

// =============================================================================
// Path Validation Utilities
// =============================================================================

/// Validates that an identifier component is safe to use in file paths.
///
/// Rejects empty identifiers, traversal sequences (`..`), path separators,
/// drive letter indicators and control characters.
pub fn validate_path_id_component(id: &str, label: &str) -> Result<(), String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} is empty or contains only whitespace"));
    }
    if trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(format!("Invalid {label}: contains path traversal characters"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(format!("Invalid {label}: contains control characters"));
    }
    Ok(())
}

/// Converts a project-relative path into the portable form stored in project state.
pub fn to_relative_string(root: &Path, path: &Path) -> CoreResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        CoreError::Internal(format!(
            "Path {} is outside project root {}",
            path.display(),
            root.display()
        ))
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Implementation notes:
/// - Write to a sibling temporary file.
/// - Flush and sync the temp file.
/// - Swap into place by renaming.
/// - If the destination exists, it is first moved aside as a `.bak` file, then removed.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)?;
    Ok(())
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Copy `src` to `dest` through a temp file so `dest` is either absent or complete.
pub fn atomic_copy(src: &Path, dest: &Path) -> CoreResult<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(dest);
    let copied = std::fs::copy(src, &tmp_path)?;
    File::open(&tmp_path)?.sync_all()?;
    atomic_replace(dest, &tmp_path)?;
    Ok(copied)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "tmp")
}

fn bak_path_for(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "bak")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut sibling = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    sibling.set_file_name(format!("{file_name}.{suffix}"));
    sibling
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !dest.exists() {
        std::fs::rename(src_tmp, dest)?;
        return Ok(());
    }

    // Windows: rename-over-existing may fail depending on filesystem; use a backup swap.
    let bak = bak_path_for(dest);
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}

// =============================================================================
// Single-Writer Lock
// =============================================================================

/// Exclusive advisory lock on a project directory.
///
/// Held for as long as a scene store is open. Dropping it releases the lock.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Acquires the lock without blocking. A held lock yields `ProjectLocked`.
    pub fn acquire(project_dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(project_dir)?;
        let path = project_dir.join(PROJECT_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        fs2::FileExt::try_lock_exclusive(&file)
            .map_err(|_| CoreError::ProjectLocked(project_dir.display().to_string()))?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("Failed to unlock project lock file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_bytes_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("project.json");

        atomic_write_bytes(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        assert!(!dir.path().join("nested/project.json.tmp").exists());
        assert!(!dir.path().join("nested/project.json.bak").exists());
    }

    #[test]
    fn atomic_copy_copies_contents() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("upload.png");
        std::fs::write(&src, b"pixels").unwrap();

        let dest = dir.path().join("assets/images/scene_000.png");
        let copied = atomic_copy(&src, &dest).unwrap();

        assert_eq!(copied, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"pixels");
    }

    #[test]
    fn relative_string_uses_forward_slashes() {
        let root = Path::new("/projects/demo");
        let path = root.join("assets").join("images").join("a.png");
        assert_eq!(to_relative_string(root, &path).unwrap(), "assets/images/a.png");
        assert!(to_relative_string(root, Path::new("/elsewhere/a.png")).is_err());
    }

    #[test]
    fn test_validate_path_id_component() {
        assert!(validate_path_id_component("01HXYZ123ABC", "projectId").is_ok());
        assert!(validate_path_id_component("my-story", "projectId").is_ok());
        assert!(validate_path_id_component("", "projectId").is_err());
        assert!(validate_path_id_component("../etc", "projectId").is_err());
        assert!(validate_path_id_component("a/b", "projectId").is_err());
        assert!(validate_path_id_component("C:", "projectId").is_err());
        assert!(validate_path_id_component("a\0b", "projectId").is_err());
    }

    #[test]
    fn project_lock_rejects_second_writer() {
        let dir = TempDir::new().unwrap();

        let first = ProjectLock::acquire(dir.path()).unwrap();
        let second = ProjectLock::acquire(dir.path());
        assert!(matches!(second, Err(CoreError::ProjectLocked(_))));

        drop(first);
        assert!(ProjectLock::acquire(dir.path()).is_ok());
    }
}
