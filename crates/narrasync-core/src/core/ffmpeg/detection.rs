//! FFmpeg Detection Module
//!
//! Locates ffmpeg/ffprobe: an explicitly configured binary first, then common
//! install locations, then `which`/`where`.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::{FFmpegError, FFmpegResult};

/// Information about detected FFmpeg installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegInfo {
    /// Path to ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_path: PathBuf,
    /// FFmpeg version string
    pub version: String,
}

#[cfg(target_os = "windows")]
fn binary_name(tool: &str) -> String {
    format!("{tool}.exe")
}

#[cfg(not(target_os = "windows"))]
fn binary_name(tool: &str) -> String {
    tool.to_string()
}

/// Detects FFmpeg, preferring `configured` when set.
///
/// A configured ffmpeg binary expects ffprobe in the same directory and
/// falls back to the system ffprobe otherwise.
pub fn detect_ffmpeg(configured: Option<&str>) -> FFmpegResult<FFmpegInfo> {
    let Some(configured) = configured.map(str::trim).filter(|p| !p.is_empty()) else {
        return detect_system_ffmpeg();
    };

    let ffmpeg_path = PathBuf::from(configured);
    if !ffmpeg_path.is_file() {
        return Err(FFmpegError::NotFound);
    }
    let sibling = ffmpeg_path
        .parent()
        .map(|dir| dir.join(binary_name("ffprobe")))
        .filter(|p| p.is_file());
    let ffprobe_path = match sibling {
        Some(path) => path,
        None => which_binary("ffprobe")?,
    };
    let version = get_ffmpeg_version(&ffmpeg_path)?;

    Ok(FFmpegInfo {
        ffmpeg_path,
        ffprobe_path,
        version,
    })
}

/// Detect FFmpeg from system PATH
pub fn detect_system_ffmpeg() -> FFmpegResult<FFmpegInfo> {
    let ffmpeg_path = which_binary("ffmpeg")?;
    let ffprobe_path = which_binary("ffprobe")?;
    let version = get_ffmpeg_version(&ffmpeg_path)?;

    Ok(FFmpegInfo {
        ffmpeg_path,
        ffprobe_path,
        version,
    })
}

/// Finds a binary in common locations, then through `which`/`where`
fn which_binary(tool: &str) -> FFmpegResult<PathBuf> {
    let name = binary_name(tool);
    for dir in get_common_ffmpeg_paths() {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    #[cfg(target_os = "windows")]
    let finder = "where";
    #[cfg(not(target_os = "windows"))]
    let finder = "which";

    let output = Command::new(finder)
        .arg(tool)
        .output()
        .map_err(|_| FFmpegError::NotFound)?;
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(first_line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            return Ok(PathBuf::from(first_line));
        }
    }

    Err(FFmpegError::NotFound)
}

/// Get common FFmpeg installation paths for the current platform
fn get_common_ffmpeg_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\ffmpeg\bin"));
        paths.push(PathBuf::from(r"C:\Program Files\ffmpeg\bin"));

        // Chocolatey installation
        if let Ok(programdata) = std::env::var("ProgramData") {
            paths.push(PathBuf::from(programdata).join("chocolatey").join("bin"));
        }

        // Scoop installation
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("scoop").join("shims"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        // Homebrew paths
        paths.push(PathBuf::from("/opt/homebrew/bin"));
        paths.push(PathBuf::from("/usr/local/bin"));
        paths.push(PathBuf::from("/opt/local/bin")); // MacPorts
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/bin"));
        paths.push(PathBuf::from("/usr/local/bin"));
        paths.push(PathBuf::from("/snap/bin"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".local").join("bin"));
        }
    }

    paths
}

/// Parses "ffmpeg version X.Y.Z ..." out of `-version` output
pub fn parse_ffmpeg_version(output: &str) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }
    let version = first_line
        .strip_prefix("ffmpeg version ")
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or(first_line);
    Some(version.to_string())
}

fn get_ffmpeg_version(ffmpeg_path: &Path) -> FFmpegResult<String> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(FFmpegError::ProcessError)?;

    if !output.status.success() {
        return Err(FFmpegError::ExecutionFailed(
            "Failed to get FFmpeg version".to_string(),
        ));
    }

    parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| FFmpegError::ParseError("Could not parse FFmpeg version".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_paths_not_empty() {
        let paths = get_common_ffmpeg_paths();
        assert!(!paths.is_empty());
    }

    #[test]
    fn version_line_is_parsed() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023\nbuilt with gcc"),
            Some("6.1.1-3ubuntu5".to_string())
        );
        assert_eq!(
            parse_ffmpeg_version("custom build\n"),
            Some("custom build".to_string())
        );
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn missing_configured_binary_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("ffmpeg");
        assert!(matches!(
            detect_ffmpeg(Some(missing.to_str().unwrap())),
            Err(FFmpegError::NotFound)
        ));
    }
}
