//! Shared type definitions for the NarraSync core.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Project identifier (ULID string)
pub type ProjectId = String;

/// Position of a scene in the story (zero-based, stable for the life of a project)
pub type SceneIndex = usize;

/// Stable identifier of a generator backend (e.g. "comfyui", "voicevox")
pub type BackendId = String;

/// Hex digest summarizing generation inputs, or a dirty marker
pub type Fingerprint = String;

// =============================================================================
// Time Types
// =============================================================================

/// Duration in milliseconds. Persisted state uses integer milliseconds only.
pub type DurationMs = u64;

// =============================================================================
// Asset Kinds
// =============================================================================

/// Kind of per-scene asset produced by a generator backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Audio,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::Image, AssetKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Audio => "audio",
        }
    }

    /// Directory (under `assets/`) holding files of this kind
    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Image => "images",
            AssetKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "img" => Ok(AssetKind::Image),
            "audio" | "voice" => Ok(AssetKind::Audio),
            other => Err(format!("Unknown asset kind: {other}")),
        }
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Output resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_kind_parses_aliases() {
        assert_eq!("image".parse::<AssetKind>().unwrap(), AssetKind::Image);
        assert_eq!("Voice".parse::<AssetKind>().unwrap(), AssetKind::Audio);
        assert!("video".parse::<AssetKind>().is_err());
    }

    #[test]
    fn asset_kind_serializes_snake_case() {
        let json = serde_json::to_string(&AssetKind::Audio).unwrap();
        assert_eq!(json, "\"audio\"");
    }
}
