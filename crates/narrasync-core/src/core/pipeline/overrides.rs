//! Per-scene edits accepted by `regenerate_scene`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::scenes::RerollTarget;
use crate::core::{AssetKind, CoreError, CoreResult};

/// User edits applied to one scene before it is regenerated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneOverrides {
    /// Replacement image prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Replacement narration text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_text: Option<String>,
    /// Assets to regenerate even though their inputs did not change
    #[serde(default)]
    pub reroll: RerollTarget,
    /// File to use as the scene image instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_upload: Option<PathBuf>,
    /// File to use as the narration instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_upload: Option<PathBuf>,
}

impl SceneOverrides {
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none()
            && self.voice_text.is_none()
            && self.reroll == RerollTarget::None
            && self.image_upload.is_none()
            && self.audio_upload.is_none()
    }

    /// Uploads paired with the asset kind they replace
    pub fn uploads(&self) -> Vec<(AssetKind, &PathBuf)> {
        let mut uploads = Vec::new();
        if let Some(path) = &self.image_upload {
            uploads.push((AssetKind::Image, path));
        }
        if let Some(path) = &self.audio_upload {
            uploads.push((AssetKind::Audio, path));
        }
        uploads
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.is_empty() {
            return Err(CoreError::ValidationError(
                "No changes given for scene regeneration".to_string(),
            ));
        }
        if self.prompt.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(CoreError::ValidationError(
                "Prompt must not be empty".to_string(),
            ));
        }
        if self.voice_text.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(CoreError::ValidationError(
                "Voice text must not be empty".to_string(),
            ));
        }
        for (kind, path) in self.uploads() {
            if !path.is_file() {
                return Err(CoreError::ValidationError(format!(
                    "{kind} upload not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_overrides_are_rejected() {
        assert!(SceneOverrides::default().is_empty());
        assert!(matches!(
            SceneOverrides::default().validate(),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let overrides = SceneOverrides {
            prompt: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());
    }

    #[test]
    fn missing_upload_is_rejected() {
        let overrides = SceneOverrides {
            image_upload: Some(PathBuf::from("/definitely/not/here.png")),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());
    }

    #[test]
    fn reroll_alone_is_a_change() {
        let overrides = SceneOverrides {
            reroll: RerollTarget::Voice,
            ..Default::default()
        };
        assert!(overrides.validate().is_ok());
    }
}
