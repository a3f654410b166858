//! Content fingerprints.
//!
//! A fingerprint is the sha256 of every input that determines an asset. Image
//! and audio are fingerprinted separately so a voice edit never invalidates
//! the image (and vice versa); the scene-level content fingerprint combines
//! both. Dirty markers share the same slot but can never equal a digest.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::core::config::GenerationConfig;
use crate::core::{AssetKind, CoreResult, Fingerprint};

use super::model::{DirtyReason, Scene};

/// Prefix of fingerprints that force regeneration
pub const DIRTY_PREFIX: &str = "dirty:";

// =============================================================================
// Generation Parameters
// =============================================================================

/// Style parameters that influence image output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleParams {
    pub preset: String,
    /// Resolved preset modifier plus custom style text
    pub style_text: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: String,
    pub negative_prompt: String,
    pub lora: Option<String>,
}

impl StyleParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            preset: config.image.style_preset.clone(),
            style_text: config.image.style_text(),
            width: config.image.resolution.width,
            height: config.image.resolution.height,
            aspect_ratio: config.image.aspect_ratio.clone(),
            negative_prompt: config.image.negative_prompt.clone(),
            lora: config
                .services
                .comfyui
                .lora_for(&config.image.style_preset)
                .map(str::to_string),
        }
    }
}

/// Voice parameters that influence narration output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceParams {
    pub speaker: String,
    pub speed_percent: u32,
}

impl VoiceParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            speaker: config.voice.speaker.clone(),
            speed_percent: config.voice.speed_percent,
        }
    }
}

// =============================================================================
// Digests
// =============================================================================

fn digest(fields: &[(&str, &str)]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (label, value) in fields {
        hasher.update(label.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of the inputs that produce a scene image
pub fn image_fingerprint(prompt: &str, backend: &str, style: &StyleParams) -> Fingerprint {
    let width = style.width.to_string();
    let height = style.height.to_string();
    digest(&[
        ("kind", "image"),
        ("prompt", prompt),
        ("backend", backend),
        ("preset", &style.preset),
        ("style", &style.style_text),
        ("width", &width),
        ("height", &height),
        ("aspect", &style.aspect_ratio),
        ("negative", &style.negative_prompt),
        ("lora", style.lora.as_deref().unwrap_or("")),
    ])
}

/// Fingerprint of the inputs that produce a scene narration
pub fn audio_fingerprint(voice_text: &str, backend: &str, voice: &VoiceParams) -> Fingerprint {
    let speed = voice.speed_percent.to_string();
    digest(&[
        ("kind", "audio"),
        ("text", voice_text),
        ("backend", backend),
        ("speaker", &voice.speaker),
        ("speed", &speed),
    ])
}

/// Scene-level fingerprint over the committed asset fingerprints
pub fn content_fingerprint(image: Option<&str>, audio: Option<&str>) -> Fingerprint {
    digest(&[
        ("image", image.unwrap_or("")),
        ("audio", audio.unwrap_or("")),
    ])
}

/// Generic digest over labelled parts, used for segment cache keys
pub fn combine(parts: &[(&str, &str)]) -> Fingerprint {
    digest(parts)
}

/// Placeholder fingerprint that never matches a computed digest
pub fn dirty_marker(reason: DirtyReason) -> Fingerprint {
    format!("{DIRTY_PREFIX}{}:{}", reason.label(), Ulid::new())
}

pub fn is_dirty_marker(fingerprint: &str) -> bool {
    fingerprint.starts_with(DIRTY_PREFIX)
}

/// sha256 of an in-memory payload
pub fn bytes_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// sha256 of a file, streamed
pub fn file_sha256(path: &Path) -> CoreResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// =============================================================================
// Staleness
// =============================================================================

/// Fingerprints a scene's assets should carry under the given configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredFingerprints {
    pub image: Fingerprint,
    pub audio: Fingerprint,
}

impl DesiredFingerprints {
    pub fn for_scene(scene: &Scene, config: &GenerationConfig) -> Self {
        Self {
            image: image_fingerprint(
                &scene.prompt,
                config.image.backend.id(),
                &StyleParams::from_config(config),
            ),
            audio: audio_fingerprint(
                &scene.voice_text,
                config.voice.backend.id(),
                &VoiceParams::from_config(config),
            ),
        }
    }

    pub fn get(&self, kind: AssetKind) -> &Fingerprint {
        match kind {
            AssetKind::Image => &self.image,
            AssetKind::Audio => &self.audio,
        }
    }
}

/// Asset kinds whose stored fingerprint differs from the desired one
pub fn stale_kinds(scene: &Scene, config: &GenerationConfig) -> Vec<AssetKind> {
    let desired = DesiredFingerprints::for_scene(scene, config);
    AssetKind::ALL
        .into_iter()
        .filter(|kind| {
            scene
                .asset(*kind)
                .is_none_or(|record| &record.fingerprint != desired.get(*kind))
        })
        .collect()
}

/// True when any asset of the scene must be regenerated
pub fn is_stale(scene: &Scene, config: &GenerationConfig) -> bool {
    !stale_kinds(scene, config).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenes::model::RerollTarget;

    fn style() -> StyleParams {
        StyleParams::from_config(&GenerationConfig::default())
    }

    #[test]
    fn image_fingerprint_is_deterministic_and_input_sensitive() {
        let a = image_fingerprint("castle", "comfyui", &style());
        let b = image_fingerprint("castle", "comfyui", &style());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, image_fingerprint("castle!", "comfyui", &style()));
        assert_ne!(a, image_fingerprint("castle", "midjourney", &style()));

        let mut wide = style();
        wide.width = 1280;
        assert_ne!(a, image_fingerprint("castle", "comfyui", &wide));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let voice = VoiceParams {
            speaker: "13".to_string(),
            speed_percent: 100,
        };
        let other = VoiceParams {
            speaker: "3".to_string(),
            speed_percent: 100,
        };
        assert_ne!(
            audio_fingerprint("abc1", "voicevox", &other),
            audio_fingerprint("abc", "voicevox", &voice)
        );
    }

    #[test]
    fn dirty_markers_are_unique_and_recognizable() {
        let a = dirty_marker(DirtyReason::Reroll(RerollTarget::Image));
        let b = dirty_marker(DirtyReason::Reroll(RerollTarget::Image));
        assert_ne!(a, b);
        assert!(is_dirty_marker(&a));
        assert!(a.starts_with("dirty:reroll:"));
        assert!(!is_dirty_marker(&bytes_sha256(b"x")));
    }

    #[test]
    fn unplanned_scene_is_stale_in_both_kinds() {
        let scene = Scene::new(0, "Once upon a time.");
        let config = GenerationConfig::default();
        assert_eq!(
            stale_kinds(&scene, &config),
            vec![AssetKind::Image, AssetKind::Audio]
        );
        assert!(is_stale(&scene, &config));
    }
}
