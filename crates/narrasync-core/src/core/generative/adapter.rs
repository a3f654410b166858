//! Generator Adapter
//!
//! Uniform capability interface over heterogeneous generation backends.
//! An adapter writes exactly one asset file per successful call through the
//! [`AssetWriter`] it is handed and returns the reference; it never touches
//! project state. Committing the returned asset is the controller's decision.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::config::GenerationConfig;
use crate::core::scenes::{AssetRef, AssetWriter, StyleParams, VoiceParams};
use crate::core::{CoreError, CoreResult, FailureReason, SceneIndex};

// =============================================================================
// Capabilities
// =============================================================================

/// Operations a backend can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ImageGeneration,
    VoiceGeneration,
    Translation,
    PromptRewrite,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::ImageGeneration => write!(f, "image generation"),
            Capability::VoiceGeneration => write!(f, "voice generation"),
            Capability::Translation => write!(f, "translation"),
            Capability::PromptRewrite => write!(f, "prompt rewrite"),
        }
    }
}

// =============================================================================
// Backend Kinds
// =============================================================================

/// Closed set of supported backends. Adding a backend means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    ComfyUi,
    Midjourney,
    Voicevox,
    OpenAi,
}

impl BackendKind {
    /// Stable identifier, also mixed into asset fingerprints
    pub fn id(&self) -> &'static str {
        match self {
            BackendKind::ComfyUi => "comfyui",
            BackendKind::Midjourney => "midjourney",
            BackendKind::Voicevox => "voicevox",
            BackendKind::OpenAi => "openai",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            BackendKind::ComfyUi | BackendKind::Midjourney => &[Capability::ImageGeneration],
            BackendKind::Voicevox => &[Capability::VoiceGeneration],
            BackendKind::OpenAi => &[
                Capability::VoiceGeneration,
                Capability::Translation,
                Capability::PromptRewrite,
            ],
        }
    }

    pub fn supports_image(&self) -> bool {
        self.capabilities().contains(&Capability::ImageGeneration)
    }

    pub fn supports_voice(&self) -> bool {
        self.capabilities().contains(&Capability::VoiceGeneration)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comfyui" => Ok(BackendKind::ComfyUi),
            "midjourney" | "mj" => Ok(BackendKind::Midjourney),
            "voicevox" => Ok(BackendKind::Voicevox),
            "openai" | "openai_tts" => Ok(BackendKind::OpenAi),
            other => Err(format!("Unknown backend: {other}")),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Input for one image generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub scene: SceneIndex,
    /// Fully composed prompt (scene prompt plus style text)
    pub prompt: String,
    pub style: StyleParams,
}

/// Input for one narration call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceRequest {
    pub scene: SceneIndex,
    pub text: String,
    pub voice: VoiceParams,
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Capability interface implemented by every backend
#[async_trait]
pub trait GeneratorAdapter: Send + Sync {
    /// Backend identifier (matches [`BackendKind::id`] for real backends)
    fn backend_id(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability>;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn generate_image(
        &self,
        _request: &ImageRequest,
        _assets: &AssetWriter,
    ) -> CoreResult<AssetRef> {
        Err(unsupported(self.backend_id(), Capability::ImageGeneration))
    }

    async fn generate_voice(
        &self,
        _request: &VoiceRequest,
        _assets: &AssetWriter,
    ) -> CoreResult<AssetRef> {
        Err(unsupported(self.backend_id(), Capability::VoiceGeneration))
    }

    async fn translate(&self, _text: &str, _target_language: &str) -> CoreResult<String> {
        Err(unsupported(self.backend_id(), Capability::Translation))
    }

    /// Rewrites a prompt the image backend rejected on content-policy grounds.
    /// `attempt` starts at 0.
    async fn rewrite_prompt(&self, _prompt: &str, _attempt: u32) -> CoreResult<String> {
        Err(unsupported(self.backend_id(), Capability::PromptRewrite))
    }
}

/// Error returned for capabilities a backend does not offer
pub fn unsupported(backend: &str, capability: Capability) -> CoreError {
    CoreError::permanent(
        backend,
        FailureReason::Unsupported,
        format!("{backend} does not support {capability}"),
    )
}

// =============================================================================
// Backend Set
// =============================================================================

/// The adapters used for one project run
#[derive(Clone)]
pub struct Backends {
    pub image: Arc<dyn GeneratorAdapter>,
    pub voice: Arc<dyn GeneratorAdapter>,
    /// Translation and prompt rewriting; absent when no text backend is configured
    pub text: Option<Arc<dyn GeneratorAdapter>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("image", &self.image.backend_id())
            .field("voice", &self.voice.backend_id())
            .field("text", &self.text.as_ref().map(|t| t.backend_id().to_string()))
            .finish()
    }
}

impl Backends {
    /// Builds the configured backends.
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        let image = build_adapter(config.image.backend, config)?;
        let voice = build_adapter(config.voice.backend, config)?;
        let text = if config.services.openai.api_key.trim().is_empty() {
            None
        } else {
            Some(build_adapter(BackendKind::OpenAi, config)?)
        };
        Ok(Self { image, voice, text })
    }
}

/// Factory for a single backend
#[cfg(feature = "ai-providers")]
pub fn build_adapter(
    kind: BackendKind,
    config: &GenerationConfig,
) -> CoreResult<Arc<dyn GeneratorAdapter>> {
    use super::{ComfyUiAdapter, MidjourneyAdapter, OpenAiAdapter, VoicevoxAdapter};

    let adapter: Arc<dyn GeneratorAdapter> = match kind {
        BackendKind::ComfyUi => Arc::new(ComfyUiAdapter::from_config(config)?),
        BackendKind::Midjourney => Arc::new(MidjourneyAdapter::from_config(config)?),
        BackendKind::Voicevox => Arc::new(VoicevoxAdapter::from_config(config)?),
        BackendKind::OpenAi => Arc::new(OpenAiAdapter::from_config(config)?),
    };
    Ok(adapter)
}

/// Factory for a single backend
#[cfg(not(feature = "ai-providers"))]
pub fn build_adapter(
    kind: BackendKind,
    _config: &GenerationConfig,
) -> CoreResult<Arc<dyn GeneratorAdapter>> {
    Err(CoreError::ValidationError(format!(
        "Backend {kind} requires the `ai-providers` feature"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VoiceOnly;

    #[async_trait]
    impl GeneratorAdapter for VoiceOnly {
        fn backend_id(&self) -> &str {
            "voice-only"
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::VoiceGeneration]
        }
    }

    #[test]
    fn backend_kind_capabilities() {
        assert!(BackendKind::ComfyUi.supports_image());
        assert!(!BackendKind::ComfyUi.supports_voice());
        assert!(BackendKind::OpenAi.supports_voice());
        assert!(!BackendKind::Voicevox.supports_image());
    }

    #[test]
    fn backend_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&BackendKind::ComfyUi).unwrap();
        assert_eq!(json, "\"comfyui\"");
        let kind: BackendKind = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(kind, BackendKind::OpenAi);
        assert_eq!("openai_tts".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
    }

    #[tokio::test]
    async fn default_methods_report_unsupported() {
        let adapter = VoiceOnly;
        let err = adapter.translate("hello", "English").await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(
            err.backend_failure().unwrap().reason,
            FailureReason::Unsupported
        );
        assert!(adapter.supports(Capability::VoiceGeneration));
        assert!(!adapter.supports(Capability::ImageGeneration));
    }

    #[cfg(feature = "ai-providers")]
    #[test]
    fn from_config_wires_text_backend_only_with_key() {
        let mut config = GenerationConfig::default();
        let backends = Backends::from_config(&config).unwrap();
        assert_eq!(backends.image.backend_id(), "comfyui");
        assert_eq!(backends.voice.backend_id(), "voicevox");
        assert!(backends.text.is_none());

        config.services.openai.api_key = "sk-test".to_string();
        let backends = Backends::from_config(&config).unwrap();
        assert_eq!(backends.text.unwrap().backend_id(), "openai");
    }
}
