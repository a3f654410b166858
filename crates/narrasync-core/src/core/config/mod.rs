//! Generation Configuration
//!
//! [`GenerationConfig`] is the immutable configuration threaded explicitly
//! through planning, generation and recomposition. It is loaded once from an
//! optional `config.json`, merged over defaults, overridden by `NARRA_*`
//! environment variables and normalized before use.
//!
//! Secrets (API keys) are read from file or environment but never serialized,
//! so a configuration embedded in project state never leaks credentials.

mod styles;

pub use styles::*;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::fs::atomic_write_json_pretty;
use crate::core::generative::BackendKind;
use crate::core::{CoreError, CoreResult, Resolution};

/// Default configuration file name
pub const CONFIG_FILE: &str = "config.json";

/// Negative prompt used when none is configured
pub const DEFAULT_NEGATIVE_PROMPT: &str = "text, watermark, bad quality, worst quality, low quality, illustration, 3d render, cartoon, anime, manga";

// =============================================================================
// Root Configuration
// =============================================================================

/// Complete generation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub font: FontConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

impl GenerationConfig {
    /// Loads configuration from `path`, falling back to defaults when the file is absent.
    ///
    /// Environment overrides are applied and the result is normalized.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<GenerationConfig>(&content).map_err(|e| {
                CoreError::ValidationError(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            info!("Config file {} not found, using defaults", path.display());
            GenerationConfig::default()
        };

        config.apply_overrides_from(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    /// Writes the normalized configuration atomically. Secrets are not written.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut normalized = self.clone();
        normalized.normalize();
        atomic_write_json_pretty(path, &normalized)
    }

    /// Applies `NARRA_*` overrides using the provided lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("NARRA_OPENAI_API_KEY") {
            self.services.openai.api_key = key;
        }
        if let Some(url) = non_empty("NARRA_OPENAI_BASE_URL") {
            self.services.openai.base_url = url;
        }
        if let Some(secret) = non_empty("NARRA_MIDJOURNEY_API_SECRET") {
            self.services.midjourney.api_secret = secret;
        }
        if let Some(url) = non_empty("NARRA_MIDJOURNEY_URL") {
            self.services.midjourney.url = url;
        }
        if let Some(url) = non_empty("NARRA_VOICEVOX_URL") {
            self.services.voicevox.url = url;
        }
        if let Some(url) = non_empty("NARRA_COMFYUI_URL") {
            self.services.comfyui.url = url;
        }
        if let Some(path) = non_empty("NARRA_FFMPEG_PATH") {
            self.video.ffmpeg_path = Some(path);
        }
    }

    /// Clamps out-of-range values and repairs inconsistent combinations.
    pub fn normalize(&mut self) {
        if !self.image.backend.supports_image() {
            warn!(
                "Backend {} cannot generate images, falling back to comfyui",
                self.image.backend
            );
            self.image.backend = BackendKind::ComfyUi;
        }
        if !self.voice.backend.supports_voice() {
            warn!(
                "Backend {} cannot generate voice, falling back to voicevox",
                self.voice.backend
            );
            self.voice.backend = BackendKind::Voicevox;
        }
        if self.image.resolution.width == 0 || self.image.resolution.height == 0 {
            self.image.resolution = Resolution::default();
        }
        if self.image.negative_prompt.trim().is_empty() {
            self.image.negative_prompt = DEFAULT_NEGATIVE_PROMPT.to_string();
        }
        if self.voice.backend == BackendKind::OpenAi
            && self.voice.speaker.chars().all(|c| c.is_ascii_digit())
        {
            self.voice.speaker = "alloy".to_string();
        }
        self.voice.speed_percent = self.voice.speed_percent.clamp(25, 400);

        self.segmentation.max_scene_chars = self.segmentation.max_scene_chars.max(1);

        self.video.fps = self.video.fps.clamp(1, 120);
        self.video.crf = self.video.crf.min(51);
        if !is_hex_rgb(&self.video.placeholder_color) {
            self.video.placeholder_color = default_placeholder_color();
        }
        let character = &mut self.video.character;
        character.max_px = character.max_px.clamp(16, 4096);
        character.mouth_threshold_percent = character.mouth_threshold_percent.clamp(1, 100);
        character.mouth_window_ms = character.mouth_window_ms.max(10);
        self.video.titles.retain(|title| {
            let keep = !title.text.trim().is_empty() && title.start_scene <= title.end_scene;
            if !keep {
                warn!("Dropping empty or inverted title {:?}", title.text);
            }
            keep
        });
        for title in &mut self.video.titles {
            title.size = title.size.clamp(6, 400);
            if !is_hex_rgb(&title.color) {
                title.color = default_font_color();
            }
        }

        self.font.size = self.font.size.clamp(6, 200);
        self.font.bg_opacity_percent = self.font.bg_opacity_percent.min(100);
        self.font.max_line_chars = self.font.max_line_chars.max(1);
        if !is_hex_rgb(&self.font.color) {
            self.font.color = default_font_color();
        }

        self.processing.max_attempts = self.processing.max_attempts.max(1);
        self.processing.scene_concurrency = self.processing.scene_concurrency.max(1);
        self.processing.backoff_percent = self.processing.backoff_percent.max(100);
        self.processing.attempt_timeout_ms = self.processing.attempt_timeout_ms.max(1);
    }
}

fn is_hex_rgb(value: &str) -> bool {
    value.len() == 6 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

// =============================================================================
// Image Configuration
// =============================================================================

/// Image generation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(default = "default_image_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_style_preset")]
    pub style_preset: String,
    #[serde(default)]
    pub custom_style: String,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            backend: default_image_backend(),
            style_preset: default_style_preset(),
            custom_style: String::new(),
            resolution: Resolution::default(),
            aspect_ratio: default_aspect_ratio(),
            negative_prompt: default_negative_prompt(),
        }
    }
}

impl ImageConfig {
    /// Style text appended to prompts: preset modifier followed by custom text
    pub fn style_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(modifier) = preset_modifier(&self.style_preset) {
            parts.push(modifier.to_string());
        }
        if !self.custom_style.trim().is_empty() {
            parts.push(self.custom_style.trim().to_string());
        }
        parts.join(", ")
    }
}

fn default_image_backend() -> BackendKind {
    BackendKind::ComfyUi
}

fn default_style_preset() -> String {
    "cinematic".to_string()
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

// =============================================================================
// Voice Configuration
// =============================================================================

/// Narration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    #[serde(default = "default_voice_backend")]
    pub backend: BackendKind,
    /// Speaker id (VOICEVOX style id) or voice name (OpenAI)
    #[serde(default = "default_speaker")]
    pub speaker: String,
    /// Speech speed, 100 = normal
    #[serde(default = "default_speed_percent")]
    pub speed_percent: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            backend: default_voice_backend(),
            speaker: default_speaker(),
            speed_percent: default_speed_percent(),
        }
    }
}

fn default_voice_backend() -> BackendKind {
    BackendKind::Voicevox
}

fn default_speaker() -> String {
    "13".to_string()
}

fn default_speed_percent() -> u32 {
    100
}

// =============================================================================
// Translation and Segmentation
// =============================================================================

/// Prompt derivation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationConfig {
    /// Translate scene text into the image prompt language
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_language: default_target_language(),
        }
    }
}

fn default_target_language() -> String {
    "English".to_string()
}

/// Text splitting settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationConfig {
    #[serde(default = "default_max_scene_chars")]
    pub max_scene_chars: usize,
    #[serde(default = "default_min_sentence_chars")]
    pub min_sentence_chars: usize,
    #[serde(default)]
    pub preserve_line_breaks: bool,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_scene_chars: default_max_scene_chars(),
            min_sentence_chars: default_min_sentence_chars(),
            preserve_line_breaks: false,
        }
    }
}

fn default_max_scene_chars() -> usize {
    80
}

fn default_min_sentence_chars() -> usize {
    10
}

// =============================================================================
// Video and Font Configuration
// =============================================================================

/// Recomposition settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Extra time each scene is held after its narration ends
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    /// Fade-in/out duration at scene boundaries (0 disables)
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Duration used for a scene whose narration is missing (placeholder mode)
    #[serde(default = "default_placeholder_duration_ms")]
    pub placeholder_duration_ms: u64,
    /// Fill colour (RRGGBB) for a scene whose image is missing
    #[serde(default = "default_placeholder_color")]
    pub placeholder_color: String,
    #[serde(default = "default_true")]
    pub burn_subtitles: bool,
    /// Explicit ffmpeg binary; ffprobe is expected alongside it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
    /// Character drawn in the bottom-right corner of every scene
    #[serde(default)]
    pub character: CharacterConfig,
    /// Title text shown over ranges of scenes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub titles: Vec<SceneTitle>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            hold_ms: default_hold_ms(),
            fade_ms: default_fade_ms(),
            video_codec: default_video_codec(),
            crf: default_crf(),
            preset: default_preset(),
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
            placeholder_duration_ms: default_placeholder_duration_ms(),
            placeholder_color: default_placeholder_color(),
            burn_subtitles: true,
            ffmpeg_path: None,
            character: CharacterConfig::default(),
            titles: Vec::new(),
        }
    }
}

fn default_fps() -> u32 {
    30
}

fn default_hold_ms() -> u64 {
    500
}

fn default_fade_ms() -> u64 {
    300
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_placeholder_duration_ms() -> u64 {
    3000
}

fn default_placeholder_color() -> String {
    "000000".to_string()
}

fn default_true() -> bool {
    true
}

/// Character overlay. Paths are absolute or relative to the project directory.
///
/// With `open_mouth_image` set, the character "talks": the open-mouth image
/// replaces `image` while the narration is louder than the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_mouth_image: Option<String>,
    /// Longest side of the scaled character
    #[serde(default = "default_character_max_px")]
    pub max_px: u32,
    #[serde(default = "default_character_margin_right_px")]
    pub margin_right_px: u32,
    #[serde(default = "default_character_margin_bottom_px")]
    pub margin_bottom_px: u32,
    /// Narration RMS level (percent of full scale) that opens the mouth
    #[serde(default = "default_mouth_threshold_percent")]
    pub mouth_threshold_percent: u32,
    /// Volume analysis window
    #[serde(default = "default_mouth_window_ms")]
    pub mouth_window_ms: u64,
    /// Open-mouth runs shorter than this stay closed
    #[serde(default = "default_mouth_min_open_ms")]
    pub mouth_min_open_ms: u64,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            image: None,
            open_mouth_image: None,
            max_px: default_character_max_px(),
            margin_right_px: default_character_margin_right_px(),
            margin_bottom_px: default_character_margin_bottom_px(),
            mouth_threshold_percent: default_mouth_threshold_percent(),
            mouth_window_ms: default_mouth_window_ms(),
            mouth_min_open_ms: default_mouth_min_open_ms(),
        }
    }
}

fn default_character_max_px() -> u32 {
    500
}

fn default_character_margin_right_px() -> u32 {
    20
}

fn default_character_margin_bottom_px() -> u32 {
    10
}

fn default_mouth_threshold_percent() -> u32 {
    20
}

fn default_mouth_window_ms() -> u64 {
    150
}

fn default_mouth_min_open_ms() -> u64 {
    150
}

/// Title shown while scenes `start_scene..=end_scene` are on screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneTitle {
    pub text: String,
    pub start_scene: usize,
    pub end_scene: usize,
    /// Text colour as RRGGBB
    #[serde(default = "default_font_color")]
    pub color: String,
    #[serde(default = "default_title_size")]
    pub size: u32,
    /// Left edge of the text in pixels
    #[serde(default = "default_title_x")]
    pub x: u32,
    /// Top edge of the text in pixels
    #[serde(default = "default_title_y")]
    pub y: u32,
}

impl SceneTitle {
    pub fn covers(&self, scene: usize) -> bool {
        (self.start_scene..=self.end_scene).contains(&scene)
    }
}

fn default_title_size() -> u32 {
    48
}

fn default_title_x() -> u32 {
    40
}

fn default_title_y() -> u32 {
    40
}

/// Subtitle font settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontConfig {
    #[serde(default = "default_font_name")]
    pub name: String,
    #[serde(default = "default_font_size")]
    pub size: u32,
    /// Text colour as RRGGBB
    #[serde(default = "default_font_color")]
    pub color: String,
    #[serde(default = "default_bg_opacity_percent")]
    pub bg_opacity_percent: u32,
    #[serde(default = "default_max_line_chars")]
    pub max_line_chars: usize,
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            name: default_font_name(),
            size: default_font_size(),
            color: default_font_color(),
            bg_opacity_percent: default_bg_opacity_percent(),
            max_line_chars: default_max_line_chars(),
        }
    }
}

fn default_font_name() -> String {
    "UD Digi Kyokasho N-B".to_string()
}

fn default_font_size() -> u32 {
    18
}

fn default_font_color() -> String {
    "FFFFFF".to_string()
}

fn default_bg_opacity_percent() -> u32 {
    50
}

fn default_max_line_chars() -> usize {
    25
}

// =============================================================================
// Processing Configuration
// =============================================================================

/// Retry, timeout and concurrency settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    /// Total attempts per backend call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Growth factor between consecutive delays, 150 = x1.5
    #[serde(default = "default_backoff_percent")]
    pub backoff_percent: u32,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Hard deadline for a single backend attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_scene_concurrency")]
    pub scene_concurrency: usize,
    /// Prompt rewrites tried after a content-policy rejection
    #[serde(default = "default_content_rewrite_attempts")]
    pub content_rewrite_attempts: u32,
    /// Previous assets kept per scene and kind for rollback
    #[serde(default = "default_asset_history_depth")]
    pub asset_history_depth: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            backoff_percent: default_backoff_percent(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            scene_concurrency: default_scene_concurrency(),
            content_rewrite_attempts: default_content_rewrite_attempts(),
            asset_history_depth: default_asset_history_depth(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_percent() -> u32 {
    150
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_ms() -> u64 {
    180_000
}

fn default_scene_concurrency() -> usize {
    num_cpus::get().max(2)
}

fn default_content_rewrite_attempts() -> u32 {
    2
}

fn default_asset_history_depth() -> usize {
    5
}

// =============================================================================
// Service Endpoints
// =============================================================================

/// Backend endpoints and credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesConfig {
    #[serde(default)]
    pub voicevox: VoicevoxService,
    #[serde(default)]
    pub comfyui: ComfyUiService,
    #[serde(default)]
    pub midjourney: MidjourneyService,
    #[serde(default)]
    pub openai: OpenAiService,
    /// Timeout for individual HTTP requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            voicevox: VoicevoxService::default(),
            comfyui: ComfyUiService::default(),
            midjourney: MidjourneyService::default(),
            openai: OpenAiService::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// VOICEVOX engine endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicevoxService {
    #[serde(default = "default_voicevox_url")]
    pub url: String,
}

impl Default for VoicevoxService {
    fn default() -> Self {
        Self {
            url: default_voicevox_url(),
        }
    }
}

fn default_voicevox_url() -> String {
    "http://localhost:50021".to_string()
}

/// ComfyUI endpoint and workflow wiring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComfyUiService {
    #[serde(default = "default_comfyui_url")]
    pub url: String,
    /// API-format workflow JSON; the built-in text-to-image graph is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<String>,
    #[serde(default = "default_positive_node")]
    pub positive_node: String,
    #[serde(default = "default_negative_node")]
    pub negative_node: String,
    #[serde(default = "default_sampler_node")]
    pub sampler_node: String,
    #[serde(default = "default_latent_node")]
    pub latent_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_node: Option<String>,
    #[serde(default = "default_style_lora_map")]
    pub style_loras: BTreeMap<String, String>,
    #[serde(default = "default_comfyui_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ComfyUiService {
    fn default() -> Self {
        Self {
            url: default_comfyui_url(),
            workflow_path: None,
            positive_node: default_positive_node(),
            negative_node: default_negative_node(),
            sampler_node: default_sampler_node(),
            latent_node: default_latent_node(),
            lora_node: None,
            style_loras: default_style_lora_map(),
            poll_interval_ms: default_comfyui_poll_ms(),
        }
    }
}

impl ComfyUiService {
    /// LoRA file for a style preset, if one is configured and a LoRA node exists
    pub fn lora_for(&self, preset: &str) -> Option<&str> {
        self.lora_node.as_ref()?;
        self.style_loras
            .get(&preset.trim().to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn default_comfyui_url() -> String {
    "http://localhost:8188".to_string()
}

fn default_positive_node() -> String {
    "6".to_string()
}

fn default_negative_node() -> String {
    "7".to_string()
}

fn default_sampler_node() -> String {
    "3".to_string()
}

fn default_latent_node() -> String {
    "5".to_string()
}

fn default_style_lora_map() -> BTreeMap<String, String> {
    default_style_loras()
}

fn default_comfyui_poll_ms() -> u64 {
    1000
}

/// Midjourney proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidjourneyService {
    #[serde(default = "default_midjourney_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    #[serde(default = "default_midjourney_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MidjourneyService {
    fn default() -> Self {
        Self {
            url: default_midjourney_url(),
            api_secret: String::new(),
            poll_interval_ms: default_midjourney_poll_ms(),
        }
    }
}

fn default_midjourney_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_midjourney_poll_ms() -> u64 {
    5000
}

/// OpenAI-compatible endpoint for TTS, translation and prompt rewriting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiService {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
}

impl Default for OpenAiService {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: String::new(),
            chat_model: default_chat_model(),
            tts_model: default_tts_model(),
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_tts_model() -> String {
    "gpt-4o-mini-tts".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = GenerationConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.processing.max_attempts, 3);
        assert_eq!(config.font.size, 18);
        assert_eq!(config.services.voicevox.url, "http://localhost:50021");
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"image":{"backend":"midjourney","stylePreset":"anime"},"unknownSection":{"x":1}}"#,
        )
        .unwrap();

        let config = GenerationConfig::load(&path).unwrap();
        assert_eq!(config.image.backend, BackendKind::Midjourney);
        assert_eq!(config.image.style_preset, "anime");
        assert_eq!(config.image.aspect_ratio, "16:9");
        assert_eq!(config.voice.backend, BackendKind::Voicevox);
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            GenerationConfig::load(&path),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn env_overrides_replace_endpoints_and_secrets() {
        let mut config = GenerationConfig::default();
        config.apply_overrides_from(|key| match key {
            "NARRA_OPENAI_API_KEY" => Some("sk-test".to_string()),
            "NARRA_VOICEVOX_URL" => Some("http://voicevox:50021".to_string()),
            "NARRA_COMFYUI_URL" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config.services.openai.api_key, "sk-test");
        assert_eq!(config.services.voicevox.url, "http://voicevox:50021");
        assert_eq!(config.services.comfyui.url, "http://localhost:8188");
    }

    #[test]
    fn normalize_clamps_and_repairs() {
        let mut config = GenerationConfig::default();
        config.image.backend = BackendKind::Voicevox;
        config.voice.backend = BackendKind::OpenAi;
        config.processing.max_attempts = 0;
        config.processing.scene_concurrency = 0;
        config.font.bg_opacity_percent = 250;
        config.font.color = "white".to_string();
        config.image.resolution = Resolution { width: 0, height: 10 };

        config.normalize();

        assert_eq!(config.image.backend, BackendKind::ComfyUi);
        assert_eq!(config.voice.speaker, "alloy");
        assert_eq!(config.processing.max_attempts, 1);
        assert_eq!(config.processing.scene_concurrency, 1);
        assert_eq!(config.font.bg_opacity_percent, 100);
        assert_eq!(config.font.color, "FFFFFF");
        assert_eq!(config.image.resolution, Resolution::default());
    }

    #[test]
    fn normalize_drops_unusable_titles() {
        let mut config = GenerationConfig::default();
        let title = |text: &str, start, end| SceneTitle {
            text: text.to_string(),
            start_scene: start,
            end_scene: end,
            color: "red".to_string(),
            size: 1000,
            x: 0,
            y: 0,
        };
        config.video.titles = vec![title("Chapter 1", 0, 2), title("  ", 0, 1), title("Late", 3, 1)];
        config.video.character.mouth_threshold_percent = 0;

        config.normalize();

        assert_eq!(config.video.titles.len(), 1);
        let kept = &config.video.titles[0];
        assert_eq!(kept.color, "FFFFFF");
        assert_eq!(kept.size, 400);
        assert!(kept.covers(2) && !kept.covers(3));
        assert_eq!(config.video.character.mouth_threshold_percent, 1);
    }

    #[test]
    fn secrets_are_never_serialized() {
        let mut config = GenerationConfig::default();
        config.services.openai.api_key = "sk-secret".to_string();
        config.services.midjourney.api_secret = "mj-secret".to_string();

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("mj-secret"));
    }

    #[test]
    fn style_text_combines_preset_and_custom() {
        let mut image = ImageConfig::default();
        image.style_preset = "anime".to_string();
        image.custom_style = "rainy night".to_string();
        assert_eq!(
            image.style_text(),
            "anime style, vibrant colors, clean lines, expressive, rainy night"
        );
    }
}
