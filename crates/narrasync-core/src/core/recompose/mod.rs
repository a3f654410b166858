//! Video Recomposer
//!
//! Assembles the final video from the committed per-scene assets. Each scene
//! becomes one rendered segment; segments are then joined in scene order.
//! In incremental mode a segment is reused when its fingerprint matches the
//! last manifest and the file is still on disk, so only edited scenes are
//! re-rendered before the final concat.
//!
//! Segments can carry a bottom-right character (optionally lip-synced to the
//! narration volume) and per-scene title text; both are part of a segment's
//! fingerprint.

mod overlay;

pub use overlay::*;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::core::config::{FontConfig, GenerationConfig, SceneTitle};
use crate::core::fs::{atomic_write_bytes, to_relative_string};
use crate::core::scenes::{
    combine, resolve_relative, AssetRecord, RecompositionManifest, Scene, SceneStore,
    SegmentRecord,
};
use crate::core::subtitles::{export_srt, wrap_subtitle_lines, SubtitleCue};
use crate::core::{CoreError, CoreResult, DurationMs, SceneIndex};

/// Final video file name inside the output directory
pub const OUTPUT_VIDEO: &str = "final.mp4";
/// Subtitle sidecar written next to the final video
pub const OUTPUT_SUBTITLES: &str = "final.srt";

// =============================================================================
// Encoder Contract
// =============================================================================

/// Everything needed to render one scene segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentClip {
    pub scene: SceneIndex,
    /// `None` renders a solid placeholder frame
    pub image: Option<PathBuf>,
    /// `None` renders silence
    pub audio: Option<PathBuf>,
    pub subtitle: String,
    /// Narration length, before the hold padding
    pub narration_ms: DurationMs,
    /// When the talking character's mouth is open
    pub mouth_open: Vec<MouthInterval>,
}

impl SegmentClip {
    /// On-screen length of the segment
    pub fn duration_ms(&self, settings: &RenderSettings) -> DurationMs {
        self.narration_ms + settings.hold_ms
    }
}

/// Render parameters taken from the project configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub hold_ms: DurationMs,
    pub fade_ms: DurationMs,
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub placeholder_duration_ms: DurationMs,
    pub placeholder_color: String,
    pub burn_subtitles: bool,
    pub font: FontConfig,
    pub character: Option<CharacterOverlay>,
    pub titles: Vec<SceneTitle>,
}

impl RenderSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        let video = &config.video;
        Self {
            width: config.image.resolution.width,
            height: config.image.resolution.height,
            fps: video.fps.max(1),
            hold_ms: video.hold_ms,
            fade_ms: video.fade_ms,
            video_codec: video.video_codec.clone(),
            crf: video.crf,
            preset: video.preset.clone(),
            audio_codec: video.audio_codec.clone(),
            audio_bitrate: video.audio_bitrate.clone(),
            placeholder_duration_ms: video.placeholder_duration_ms,
            placeholder_color: video.placeholder_color.trim_start_matches('#').to_string(),
            burn_subtitles: video.burn_subtitles,
            font: config.font.clone(),
            character: None,
            titles: video.titles.clone(),
        }
    }

    /// Settings for a project, with the character overlay resolved against `root`
    pub fn for_project(config: &GenerationConfig, root: &Path) -> CoreResult<Self> {
        let mut settings = Self::from_config(config);
        settings.character = CharacterOverlay::resolve(&config.video.character, root)?;
        Ok(settings)
    }

    /// Titles on screen during `scene`
    pub fn titles_for(&self, scene: SceneIndex) -> Vec<&SceneTitle> {
        self.titles.iter().filter(|t| t.covers(scene)).collect()
    }

    /// [`Self::cache_key`] plus the titles shown over `scene`
    pub fn cache_key_for(&self, scene: SceneIndex) -> String {
        let titles: Vec<String> = self
            .titles_for(scene)
            .into_iter()
            .map(|t| format!("{}:{}:{}:{}:{}", t.text, t.color, t.size, t.x, t.y))
            .collect();
        format!("{}|titles={}", self.cache_key(), titles.join(";"))
    }

    /// Stable string over every setting that changes rendered output
    pub fn cache_key(&self) -> String {
        format!(
            "{}x{}@{}|hold={}|fade={}|v={}:{}:{}|a={}:{}|ph={}:{}|subs={}|font={}:{}:{}:{}:{}|character={}",
            self.width,
            self.height,
            self.fps,
            self.hold_ms,
            self.fade_ms,
            self.video_codec,
            self.crf,
            self.preset,
            self.audio_codec,
            self.audio_bitrate,
            self.placeholder_duration_ms,
            self.placeholder_color,
            self.burn_subtitles,
            self.font.name,
            self.font.size,
            self.font.color,
            self.font.bg_opacity_percent,
            self.font.max_line_chars,
            self.character
                .as_ref()
                .map_or_else(|| "none".to_string(), CharacterOverlay::cache_key),
        )
    }
}

/// Encoder the recomposer drives; it never needs to know which one it has
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    /// Length of an audio file in milliseconds
    async fn probe_duration(&self, media: &Path) -> CoreResult<DurationMs>;

    /// Renders one segment to `output`
    async fn render_segment(
        &self,
        clip: &SegmentClip,
        settings: &RenderSettings,
        output: &Path,
    ) -> CoreResult<()>;

    /// Joins rendered segments, in order, into `output`
    async fn concat(&self, segments: &[PathBuf], output: &Path) -> CoreResult<()>;
}

// =============================================================================
// Recomposer
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomposeOptions {
    /// Reuse segments whose inputs did not change since the last run
    pub incremental: bool,
    /// Render placeholders for scenes without committed assets instead of failing
    pub allow_placeholders: bool,
}

/// The finished video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAssetRef {
    pub path: PathBuf,
    pub duration_ms: DurationMs,
    pub rendered_scenes: Vec<SceneIndex>,
    pub reused_scenes: Vec<SceneIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles_path: Option<PathBuf>,
}

/// Builds the final video from a consistent snapshot of the store
pub struct VideoRecomposer {
    store: Arc<SceneStore>,
    encoder: Arc<dyn VideoEncoder>,
}

impl std::fmt::Debug for VideoRecomposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoRecomposer")
            .field("root", &self.store.root())
            .finish_non_exhaustive()
    }
}

impl VideoRecomposer {
    pub fn new(store: Arc<SceneStore>, encoder: Arc<dyn VideoEncoder>) -> Self {
        Self { store, encoder }
    }

    pub async fn recompose(&self, options: RecomposeOptions) -> CoreResult<VideoAssetRef> {
        let state = self.store.snapshot().await;
        if state.scenes.is_empty() {
            return Err(CoreError::ValidationError(
                "Project has no scenes to recompose".to_string(),
            ));
        }

        let incomplete = state.incomplete_scenes();
        if !incomplete.is_empty() {
            if !options.allow_placeholders {
                return Err(CoreError::Recomposition { incomplete });
            }
            warn!(scenes = ?incomplete, "Recomposing with placeholders");
        }

        let root = self.store.root().to_path_buf();
        let settings = RenderSettings::for_project(&state.config, &root)?;
        let previous = if options.incremental {
            state.recomposition.as_ref()
        } else {
            None
        };

        let segments_dir = self.store.segments_dir();
        let mut records = Vec::with_capacity(state.scenes.len());
        let mut segment_paths = Vec::with_capacity(state.scenes.len());
        let mut cues = Vec::new();
        let mut rendered_scenes = Vec::new();
        let mut reused_scenes = Vec::new();
        let mut offset: DurationMs = 0;

        for scene in &state.scenes {
            let fingerprint = segment_fingerprint(scene, &settings.cache_key_for(scene.index));
            let reusable = previous
                .and_then(|manifest| manifest.segment(scene.index))
                .filter(|record| record.fingerprint == fingerprint)
                .filter(|record| resolve_relative(&root, &record.path).is_file());

            let record = match reusable {
                Some(record) => {
                    debug!(scene = scene.index, "Reusing rendered segment");
                    reused_scenes.push(scene.index);
                    record.clone()
                }
                None => {
                    let clip = self.clip_for(scene, &settings).await?;
                    let path = segments_dir.join(format!(
                        "scene_{:03}-{}.mp4",
                        scene.index,
                        Ulid::new()
                    ));
                    self.encoder
                        .render_segment(&clip, &settings, &path)
                        .await?;
                    debug!(scene = scene.index, path = %path.display(), "Rendered segment");
                    rendered_scenes.push(scene.index);
                    SegmentRecord {
                        scene: scene.index,
                        fingerprint,
                        path: to_relative_string(&root, &path)?,
                        duration_ms: clip.duration_ms(&settings),
                    }
                }
            };

            let end = offset + record.duration_ms;
            let text = wrap_subtitle_lines(&scene.text, settings.font.max_line_chars).join("\n");
            if !text.is_empty() {
                cues.push(SubtitleCue::new(offset, end, text));
            }
            offset = end;
            segment_paths.push(resolve_relative(&root, &record.path));
            records.push(record);
        }

        let output_dir = self.store.output_dir();
        let output = output_dir.join(OUTPUT_VIDEO);
        let partial = output_dir.join(format!("final.{}.partial.mp4", Ulid::new()));
        if let Err(e) = self.encoder.concat(&segment_paths, &partial).await {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &output)?;

        let subtitles_path = output_dir.join(OUTPUT_SUBTITLES);
        atomic_write_bytes(&subtitles_path, export_srt(&cues).as_bytes())?;

        let manifest = RecompositionManifest {
            output: to_relative_string(&root, &output)?,
            subtitles: Some(to_relative_string(&root, &subtitles_path)?),
            segments: records,
            duration_ms: offset,
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store
            .update(move |state| {
                state.recomposition = Some(manifest);
                Ok(())
            })
            .await?;

        info!(
            rendered = rendered_scenes.len(),
            reused = reused_scenes.len(),
            duration_ms = offset,
            "Recomposed video"
        );

        Ok(VideoAssetRef {
            path: output,
            duration_ms: offset,
            rendered_scenes,
            reused_scenes,
            subtitles_path: Some(subtitles_path),
        })
    }

    async fn clip_for(&self, scene: &Scene, settings: &RenderSettings) -> CoreResult<SegmentClip> {
        let assets = self.store.assets();
        let image = scene.image.as_ref().map(|r| assets.resolve(&r.asset));
        let audio = scene.audio.as_ref().map(|r| assets.resolve(&r.asset));

        let narration_ms = match (&scene.audio, &audio) {
            (Some(record), Some(path)) => match record.asset.duration_ms {
                Some(duration) => duration,
                None => self.encoder.probe_duration(path).await?,
            },
            _ => settings.placeholder_duration_ms,
        };

        let mouth_open = match (&settings.character, &audio) {
            (Some(character), Some(path)) if character.is_talking() => {
                character.mouth_intervals(path).unwrap_or_else(|e| {
                    warn!(scene = scene.index, "Character will not talk: {}", e);
                    Vec::new()
                })
            }
            _ => Vec::new(),
        };

        Ok(SegmentClip {
            scene: scene.index,
            image,
            audio,
            subtitle: scene.text.clone(),
            narration_ms,
            mouth_open,
        })
    }
}

/// Cache key of a rendered segment: scene content, exact asset bytes, subtitle and render settings
pub fn segment_fingerprint(scene: &Scene, settings_key: &str) -> String {
    let sha = |record: Option<&AssetRecord>| {
        record.map(|r| r.asset.sha256.clone()).unwrap_or_default()
    };
    let image = sha(scene.image.as_ref());
    let audio = sha(scene.audio.as_ref());
    combine(&[
        ("content", scene.content_fingerprint.as_deref().unwrap_or("")),
        ("image", &image),
        ("audio", &audio),
        ("subtitle", &scene.text),
        ("complete", if scene.is_complete() { "1" } else { "0" }),
        ("settings", settings_key),
    ])
}

// =============================================================================
// Recording Encoder
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Encoder that writes marker files instead of video and records what it was asked to do
#[derive(Debug)]
pub struct RecordingEncoder {
    probe_ms: DurationMs,
    renders: Mutex<Vec<SegmentClip>>,
    concats: Mutex<Vec<Vec<PathBuf>>>,
}

impl Default for RecordingEncoder {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl RecordingEncoder {
    /// `probe_ms` is returned for every probed file
    pub fn new(probe_ms: DurationMs) -> Self {
        Self {
            probe_ms,
            renders: Mutex::new(Vec::new()),
            concats: Mutex::new(Vec::new()),
        }
    }

    pub fn renders(&self) -> Vec<SegmentClip> {
        lock(&self.renders).clone()
    }

    pub fn rendered_scenes(&self) -> Vec<SceneIndex> {
        lock(&self.renders).iter().map(|c| c.scene).collect()
    }

    pub fn concats(&self) -> Vec<Vec<PathBuf>> {
        lock(&self.concats).clone()
    }
}

#[async_trait]
impl VideoEncoder for RecordingEncoder {
    async fn probe_duration(&self, _media: &Path) -> CoreResult<DurationMs> {
        Ok(self.probe_ms)
    }

    async fn render_segment(
        &self,
        clip: &SegmentClip,
        settings: &RenderSettings,
        output: &Path,
    ) -> CoreResult<()> {
        let marker = format!("segment {} {}ms", clip.scene, clip.duration_ms(settings));
        atomic_write_bytes(output, marker.as_bytes())?;
        lock(&self.renders).push(clip.clone());
        Ok(())
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> CoreResult<()> {
        let mut joined = Vec::new();
        for segment in segments {
            joined.extend(std::fs::read(segment)?);
            joined.push(b'\n');
        }
        atomic_write_bytes(output, &joined)?;
        lock(&self.concats).push(segments.to_vec());
        Ok(())
    }
}
