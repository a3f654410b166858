//! Character overlay and narration-driven mouth animation.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::config::CharacterConfig;
use crate::core::scenes::{file_sha256, resolve_relative};
use crate::core::{CoreError, CoreResult, DurationMs};

/// Span of a segment, in milliseconds from its start, during which the mouth is open
pub type MouthInterval = (DurationMs, DurationMs);

/// A resolved character overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterOverlay {
    /// Closed-mouth (or only) image
    pub image: PathBuf,
    pub open_mouth: Option<PathBuf>,
    pub max_px: u32,
    pub margin_right_px: u32,
    pub margin_bottom_px: u32,
    pub mouth_threshold_percent: u32,
    pub mouth_window_ms: u64,
    pub mouth_min_open_ms: u64,
    /// Hash over the image files, so replacing one re-renders every segment
    pub digest: String,
}

impl CharacterOverlay {
    /// Resolves the configured images against the project directory.
    ///
    /// A missing character image disables the overlay; a missing open-mouth
    /// image falls back to a static character. Both are logged.
    pub fn resolve(config: &CharacterConfig, root: &Path) -> CoreResult<Option<Self>> {
        let Some(image) = config.image.as_deref().map(|p| resolve_configured(root, p)) else {
            return Ok(None);
        };
        if !image.is_file() {
            warn!("Character image not found, skipping overlay: {}", image.display());
            return Ok(None);
        }

        let open_mouth = config
            .open_mouth_image
            .as_deref()
            .map(|p| resolve_configured(root, p))
            .filter(|path| {
                let exists = path.is_file();
                if !exists {
                    warn!("Open-mouth image not found, using a static character: {}", path.display());
                }
                exists
            });

        let mut digest = file_sha256(&image)?;
        if let Some(open) = &open_mouth {
            digest.push(':');
            digest.push_str(&file_sha256(open)?);
        }

        Ok(Some(Self {
            image,
            open_mouth,
            max_px: config.max_px,
            margin_right_px: config.margin_right_px,
            margin_bottom_px: config.margin_bottom_px,
            mouth_threshold_percent: config.mouth_threshold_percent,
            mouth_window_ms: config.mouth_window_ms,
            mouth_min_open_ms: config.mouth_min_open_ms,
            digest,
        }))
    }

    pub fn is_talking(&self) -> bool {
        self.open_mouth.is_some()
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}:{}|talk={}:{}:{}",
            self.digest,
            self.max_px,
            self.margin_right_px,
            self.margin_bottom_px,
            self.mouth_threshold_percent,
            self.mouth_window_ms,
            self.mouth_min_open_ms,
        )
    }

    /// Mouth-open spans for a narration file. Only WAV narration is analysed.
    pub fn mouth_intervals(&self, audio: &Path) -> CoreResult<Vec<MouthInterval>> {
        let (levels, duration_ms) = wav_levels(audio, self.mouth_window_ms)?;
        Ok(open_intervals(
            &levels,
            self.mouth_window_ms,
            duration_ms,
            self.mouth_threshold_percent,
            self.mouth_min_open_ms,
        ))
    }
}

fn resolve_configured(root: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        resolve_relative(root, &configured.replace('\\', "/"))
    }
}

/// RMS level (0.0..=1.0 of full scale) per `window_ms` window, plus the file's duration
fn wav_levels(audio: &Path, window_ms: u64) -> CoreResult<(Vec<f64>, DurationMs)> {
    let unreadable =
        |e: hound::Error| CoreError::ValidationError(format!("Unreadable WAV {}: {}", audio.display(), e));
    let mut reader = hound::WavReader::open(audio).map_err(unreadable)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Ok((Vec::new(), 0));
    }

    let samples: Vec<f64> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<Result<_, _>>()
            .map_err(unreadable)?,
        hound::SampleFormat::Int => {
            let full_scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f64;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| f64::from(v) / full_scale))
                .collect::<Result<_, _>>()
                .map_err(unreadable)?
        }
    };

    let channels = usize::from(spec.channels);
    let frames = samples.len() / channels;
    let duration_ms = frames as u64 * 1000 / u64::from(spec.sample_rate);
    let window_frames = ((u64::from(spec.sample_rate) * window_ms / 1000) as usize).max(1);

    let levels = samples
        .chunks(window_frames * channels)
        .map(|window| (window.iter().map(|s| s * s).sum::<f64>() / window.len() as f64).sqrt())
        .collect();
    Ok((levels, duration_ms))
}

/// Turns per-window levels into open-mouth spans, dropping runs shorter than `min_open_ms`
fn open_intervals(
    levels: &[f64],
    window_ms: u64,
    duration_ms: DurationMs,
    threshold_percent: u32,
    min_open_ms: u64,
) -> Vec<MouthInterval> {
    let threshold = f64::from(threshold_percent) / 100.0;
    let mut intervals = Vec::new();
    let mut run_start: Option<usize> = None;

    for (i, open) in levels
        .iter()
        .map(|level| *level > threshold)
        .chain(std::iter::once(false))
        .enumerate()
    {
        match (open, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let start_ms = start as u64 * window_ms;
                let end_ms = (i as u64 * window_ms).min(duration_ms);
                if end_ms.saturating_sub(start_ms) >= min_open_ms {
                    intervals.push((start_ms, end_ms));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    intervals
}
