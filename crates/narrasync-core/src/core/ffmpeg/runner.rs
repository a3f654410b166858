//! FFmpeg Runner Module
//!
//! [`FfmpegEncoder`] implements the recomposer's [`VideoEncoder`] contract by
//! shelling out to ffmpeg/ffprobe. Argument lists are built by pure functions
//! so they can be checked without a binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{detect_ffmpeg, FFmpegError, FFmpegInfo, FFmpegResult};
use crate::core::fs::atomic_write_bytes;
use crate::core::recompose::{MouthInterval, RenderSettings, SegmentClip, VideoEncoder};
use crate::core::subtitles::{ass_force_style, export_srt, wrap_subtitle_lines, SubtitleCue};
use crate::core::{CoreResult, DurationMs};

/// Sample rate of every rendered segment, so the concat demuxer can copy streams
const SEGMENT_SAMPLE_RATE: &str = "44100";

const MAX_STDERR_CHARS: usize = 500;

/// Video encoder backed by an FFmpeg installation
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    info: Arc<FFmpegInfo>,
}

impl FfmpegEncoder {
    pub fn new(info: FFmpegInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    /// Detects FFmpeg, preferring an explicitly configured binary
    pub fn detect(configured: Option<&str>) -> FFmpegResult<Self> {
        Ok(Self::new(detect_ffmpeg(configured)?))
    }

    pub fn info(&self) -> &FFmpegInfo {
        &self.info
    }

    async fn run_ffmpeg(&self, args: &[String], context: &str) -> FFmpegResult<()> {
        debug!(context, args = ?args, "Running ffmpeg");
        let output = tokio::process::Command::new(&self.info.ffmpeg_path)
            .args(args)
            .output()
            .await
            .map_err(FFmpegError::ProcessError)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FFmpegError::ExecutionFailed(format!(
                "{} failed: {}",
                context,
                stderr_tail(&stderr)
            )));
        }
        Ok(())
    }
}

fn stderr_tail(stderr: &str) -> String {
    let count = stderr.chars().count();
    if count <= MAX_STDERR_CHARS {
        return stderr.trim().to_string();
    }
    let tail: String = stderr.chars().skip(count - MAX_STDERR_CHARS).collect();
    format!("...{}", tail.trim())
}

fn ensure_input(path: &Path) -> FFmpegResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(FFmpegError::InvalidInput(format!(
            "Input file does not exist: {}",
            path.display()
        )))
    }
}

fn ensure_parent(path: &Path) -> FFmpegResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FFmpegError::OutputError(format!("Failed to create output directory: {}", e))
        })?;
    }
    Ok(())
}

fn secs(ms: DurationMs) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

/// Escapes a path for use inside an ffmpeg filter argument
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// `enable` expression that is true inside any of the intervals
fn enable_expr(intervals: &[MouthInterval]) -> String {
    intervals
        .iter()
        .map(|(start, end)| format!("between(t,{},{})", secs(*start), secs(*end)))
        .collect::<Vec<_>>()
        .join("+")
}

fn looped_image(args: &mut Vec<String>, image: &Path, fps: u32) {
    args.extend([
        "-loop".into(),
        "1".into(),
        "-framerate".into(),
        fps.to_string(),
        "-i".into(),
        image.to_string_lossy().into_owned(),
    ]);
}

/// Arguments rendering one scene segment.
///
/// `title_files` holds the text of `settings.titles_for(clip.scene)`, in order.
pub fn segment_args(
    clip: &SegmentClip,
    settings: &RenderSettings,
    subtitle_file: Option<&Path>,
    title_files: &[PathBuf],
    output: &Path,
) -> Vec<String> {
    let total_ms = clip.duration_ms(settings);
    let size = format!("{}x{}", settings.width, settings.height);
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

    match &clip.image {
        Some(image) => looped_image(&mut args, image, settings.fps),
        None => args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!(
                "color=c=0x{}:s={}:r={}",
                settings.placeholder_color, size, settings.fps
            ),
        ]),
    }
    match &clip.audio {
        Some(audio) => args.extend(["-i".into(), audio.to_string_lossy().into_owned()]),
        None => args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={SEGMENT_SAMPLE_RATE}:cl=stereo"),
        ]),
    }

    let mut base = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1",
        w = settings.width,
        h = settings.height
    );
    let mut audio_filter = "apad".to_string();
    if settings.fade_ms > 0 && settings.fade_ms * 2 < total_ms {
        let fade = secs(settings.fade_ms);
        let fade_out_start = secs(total_ms - settings.fade_ms);
        base.push_str(&format!(
            ",fade=t=in:st=0:d={fade},fade=t=out:st={fade_out_start}:d={fade}"
        ));
        audio_filter.push_str(&format!(
            ",afade=t=in:st=0:d={fade},afade=t=out:st={fade_out_start}:d={fade}"
        ));
    }

    let mut graph = format!("[0:v]{base}[base]");
    let mut last = "base";
    if let Some(character) = &settings.character {
        let scale = format!(
            "scale='min({m},iw)':'min({m},ih)':force_original_aspect_ratio=decrease",
            m = character.max_px
        );
        let position = format!(
            "x=W-w-{}:y=H-h-{}",
            character.margin_right_px, character.margin_bottom_px
        );
        looped_image(&mut args, &character.image, settings.fps);
        graph.push_str(&format!(
            ";[2:v]{scale}[character];[{last}][character]overlay={position}[with_character]"
        ));
        last = "with_character";

        if let (Some(open), false) = (&character.open_mouth, clip.mouth_open.is_empty()) {
            looped_image(&mut args, open, settings.fps);
            graph.push_str(&format!(
                ";[3:v]{scale}[open_mouth];[{last}][open_mouth]overlay={position}:enable='{}'[talking]",
                enable_expr(&clip.mouth_open)
            ));
            last = "talking";
        }
    }

    let mut finish: Vec<String> = settings
        .titles_for(clip.scene)
        .into_iter()
        .zip(title_files)
        .map(|(title, file)| {
            format!(
                "drawtext=textfile='{}':font='{}':fontsize={}:fontcolor=0x{}:x={}:y={}",
                escape_filter_path(file),
                settings.font.name.replace('\'', ""),
                title.size,
                title.color,
                title.x,
                title.y
            )
        })
        .collect();
    if let Some(subtitle_file) = subtitle_file {
        finish.push(format!(
            "subtitles=filename='{}':force_style='{}'",
            escape_filter_path(subtitle_file),
            ass_force_style(&settings.font)
        ));
    }
    finish.push("format=yuv420p".into());
    graph.push_str(&format!(";[{last}]{}[vout]", finish.join(",")));
    graph.push_str(&format!(";[1:a]{audio_filter}[aout]"));

    args.extend([
        "-filter_complex".into(),
        graph,
        "-map".into(),
        "[vout]".into(),
        "-map".into(),
        "[aout]".into(),
        "-t".into(),
        secs(total_ms),
        "-r".into(),
        settings.fps.to_string(),
        "-c:v".into(),
        settings.video_codec.clone(),
        "-preset".into(),
        settings.preset.clone(),
        "-crf".into(),
        settings.crf.to_string(),
        "-c:a".into(),
        settings.audio_codec.clone(),
        "-b:a".into(),
        settings.audio_bitrate.clone(),
        "-ar".into(),
        SEGMENT_SAMPLE_RATE.into(),
        "-ac".into(),
        "2".into(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// Concat demuxer list file contents
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| {
            let path = p.to_string_lossy().replace('\\', "/").replace('\'', "'\\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Arguments joining segments without re-encoding
pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_file.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Extracts the container duration from `ffprobe -show_format` JSON
pub fn parse_probe_duration(json_str: &str) -> FFmpegResult<DurationMs> {
    let json: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| FFmpegError::ParseError(format!("Failed to parse FFprobe output: {}", e)))?;

    let seconds = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| FFmpegError::ParseError("Missing format duration".to_string()))?;

    Ok((seconds * 1000.0).round() as DurationMs)
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn probe_duration(&self, media: &Path) -> CoreResult<DurationMs> {
        ensure_input(media)?;
        let output = tokio::process::Command::new(&self.info.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                &media.to_string_lossy(),
            ])
            .output()
            .await
            .map_err(FFmpegError::ProcessError)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FFmpegError::ProbeError(format!("FFprobe failed: {}", stderr_tail(&stderr))).into());
        }
        Ok(parse_probe_duration(&String::from_utf8_lossy(&output.stdout))?)
    }

    async fn render_segment(
        &self,
        clip: &SegmentClip,
        settings: &RenderSettings,
        output: &Path,
    ) -> CoreResult<()> {
        for input in clip.image.iter().chain(clip.audio.iter()) {
            ensure_input(input)?;
        }
        ensure_parent(output)?;

        let subtitle_file = if settings.burn_subtitles && !clip.subtitle.trim().is_empty() {
            let path = output.with_extension("srt");
            let cue = SubtitleCue::new(
                0,
                clip.duration_ms(settings),
                wrap_subtitle_lines(&clip.subtitle, settings.font.max_line_chars).join("\n"),
            );
            atomic_write_bytes(&path, export_srt(&[cue]).as_bytes())?;
            Some(path)
        } else {
            None
        };

        let mut title_files = Vec::new();
        for (i, title) in settings.titles_for(clip.scene).into_iter().enumerate() {
            let path = output.with_extension(format!("title{i}.txt"));
            atomic_write_bytes(&path, title.text.as_bytes())?;
            title_files.push(path);
        }

        let args = segment_args(clip, settings, subtitle_file.as_deref(), &title_files, output);
        let result = self
            .run_ffmpeg(&args, &format!("Rendering scene {}", clip.scene))
            .await;
        for path in subtitle_file.into_iter().chain(title_files) {
            let _ = std::fs::remove_file(path);
        }
        Ok(result?)
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> CoreResult<()> {
        if segments.is_empty() {
            return Err(FFmpegError::InvalidInput("No segments to concatenate".to_string()).into());
        }
        for segment in segments {
            ensure_input(segment)?;
        }
        ensure_parent(output)?;

        let list_file = output.with_extension("concat.txt");
        atomic_write_bytes(&list_file, concat_list(segments).as_bytes())?;
        let result = self
            .run_ffmpeg(&concat_args(&list_file, output), "Concatenating segments")
            .await;
        let _ = std::fs::remove_file(&list_file);
        Ok(result?)
    }
}
