//! Subtitle Formatting
//!
//! SRT export for the whole-video sidecar, line wrapping for burned-in cues,
//! and the ASS `force_style` string handed to ffmpeg's `subtitles` filter.

use crate::core::config::FontConfig;
use crate::core::DurationMs;

/// Punctuation that must never start a subtitle line
pub const CLOSING_PUNCTUATION: &[char] = &['。', '、', '，', '！', '？', '」', '』', '）', '：', '…'];

/// One timed subtitle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleCue {
    pub start_ms: DurationMs,
    pub end_ms: DurationMs,
    pub text: String,
}

impl SubtitleCue {
    pub fn new(start_ms: DurationMs, end_ms: DurationMs, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

/// Formats milliseconds as an SRT timestamp (00:00:00,000)
pub fn format_srt_time(ms: DurationMs) -> String {
    let millis = ms % 1000;
    let total_secs = ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;

    format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, millis)
}

/// Exports cues to SRT format
pub fn export_srt(cues: &[SubtitleCue]) -> String {
    let mut output = String::new();

    for (index, cue) in cues.iter().enumerate() {
        output.push_str(&format!("{}\n", index + 1));
        output.push_str(&format!(
            "{} --> {}\n",
            format_srt_time(cue.start_ms),
            format_srt_time(cue.end_ms)
        ));
        output.push_str(&cue.text);
        output.push_str("\n\n");
    }

    let mut output = output.trim_end().to_string();
    if !output.is_empty() {
        output.push('\n');
    }
    output
}

/// Breaks `text` into lines of at most `max_chars` characters.
///
/// Existing line breaks are kept. A closing punctuation mark that would open
/// a line is pulled back onto the previous one, which may then exceed the budget.
pub fn wrap_subtitle_lines(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();

    for raw in text.lines() {
        let chars: Vec<char> = raw.trim().chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let mut end = (start + max_chars).min(chars.len());
            while end < chars.len() && CLOSING_PUNCTUATION.contains(&chars[end]) {
                end += 1;
            }
            lines.push(chars[start..end].iter().collect());
            start = end;
        }
    }
    lines
}

/// Converts `RRGGBB` plus an opacity percentage into an ASS `&HAABBGGRR` colour
fn ass_colour(rgb: &str, opacity_percent: u32) -> String {
    let rgb = rgb.trim_start_matches('#');
    let (r, g, b) = if rgb.len() == 6 && rgb.chars().all(|c| c.is_ascii_hexdigit()) {
        (&rgb[0..2], &rgb[2..4], &rgb[4..6])
    } else {
        ("FF", "FF", "FF")
    };
    let alpha = 255 - opacity_percent.min(100) * 255 / 100;
    format!("&H{:02X}{}{}{}", alpha, b, g, r).to_ascii_uppercase()
}

/// `force_style` argument for ffmpeg's `subtitles` filter
pub fn ass_force_style(font: &FontConfig) -> String {
    format!(
        "FontName={},FontSize={},PrimaryColour={},BackColour={},BorderStyle=3,Outline=1,Shadow=0,MarginV=20",
        font.name,
        font.size,
        ass_colour(&font.color, 100),
        ass_colour("000000", font.bg_opacity_percent),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srt_time_formatting() {
        assert_eq!(format_srt_time(0), "00:00:00,000");
        assert_eq!(format_srt_time(1500), "00:00:01,500");
        assert_eq!(format_srt_time(90_000), "00:01:30,000");
        assert_eq!(format_srt_time(5_400_000), "01:30:00,000");
    }

    #[test]
    fn export_numbers_cues() {
        let srt = export_srt(&[
            SubtitleCue::new(0, 2500, "こんにちは"),
            SubtitleCue::new(2500, 4000, "Second\nline"),
        ]);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:02,500\nこんにちは\n\n2\n"));
        assert!(srt.ends_with("Second\nline\n"));
        assert_eq!(export_srt(&[]), "");
    }

    #[test]
    fn wrap_respects_budget() {
        assert_eq!(wrap_subtitle_lines("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(wrap_subtitle_lines("abc", 25), vec!["abc"]);
        assert!(wrap_subtitle_lines("", 25).is_empty());
    }

    #[test]
    fn wrap_never_starts_line_with_closing_punctuation() {
        assert_eq!(
            wrap_subtitle_lines("あいうえおかきくけこ。」さしす", 10),
            vec!["あいうえおかきくけこ。」", "さしす"]
        );
    }

    #[test]
    fn wrap_keeps_existing_breaks() {
        assert_eq!(wrap_subtitle_lines("一行目\n二行目", 25), vec!["一行目", "二行目"]);
    }

    #[test]
    fn force_style_uses_font_config() {
        let style = ass_force_style(&FontConfig::default());
        assert!(style.contains("FontSize=18"));
        assert!(style.contains("PrimaryColour=&H00FFFFFF"));
        // 50% opaque black background
        assert!(style.contains("BackColour=&H80000000"));
    }
}
