//! Image style presets and per-style LoRA defaults.

use std::collections::BTreeMap;

/// Suffix appended to every composed image prompt
pub const QUALITY_SUFFIX: &str = "detailed facial expressions, dynamic poses, high quality";

/// Known style presets and the prompt modifiers they contribute
pub const STYLE_PRESETS: &[(&str, &str)] = &[
    (
        "cinematic",
        "cinematic lighting, movie quality, professional photography, 8k ultra HD",
    ),
    (
        "ink",
        "traditional Chinese ink painting style, elegant, flowing ink, minimalist",
    ),
    (
        "oil",
        "oil painting style, detailed brushwork, rich colors, artistic",
    ),
    ("anime", "anime style, vibrant colors, clean lines, expressive"),
    (
        "photorealistic",
        "photorealistic, highly detailed, sharp focus, natural lighting",
    ),
    (
        "dreamy",
        "dreamy atmosphere, soft lighting, ethereal colors, mystical",
    ),
];

/// Looks up the prompt modifier for a preset name (case-insensitive)
pub fn preset_modifier(name: &str) -> Option<&'static str> {
    STYLE_PRESETS
        .iter()
        .find(|(preset, _)| preset.eq_ignore_ascii_case(name.trim()))
        .map(|(_, modifier)| *modifier)
}

/// Default ComfyUI LoRA files keyed by style preset
pub fn default_style_loras() -> BTreeMap<String, String> {
    [
        ("ink", "写实水墨水彩风格_F1_水墨.safetensors"),
        ("illustration", "Illustration_story book.safetensors"),
        ("photorealistic", "adilson-farias-flux1-dev-v1-000088.safetensors"),
        ("cinematic", "Cinematic style 3 (FLUX).safetensors"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Composes the prompt sent to an image backend.
///
/// Empty style text is skipped so the result never contains dangling commas.
pub fn compose_image_prompt(prompt: &str, style_text: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    let prompt = prompt.trim();
    if !prompt.is_empty() {
        parts.push(prompt);
    }
    let style_text = style_text.trim();
    if !style_text.is_empty() {
        parts.push(style_text);
    }
    parts.push(QUALITY_SUFFIX);
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_lookup_is_case_insensitive() {
        assert!(preset_modifier("Cinematic").unwrap().contains("cinematic lighting"));
        assert!(preset_modifier("unknown").is_none());
    }

    #[test]
    fn compose_appends_style_and_quality() {
        let composed = compose_image_prompt("a lighthouse at dusk", "anime style");
        assert_eq!(
            composed,
            "a lighthouse at dusk, anime style, detailed facial expressions, dynamic poses, high quality"
        );
    }

    #[test]
    fn compose_skips_empty_style() {
        let composed = compose_image_prompt("forest", "  ");
        assert_eq!(composed, format!("forest, {QUALITY_SUFFIX}"));
    }
}
