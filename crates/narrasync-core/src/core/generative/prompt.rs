//! Local prompt softening for content-policy rejections.

use std::sync::OnceLock;

use regex::Regex;

/// Appended to every softened prompt
pub const SOFTEN_SUFFIX: &str = ", tasteful, appropriate, decent";

/// Appended when a rewrite came back unchanged
pub const SAFE_VERSION_SUFFIX: &str = ", safe version";

const REPLACEMENTS: &[(&str, &str)] = &[
    ("裸", "穿着衣服"),
    ("暴力", "剧烈活动"),
    ("流血", "受伤"),
    ("血", "红色液体"),
    ("死体", "倒れた人"),
];

fn english_replacements() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)\bnude\b", "clothed"),
            (r"(?i)\bnaked\b", "clothed"),
            (r"(?i)\bbloody\b", "red"),
            (r"(?i)\bblood\b", "red"),
            (r"(?i)\bviolence\b", "action"),
            (r"(?i)\bviolent\b", "intense"),
            (r"(?i)\bgore\b", "drama"),
            (r"(?i)\bcorpse\b", "fallen figure"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|r| (r, replacement)))
        .collect()
    })
}

/// Replaces sensitive words with milder ones and appends [`SOFTEN_SUFFIX`].
pub fn soften_prompt(prompt: &str) -> String {
    let mut softened = REPLACEMENTS
        .iter()
        .fold(prompt.to_string(), |acc, (from, to)| acc.replace(from, to));
    for (pattern, replacement) in english_replacements() {
        softened = pattern.replace_all(&softened, *replacement).into_owned();
    }
    if !softened.ends_with(SOFTEN_SUFFIX) {
        softened.push_str(SOFTEN_SUFFIX);
    }
    softened
}

/// Rewrite used when no text backend is configured
pub fn local_rewrite(prompt: &str, attempt: u32) -> String {
    let softened = soften_prompt(prompt);
    if attempt == 0 || softened != prompt {
        softened
    } else {
        format!("{prompt}{SAFE_VERSION_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_sensitive_words() {
        assert_eq!(
            soften_prompt("Bloody violence in the hall"),
            "red action in the hall, tasteful, appropriate, decent"
        );
        assert_eq!(soften_prompt("暴力の場面"), "剧烈活动の場面, tasteful, appropriate, decent");
    }

    #[test]
    fn word_boundaries_are_respected() {
        assert!(soften_prompt("bloodhound").starts_with("bloodhound"));
    }

    #[test]
    fn suffix_is_not_stacked() {
        let once = soften_prompt("a castle");
        assert_eq!(soften_prompt(&once), once);
    }

    #[test]
    fn repeated_local_rewrite_still_changes_prompt() {
        let first = local_rewrite("a castle", 0);
        let second = local_rewrite(&first, 1);
        assert_ne!(first, second);
        assert!(second.ends_with(SAFE_VERSION_SUFFIX));
    }
}
