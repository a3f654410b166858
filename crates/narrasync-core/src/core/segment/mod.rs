//! Text segmentation.
//!
//! Splits narrative text into scene texts. The pipeline only depends on the
//! [`TextSegmenter`] trait; [`SentenceSegmenter`] is a deterministic default
//! that understands Japanese and Latin sentence punctuation.

use crate::core::config::SegmentationConfig;

/// Characters that end a sentence
const TERMINATORS: &[char] = &['。', '！', '？', '!', '?', '.'];

/// Closing quotes and brackets kept with the sentence they close
const CLOSERS: &[char] = &['」', '』', '）', ')', '"', '\u{201d}', '\''];

/// Produces the ordered scene texts for a story
pub trait TextSegmenter: Send + Sync {
    /// Returns no segments for empty or whitespace-only input
    fn segment(&self, text: &str) -> Vec<String>;
}

/// Sentence-based segmenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceSegmenter {
    pub max_scene_chars: usize,
    pub min_sentence_chars: usize,
    /// Every non-empty line becomes one scene
    pub preserve_line_breaks: bool,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::from_config(&SegmentationConfig::default())
    }
}

impl SentenceSegmenter {
    pub fn from_config(config: &SegmentationConfig) -> Self {
        Self {
            max_scene_chars: config.max_scene_chars.max(1),
            min_sentence_chars: config.min_sentence_chars,
            preserve_line_breaks: config.preserve_line_breaks,
        }
    }

    /// Splits text into sentences, folding short fragments into their predecessor
    pub fn sentences(&self, text: &str) -> Vec<String> {
        let mut sentences: Vec<String> = Vec::new();
        for fragment in split_sentences(text) {
            match sentences.last_mut() {
                Some(previous) if char_len(&fragment) < self.min_sentence_chars => {
                    join_into(previous, &fragment);
                }
                _ => sentences.push(fragment),
            }
        }
        sentences
    }

    fn group(&self, sentences: Vec<String>) -> Vec<String> {
        let mut scenes = Vec::new();
        let mut current = String::new();
        for sentence in sentences {
            if current.is_empty() {
                current = sentence;
                continue;
            }
            let mut candidate = current.clone();
            join_into(&mut candidate, &sentence);
            if char_len(&candidate) <= self.max_scene_chars {
                current = candidate;
            } else {
                scenes.push(std::mem::replace(&mut current, sentence));
            }
        }
        if !current.is_empty() {
            scenes.push(current);
        }
        scenes
    }
}

impl TextSegmenter for SentenceSegmenter {
    fn segment(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if self.preserve_line_breaks {
            return text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.group(self.sentences(text))
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Appends `next`, inserting a space between two Latin words
fn join_into(buffer: &mut String, next: &str) {
    let needs_space = buffer.chars().last().is_some_and(|c| c.is_ascii())
        && next.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if needs_space {
        buffer.push(' ');
    }
    buffer.push_str(next);
}

fn flush(buffer: &mut String, out: &mut Vec<String>) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    buffer.clear();
}

fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut buffer = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' || c == '\r' {
            flush(&mut buffer, &mut out);
            i += 1;
            continue;
        }
        buffer.push(c);
        i += 1;

        if !TERMINATORS.contains(&c) {
            continue;
        }
        // "3.14" is not a sentence end
        if c == '.' && chars.get(i).is_some_and(|n| n.is_ascii_digit()) {
            continue;
        }
        while let Some(&n) = chars.get(i) {
            if TERMINATORS.contains(&n) || CLOSERS.contains(&n) {
                buffer.push(n);
                i += 1;
            } else {
                break;
            }
        }
        flush(&mut buffer, &mut out);
    }
    flush(&mut buffer, &mut out);
    out
}
