//! Pronunciation dictionary.
//!
//! Entries map a written surface form to the reading a TTS engine should
//! speak. Planning derives each scene's voice text by running the scene text
//! through [`apply_substitutions`]; VOICEVOX additionally keeps its own copy of
//! the dictionary so readings apply inside the engine's tokenizer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::core::fs::atomic_write_json_pretty;
use crate::core::{CoreError, CoreResult};

/// Highest accepted priority
pub const MAX_PRIORITY: u32 = 10;

/// Part of speech, as understood by VOICEVOX
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WordType {
    #[default]
    ProperNoun,
    CommonNoun,
    Verb,
    Adjective,
    Suffix,
}

impl WordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WordType::ProperNoun => "PROPER_NOUN",
            WordType::CommonNoun => "COMMON_NOUN",
            WordType::Verb => "VERB",
            WordType::Adjective => "ADJECTIVE",
            WordType::Suffix => "SUFFIX",
        }
    }
}

impl std::str::FromStr for WordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PROPER_NOUN" => Ok(WordType::ProperNoun),
            "COMMON_NOUN" => Ok(WordType::CommonNoun),
            "VERB" => Ok(WordType::Verb),
            "ADJECTIVE" => Ok(WordType::Adjective),
            "SUFFIX" => Ok(WordType::Suffix),
            other => Err(format!("Unknown word type: {other}")),
        }
    }
}

/// A dictionary word without its identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryWord {
    pub surface: String,
    /// Reading (katakana for VOICEVOX)
    pub pronunciation: String,
    #[serde(default)]
    pub accent_type: u32,
    #[serde(default)]
    pub word_type: WordType,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    5
}

impl DictionaryWord {
    pub fn new(surface: impl Into<String>, pronunciation: impl Into<String>) -> Self {
        Self {
            surface: surface.into(),
            pronunciation: pronunciation.into(),
            accent_type: 0,
            word_type: WordType::default(),
            priority: default_priority(),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.surface.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Dictionary surface must not be empty".to_string(),
            ));
        }
        if self.pronunciation.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Dictionary pronunciation must not be empty".to_string(),
            ));
        }
        if self.priority > MAX_PRIORITY {
            return Err(CoreError::ValidationError(format!(
                "Dictionary priority must be between 0 and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// A stored word keyed by uuid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryEntry {
    pub uuid: String,
    #[serde(flatten)]
    pub word: DictionaryWord,
}

/// Storage for pronunciation entries
#[async_trait]
pub trait PronunciationDictionary: Send + Sync {
    /// Entries sorted by surface
    async fn list(&self) -> CoreResult<Vec<DictionaryEntry>>;

    async fn add(&self, word: DictionaryWord) -> CoreResult<DictionaryEntry>;

    async fn update(&self, uuid: &str, word: DictionaryWord) -> CoreResult<DictionaryEntry>;

    async fn delete(&self, uuid: &str) -> CoreResult<()>;

    /// Entries used to derive voice text
    async fn substitutions(&self) -> CoreResult<Vec<DictionaryEntry>> {
        self.list().await
    }
}

/// Rewrites `text` with dictionary readings.
///
/// The text is scanned once from the left; at each position the longest
/// matching surface wins, ties going to the higher priority. Replaced readings
/// are never scanned again.
pub fn apply_substitutions(text: &str, entries: &[DictionaryEntry]) -> String {
    let mut candidates: Vec<&DictionaryWord> = entries
        .iter()
        .map(|e| &e.word)
        .filter(|w| !w.surface.is_empty())
        .collect();
    if candidates.is_empty() {
        return text.to_string();
    }
    candidates.sort_by(|a, b| {
        b.surface
            .len()
            .cmp(&a.surface.len())
            .then(b.priority.cmp(&a.priority))
    });

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        match candidates.iter().find(|w| rest.starts_with(w.surface.as_str())) {
            Some(word) => {
                out.push_str(&word.pronunciation);
                rest = &rest[word.surface.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

fn sort_entries(entries: &mut [DictionaryEntry]) {
    entries.sort_by(|a, b| a.word.surface.cmp(&b.word.surface).then(a.uuid.cmp(&b.uuid)));
}

fn unknown_entry(uuid: &str) -> CoreError {
    CoreError::ValidationError(format!("Unknown dictionary entry: {uuid}"))
}

// =============================================================================
// Local Dictionary
// =============================================================================

/// Dictionary stored as `dictionary.json` inside the project
#[derive(Debug)]
pub struct LocalDictionary {
    path: PathBuf,
    guard: Mutex<()>,
}

impl LocalDictionary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> CoreResult<BTreeMap<String, DictionaryWord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                CoreError::StorageError(format!(
                    "Corrupt dictionary {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CoreError::IoError(e)),
        }
    }

    fn write(&self, words: &BTreeMap<String, DictionaryWord>) -> CoreResult<()> {
        atomic_write_json_pretty(&self.path, words)
    }
}

#[async_trait]
impl PronunciationDictionary for LocalDictionary {
    async fn list(&self) -> CoreResult<Vec<DictionaryEntry>> {
        let _guard = self.guard.lock().await;
        let mut entries: Vec<DictionaryEntry> = self
            .read()?
            .into_iter()
            .map(|(uuid, word)| DictionaryEntry { uuid, word })
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn add(&self, word: DictionaryWord) -> CoreResult<DictionaryEntry> {
        word.validate()?;
        let _guard = self.guard.lock().await;
        let mut words = self.read()?;
        let uuid = uuid::Uuid::new_v4().to_string();
        words.insert(uuid.clone(), word.clone());
        self.write(&words)?;
        info!(surface = %word.surface, uuid = %uuid, "Added dictionary word");
        Ok(DictionaryEntry { uuid, word })
    }

    async fn update(&self, uuid: &str, word: DictionaryWord) -> CoreResult<DictionaryEntry> {
        word.validate()?;
        let _guard = self.guard.lock().await;
        let mut words = self.read()?;
        let slot = words.get_mut(uuid).ok_or_else(|| unknown_entry(uuid))?;
        *slot = word.clone();
        self.write(&words)?;
        Ok(DictionaryEntry {
            uuid: uuid.to_string(),
            word,
        })
    }

    async fn delete(&self, uuid: &str) -> CoreResult<()> {
        let _guard = self.guard.lock().await;
        let mut words = self.read()?;
        words.remove(uuid).ok_or_else(|| unknown_entry(uuid))?;
        self.write(&words)?;
        info!(uuid = %uuid, "Deleted dictionary word");
        Ok(())
    }
}
