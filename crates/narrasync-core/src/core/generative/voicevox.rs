//! VOICEVOX voice backend and remote user dictionary.
//!
//! Synthesis is two calls: `POST /audio_query` builds the accent phrases for
//! the text, `POST /synthesis` renders the (speed-adjusted) query to WAV.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::adapter::{BackendKind, Capability, GeneratorAdapter, VoiceRequest};
use super::http::{self, MAX_DOWNLOAD_BYTES};
use crate::core::config::GenerationConfig;
use crate::core::dictionary::{DictionaryEntry, DictionaryWord, PronunciationDictionary, WordType};
use crate::core::scenes::{AssetRef, AssetWriter};
use crate::core::{AssetKind, CoreError, CoreResult, FailureReason};

const BACKEND: &str = "voicevox";

/// One speaker style exposed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct SpeakerStyle {
    pub name: String,
    pub id: u32,
}

/// A speaker and its styles
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct Speaker {
    pub name: String,
    #[serde(default)]
    pub styles: Vec<SpeakerStyle>,
}

#[derive(Clone)]
struct VoicevoxClient {
    client: reqwest::Client,
    base_url: String,
}

impl VoicevoxClient {
    fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        Ok(Self {
            client: http::build_client(config.services.request_timeout_ms)?,
            base_url: config.services.voicevox.url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        http::endpoint(&self.base_url, path)
    }
}

// =============================================================================
// Voice Adapter
// =============================================================================

/// VOICEVOX engine adapter
pub struct VoicevoxAdapter {
    api: VoicevoxClient,
}

impl std::fmt::Debug for VoicevoxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicevoxAdapter")
            .field("url", &self.api.base_url)
            .finish_non_exhaustive()
    }
}

impl VoicevoxAdapter {
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        Ok(Self {
            api: VoicevoxClient::from_config(config)?,
        })
    }

    /// Speakers installed in the engine
    pub async fn speakers(&self) -> CoreResult<Vec<Speaker>> {
        let response = http::send(BACKEND, self.api.client.get(self.api.url("speakers"))).await?;
        http::read_json(BACKEND, response).await
    }

    async fn audio_query(&self, text: &str, speaker: &str) -> CoreResult<Value> {
        let response = http::send(
            BACKEND,
            self.api
                .client
                .post(self.api.url("audio_query"))
                .query(&[("text", text), ("speaker", speaker)]),
        )
        .await?;
        http::read_json(BACKEND, response).await
    }

    async fn synthesis(&self, query: &Value, speaker: &str) -> CoreResult<Vec<u8>> {
        let response = http::send(
            BACKEND,
            self.api
                .client
                .post(self.api.url("synthesis"))
                .query(&[("speaker", speaker)])
                .json(query),
        )
        .await?;
        http::read_bytes_capped(BACKEND, response, MAX_DOWNLOAD_BYTES).await
    }
}

fn validate_speaker(speaker: &str) -> CoreResult<()> {
    if speaker.trim().parse::<u32>().is_err() {
        return Err(CoreError::permanent(
            BACKEND,
            FailureReason::BadRequest,
            format!("VOICEVOX speaker must be a numeric style id, got '{speaker}'"),
        ));
    }
    Ok(())
}

#[async_trait]
impl GeneratorAdapter for VoicevoxAdapter {
    fn backend_id(&self) -> &str {
        BackendKind::Voicevox.id()
    }

    fn capabilities(&self) -> Vec<Capability> {
        BackendKind::Voicevox.capabilities().to_vec()
    }

    async fn generate_voice(&self, request: &VoiceRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        let speaker = request.voice.speaker.trim();
        validate_speaker(speaker)?;

        let mut query = self.audio_query(&request.text, speaker).await?;
        let speed = f64::from(request.voice.speed_percent) / 100.0;
        match query.as_object_mut() {
            Some(fields) => {
                fields.insert("speedScale".to_string(), serde_json::json!(speed));
            }
            None => {
                return Err(CoreError::permanent(
                    BACKEND,
                    FailureReason::InvalidResponse,
                    "audio_query did not return an object",
                ));
            }
        }
        debug!(scene = request.scene, speaker, speed, "Synthesizing narration");

        let wav = self.synthesis(&query, speaker).await?;
        assets.write(request.scene, AssetKind::Audio, "wav", &wav)
    }
}

// =============================================================================
// Remote Dictionary
// =============================================================================

#[derive(Debug, Deserialize)]
struct RemoteWord {
    surface: String,
    pronunciation: String,
    #[serde(default)]
    accent_type: u32,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    part_of_speech_detail_1: Option<String>,
    #[serde(default)]
    part_of_speech: Option<String>,
}

impl RemoteWord {
    fn word_type(&self) -> WordType {
        match (
            self.part_of_speech.as_deref(),
            self.part_of_speech_detail_1.as_deref(),
        ) {
            (Some("名詞"), Some("固有名詞")) => WordType::ProperNoun,
            (Some("名詞"), Some("接尾")) => WordType::Suffix,
            (Some("名詞"), _) => WordType::CommonNoun,
            (Some("動詞"), _) => WordType::Verb,
            (Some("形容詞"), _) => WordType::Adjective,
            _ => WordType::ProperNoun,
        }
    }
}

/// The engine's user dictionary
pub struct VoicevoxDictionary {
    api: VoicevoxClient,
}

impl std::fmt::Debug for VoicevoxDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicevoxDictionary")
            .field("url", &self.api.base_url)
            .finish_non_exhaustive()
    }
}

impl VoicevoxDictionary {
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        Ok(Self {
            api: VoicevoxClient::from_config(config)?,
        })
    }

    fn word_params(word: &DictionaryWord) -> Vec<(&'static str, String)> {
        vec![
            ("surface", word.surface.clone()),
            ("pronunciation", word.pronunciation.clone()),
            ("accent_type", word.accent_type.to_string()),
            ("word_type", word.word_type.as_str().to_string()),
            ("priority", word.priority.to_string()),
        ]
    }

    /// Unknown uuids come back as 404/422; surface them as validation errors
    async fn check_entry_response(uuid: &str, response: reqwest::Response) -> CoreResult<()> {
        match response.status().as_u16() {
            404 | 422 => Err(CoreError::ValidationError(format!(
                "Unknown dictionary entry: {uuid}"
            ))),
            _ => http::ensure_success(BACKEND, response).await.map(|_| ()),
        }
    }
}

#[async_trait]
impl PronunciationDictionary for VoicevoxDictionary {
    async fn list(&self) -> CoreResult<Vec<DictionaryEntry>> {
        let response = http::send(BACKEND, self.api.client.get(self.api.url("user_dict"))).await?;
        let words: BTreeMap<String, RemoteWord> = http::read_json(BACKEND, response).await?;
        let mut entries: Vec<DictionaryEntry> = words
            .into_iter()
            .map(|(uuid, remote)| DictionaryEntry {
                uuid,
                word: DictionaryWord {
                    word_type: remote.word_type(),
                    surface: remote.surface,
                    pronunciation: remote.pronunciation,
                    accent_type: remote.accent_type,
                    priority: remote.priority,
                },
            })
            .collect();
        entries.sort_by(|a, b| a.word.surface.cmp(&b.word.surface));
        Ok(entries)
    }

    async fn add(&self, word: DictionaryWord) -> CoreResult<DictionaryEntry> {
        word.validate()?;
        let response = http::send(
            BACKEND,
            self.api
                .client
                .post(self.api.url("user_dict_word"))
                .query(&Self::word_params(&word)),
        )
        .await?;
        let uuid: String = http::read_json(BACKEND, response).await?;
        info!(surface = %word.surface, uuid = %uuid, "Added VOICEVOX dictionary word");
        Ok(DictionaryEntry { uuid, word })
    }

    async fn update(&self, uuid: &str, word: DictionaryWord) -> CoreResult<DictionaryEntry> {
        word.validate()?;
        let response = http::send(
            BACKEND,
            self.api
                .client
                .put(self.api.url(&format!("user_dict_word/{uuid}")))
                .query(&Self::word_params(&word)),
        )
        .await?;
        Self::check_entry_response(uuid, response).await?;
        Ok(DictionaryEntry {
            uuid: uuid.to_string(),
            word,
        })
    }

    async fn delete(&self, uuid: &str) -> CoreResult<()> {
        let response = http::send(
            BACKEND,
            self.api
                .client
                .delete(self.api.url(&format!("user_dict_word/{uuid}"))),
        )
        .await?;
        Self::check_entry_response(uuid, response).await?;
        info!(uuid = %uuid, "Deleted VOICEVOX dictionary word");
        Ok(())
    }
}
