//! OpenAI-compatible backend: speech synthesis, translation and prompt rewriting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::adapter::{BackendKind, Capability, GeneratorAdapter, VoiceRequest};
use super::http::{self, MAX_DOWNLOAD_BYTES};
use super::prompt::{soften_prompt, SAFE_VERSION_SUFFIX};
use crate::core::config::{GenerationConfig, OpenAiService};
use crate::core::scenes::{AssetRef, AssetWriter};
use crate::core::{AssetKind, CoreError, CoreResult, FailureReason};

const BACKEND: &str = "openai";

/// Voices accepted by `/audio/speech`, indexed by the numeric speaker ids used in configs
pub const OPENAI_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer", "coral"];

const DEFAULT_VOICE: &str = "alloy";

const TRANSLATOR_SYSTEM_PROMPT: &str =
    "You are a precise translator that converts non-English text to English while preserving meaning. \
     Reply with the translation only.";

const REWRITE_SYSTEM_PROMPT: &str =
    "You rewrite image generation prompts that were rejected by a content filter. \
     Remove or soften violent, gory or explicit wording, keep the scene and its intent, \
     and reply with the rewritten prompt only.";

/// Resolves a configured speaker into an OpenAI voice name.
///
/// Numeric ids 1..=7 index [`OPENAI_VOICES`]; known names pass through;
/// anything else falls back to `alloy`.
pub fn resolve_voice(speaker: &str) -> &'static str {
    let speaker = speaker.trim();
    if let Ok(id) = speaker.parse::<usize>() {
        return id
            .checked_sub(1)
            .and_then(|i| OPENAI_VOICES.get(i))
            .copied()
            .unwrap_or(DEFAULT_VOICE);
    }
    OPENAI_VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(speaker))
        .copied()
        .unwrap_or(DEFAULT_VOICE)
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    speed: f64,
    response_format: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible adapter
pub struct OpenAiAdapter {
    client: reqwest::Client,
    service: OpenAiService,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("base_url", &self.service.base_url)
            .field("chat_model", &self.service.chat_model)
            .field("tts_model", &self.service.tts_model)
            .finish_non_exhaustive()
    }
}

impl OpenAiAdapter {
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        Ok(Self {
            client: http::build_client(config.services.request_timeout_ms)?,
            service: config.services.openai.clone(),
        })
    }

    fn require_key(&self) -> CoreResult<&str> {
        let key = self.service.api_key.trim();
        if key.is_empty() {
            return Err(CoreError::permanent(
                BACKEND,
                FailureReason::Auth,
                "OpenAI API key is not configured",
            ));
        }
        Ok(key)
    }

    fn post(&self, path: &str) -> CoreResult<reqwest::RequestBuilder> {
        let key = self.require_key()?;
        Ok(self
            .client
            .post(http::endpoint(&self.service.base_url, path))
            .bearer_auth(key))
    }

    async fn chat(&self, system: &str, user: &str) -> CoreResult<String> {
        let body = ChatRequest {
            model: &self.service.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.3,
        };
        let response = http::send(BACKEND, self.post("chat/completions")?.json(&body)).await?;
        let parsed: ChatResponse = http::read_json(BACKEND, response).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                CoreError::permanent(
                    BACKEND,
                    FailureReason::InvalidResponse,
                    "Chat completion returned no content",
                )
            })
    }
}

#[async_trait]
impl GeneratorAdapter for OpenAiAdapter {
    fn backend_id(&self) -> &str {
        BackendKind::OpenAi.id()
    }

    fn capabilities(&self) -> Vec<Capability> {
        BackendKind::OpenAi.capabilities().to_vec()
    }

    async fn generate_voice(&self, request: &VoiceRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        let voice = resolve_voice(&request.voice.speaker);
        let speed = (f64::from(request.voice.speed_percent) / 100.0).clamp(0.25, 4.0);
        let body = SpeechRequest {
            model: &self.service.tts_model,
            voice,
            input: &request.text,
            speed,
            response_format: "mp3",
        };
        debug!(scene = request.scene, voice, speed, "Requesting OpenAI speech");

        let response = http::send(BACKEND, self.post("audio/speech")?.json(&body)).await?;
        let audio = http::read_bytes_capped(BACKEND, response, MAX_DOWNLOAD_BYTES).await?;
        assets.write(request.scene, AssetKind::Audio, "mp3", &audio)
    }

    async fn translate(&self, text: &str, target_language: &str) -> CoreResult<String> {
        let user = format!("Translate the following text into {target_language}:\n\n{text}");
        self.chat(TRANSLATOR_SYSTEM_PROMPT, &user).await
    }

    async fn rewrite_prompt(&self, prompt: &str, attempt: u32) -> CoreResult<String> {
        // The first rewrite is a local word swap; later ones ask the model.
        if attempt == 0 {
            return Ok(soften_prompt(prompt));
        }
        let user = format!(
            "Rewrite this image prompt so it passes moderation while keeping its meaning. \
             Previous attempts failed {attempt} time(s).\n\n{prompt}"
        );
        let rewritten = self.chat(REWRITE_SYSTEM_PROMPT, &user).await?;
        info!(attempt, "Rewrote rejected prompt");
        if rewritten == prompt {
            return Ok(format!("{prompt}{SAFE_VERSION_SUFFIX}"));
        }
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenes::VoiceParams;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(url: &str, key: &str) -> OpenAiAdapter {
        let mut config = GenerationConfig::default();
        config.services.openai.base_url = url.to_string();
        config.services.openai.api_key = key.to_string();
        OpenAiAdapter::from_config(&config).unwrap()
    }

    fn chat_reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": { "role": "assistant", "content": content } } ]
        }))
    }

    #[test]
    fn voices_resolve_from_ids_and_names() {
        assert_eq!(resolve_voice("1"), "alloy");
        assert_eq!(resolve_voice("5"), "nova");
        assert_eq!(resolve_voice("Shimmer"), "shimmer");
        assert_eq!(resolve_voice("13"), "alloy");
        assert_eq!(resolve_voice("0"), "alloy");
    }

    #[tokio::test]
    async fn speech_writes_mp3() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/speech"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "voice": "nova", "response_format": "mp3", "speed": 1.5 })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3-mp3".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let writer = AssetWriter::new(dir.path());
        let request = VoiceRequest {
            scene: 0,
            text: "Hello".to_string(),
            voice: VoiceParams {
                speaker: "5".to_string(),
                speed_percent: 150,
            },
        };
        let asset = adapter(&server.uri(), "sk-test")
            .generate_voice(&request, &writer)
            .await
            .unwrap();
        assert!(asset.path.ends_with(".mp3"));
        assert_eq!(asset.duration_ms, None);
    }

    #[tokio::test]
    async fn missing_key_is_permanent_auth_failure() {
        let err = adapter("http://127.0.0.1:9", "")
            .translate("こんにちは", "English")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.backend_failure().unwrap().reason, FailureReason::Auth);
    }

    #[tokio::test]
    async fn translate_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(chat_reply("  A quiet village at dawn \n"))
            .mount(&server)
            .await;

        let text = adapter(&server.uri(), "sk-test")
            .translate("夜明けの静かな村", "English")
            .await
            .unwrap();
        assert_eq!(text, "A quiet village at dawn");
    }

    #[tokio::test]
    async fn first_rewrite_is_local() {
        let rewritten = adapter("http://127.0.0.1:9", "sk-test")
            .rewrite_prompt("blood on the floor", 0)
            .await
            .unwrap();
        assert!(!rewritten.contains("blood"));
        assert!(rewritten.ends_with(", tasteful, appropriate, decent"));
    }

    #[tokio::test]
    async fn unchanged_rewrite_gets_safe_suffix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(chat_reply("a knight"))
            .mount(&server)
            .await;

        let rewritten = adapter(&server.uri(), "sk-test")
            .rewrite_prompt("a knight", 1)
            .await
            .unwrap();
        assert_eq!(rewritten, "a knight, safe version");
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri(), "sk-test")
            .translate("x", "English")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
