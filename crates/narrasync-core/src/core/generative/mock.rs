//! Scripted in-memory adapter.
//!
//! Stands in for real backends in tests and offline runs. Each
//! `(scene, asset kind)` pair can be given a queue of outcomes; once the queue
//! is drained the per-kind fallback (success by default) applies.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;

use super::adapter::{Capability, GeneratorAdapter, ImageRequest, VoiceRequest};
use crate::core::scenes::{AssetRef, AssetWriter};
use crate::core::{AssetKind, CoreError, CoreResult, FailureReason, SceneIndex};

/// Length of the silent WAV written for successful voice calls
pub const MOCK_AUDIO_MS: u64 = 500;

const MOCK_SAMPLE_RATE: u32 = 8000;

/// What one scripted call does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    /// Fails with a backend error of this reason (transient or permanent per the reason)
    Fail(FailureReason),
    /// Never completes; only a timeout or cancellation ends the call
    Hang,
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub scene: SceneIndex,
    pub kind: AssetKind,
    /// Prompt for images, voice text for audio
    pub input: String,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Adapter whose behaviour is scripted per scene and asset kind
pub struct ScriptedAdapter {
    id: String,
    capabilities: Vec<Capability>,
    scripts: Mutex<HashMap<(SceneIndex, AssetKind), VecDeque<Outcome>>>,
    fallback: Mutex<HashMap<AssetKind, Outcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    text_calls: Mutex<u32>,
}

impl std::fmt::Debug for ScriptedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedAdapter")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl ScriptedAdapter {
    /// Creates an adapter offering every capability, succeeding by default
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: vec![
                Capability::ImageGeneration,
                Capability::VoiceGeneration,
                Capability::Translation,
                Capability::PromptRewrite,
            ],
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            text_calls: Mutex::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Queues outcomes for the next calls on `(scene, kind)`
    pub fn script(&self, scene: SceneIndex, kind: AssetKind, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.scripts)
            .entry((scene, kind))
            .or_default()
            .extend(outcomes);
    }

    /// Outcome used once a scene's script is drained
    pub fn always(&self, kind: AssetKind, outcome: Outcome) {
        lock(&self.fallback).insert(kind, outcome);
    }

    /// Every generation call so far, in call order
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, kind: AssetKind) -> usize {
        lock(&self.calls).iter().filter(|c| c.kind == kind).count()
    }

    pub fn calls_for(&self, scene: SceneIndex, kind: AssetKind) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.scene == scene && c.kind == kind)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Translation and rewrite calls
    pub fn text_calls(&self) -> u32 {
        *lock(&self.text_calls)
    }

    fn next_outcome(&self, scene: SceneIndex, kind: AssetKind, input: &str) -> Outcome {
        lock(&self.calls).push(RecordedCall {
            scene,
            kind,
            input: input.to_string(),
        });
        let scripted = lock(&self.scripts)
            .get_mut(&(scene, kind))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            lock(&self.fallback)
                .get(&kind)
                .copied()
                .unwrap_or(Outcome::Succeed)
        })
    }

    async fn settle(&self, outcome: Outcome) -> CoreResult<()> {
        match outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(reason) => Err(CoreError::backend(
                &self.id,
                reason,
                format!("scripted {reason} failure"),
            )),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

fn silent_wav(duration_ms: u64) -> CoreResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: MOCK_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = duration_ms * u64::from(MOCK_SAMPLE_RATE) / 1000;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CoreError::Internal(format!("Failed to build WAV: {e}")))?;
        for _ in 0..frames {
            writer
                .write_sample(0i16)
                .map_err(|e| CoreError::Internal(format!("Failed to build WAV: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| CoreError::Internal(format!("Failed to build WAV: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl GeneratorAdapter for ScriptedAdapter {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    async fn generate_image(&self, request: &ImageRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        if !self.supports(Capability::ImageGeneration) {
            return Err(super::adapter::unsupported(&self.id, Capability::ImageGeneration));
        }
        let outcome = self.next_outcome(request.scene, AssetKind::Image, &request.prompt);
        self.settle(outcome).await?;
        let payload = format!("{}|{}|{}", self.id, request.scene, request.prompt);
        assets.write(request.scene, AssetKind::Image, "png", payload.as_bytes())
    }

    async fn generate_voice(&self, request: &VoiceRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        if !self.supports(Capability::VoiceGeneration) {
            return Err(super::adapter::unsupported(&self.id, Capability::VoiceGeneration));
        }
        let outcome = self.next_outcome(request.scene, AssetKind::Audio, &request.text);
        self.settle(outcome).await?;
        assets.write(request.scene, AssetKind::Audio, "wav", &silent_wav(MOCK_AUDIO_MS)?)
    }

    async fn translate(&self, text: &str, target_language: &str) -> CoreResult<String> {
        if !self.supports(Capability::Translation) {
            return Err(super::adapter::unsupported(&self.id, Capability::Translation));
        }
        *lock(&self.text_calls) += 1;
        Ok(format!("[{target_language}] {text}"))
    }

    async fn rewrite_prompt(&self, prompt: &str, attempt: u32) -> CoreResult<String> {
        if !self.supports(Capability::PromptRewrite) {
            return Err(super::adapter::unsupported(&self.id, Capability::PromptRewrite));
        }
        *lock(&self.text_calls) += 1;
        Ok(format!("{prompt}, rewritten {attempt}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenes::{StyleParams, VoiceParams};
    use crate::core::config::GenerationConfig;
    use tempfile::TempDir;

    fn image_request(scene: SceneIndex) -> ImageRequest {
        ImageRequest {
            scene,
            prompt: format!("prompt {scene}"),
            style: StyleParams::from_config(&GenerationConfig::default()),
        }
    }

    #[tokio::test]
    async fn scripts_apply_per_scene_then_fall_back() {
        let dir = TempDir::new().unwrap();
        let writer = AssetWriter::new(dir.path());
        let adapter = ScriptedAdapter::new("mock");
        adapter.script(1, AssetKind::Image, [Outcome::Fail(FailureReason::Timeout)]);

        assert!(adapter.generate_image(&image_request(0), &writer).await.is_ok());
        let err = adapter
            .generate_image(&image_request(1), &writer)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(adapter.generate_image(&image_request(1), &writer).await.is_ok());

        assert_eq!(adapter.calls_for(1, AssetKind::Image), 2);
        assert_eq!(adapter.call_count(AssetKind::Image), 3);
        assert_eq!(adapter.calls()[0].input, "prompt 0");
    }

    #[tokio::test]
    async fn voice_writes_wav_with_known_duration() {
        let dir = TempDir::new().unwrap();
        let writer = AssetWriter::new(dir.path());
        let adapter = ScriptedAdapter::new("mock");
        let asset = adapter
            .generate_voice(
                &VoiceRequest {
                    scene: 0,
                    text: "hello".to_string(),
                    voice: VoiceParams::from_config(&GenerationConfig::default()),
                },
                &writer,
            )
            .await
            .unwrap();
        assert_eq!(asset.duration_ms, Some(MOCK_AUDIO_MS));
    }

    #[tokio::test]
    async fn missing_capability_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let adapter =
            ScriptedAdapter::new("voice-only").with_capabilities(vec![Capability::VoiceGeneration]);
        let err = adapter
            .generate_image(&image_request(0), &AssetWriter::new(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.backend_failure().unwrap().reason, FailureReason::Unsupported);
        assert_eq!(adapter.total_calls(), 0);
    }
}
