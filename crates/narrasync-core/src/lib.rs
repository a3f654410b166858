//! NarraSync Core Library
//!
//! Turns narrative text into a narrated video: the text is split into scenes,
//! each scene gets a generated image and narration, and the scenes are joined
//! into one video with burned-in subtitles.
//!
//! Generated assets are cached per scene and keyed by fingerprints of their
//! inputs, so re-running the pipeline only calls backends for scenes whose
//! inputs changed. [`ProjectSession`] wires every component for one project
//! directory.

pub mod core;

use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::core::config::GenerationConfig;
use crate::core::dictionary::{LocalDictionary, PronunciationDictionary};
use crate::core::ffmpeg::FfmpegEncoder;
use crate::core::generative::Backends;
use crate::core::pipeline::{GenerationReport, PipelineController, SceneOverrides};
use crate::core::recompose::{RecomposeOptions, VideoAssetRef, VideoEncoder, VideoRecomposer};
use crate::core::scenes::{ProjectState, ProjectSummary, PruneReport, SceneStore};
use crate::core::{AssetKind, CoreError, CoreResult, SceneIndex};

// =============================================================================
// Logging
// =============================================================================

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` filters output (INFO by default). With `log_dir`, logs also go
/// to a daily-rolling `narrasync.log` there. Later calls are ignored.
pub fn init_logging(log_dir: Option<&Path>) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir.and_then(|dir| {
        // Best effort: a log directory we cannot create only loses the file output.
        std::fs::create_dir_all(dir).ok()?;
        let file_appender = tracing_appender::rolling::daily(dir, "narrasync.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests, repeated CLI setup).
    let _ = tracing::subscriber::set_global_default(subscriber);
}

// =============================================================================
// Project Session
// =============================================================================

/// One open project with its store, backends, dictionary and pipeline.
///
/// Holds the project's single-writer lock until dropped.
pub struct ProjectSession {
    store: Arc<SceneStore>,
    controller: Arc<PipelineController>,
    dictionary: Arc<dyn PronunciationDictionary>,
    encoder: Option<Arc<dyn VideoEncoder>>,
}

impl std::fmt::Debug for ProjectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectSession")
            .field("root", &self.store.root())
            .finish_non_exhaustive()
    }
}

impl ProjectSession {
    /// Creates a new project in `dir`
    pub fn create(dir: &Path, name: &str, config: GenerationConfig) -> CoreResult<Self> {
        let backends = Backends::from_config(&config)?;
        let store = Arc::new(SceneStore::create(dir, name, config)?);
        Ok(Self::assemble(store, backends))
    }

    /// Opens the project in `dir`, replacing its configuration when `config` is given
    pub async fn open(dir: &Path, config: Option<GenerationConfig>) -> CoreResult<Self> {
        let store = Arc::new(SceneStore::open(dir)?);
        if let Some(config) = config {
            let demoted = store.set_config(config).await?;
            if !demoted.is_empty() {
                info!(scenes = ?demoted, "Configuration change made scenes stale");
            }
        }
        let backends = Backends::from_config(&store.config().await)?;
        Ok(Self::assemble(store, backends))
    }

    /// Wires a session around an open store and explicit backends
    pub fn assemble(store: Arc<SceneStore>, backends: Backends) -> Self {
        let dictionary: Arc<dyn PronunciationDictionary> =
            Arc::new(LocalDictionary::new(store.dictionary_path()));
        let controller = Arc::new(PipelineController::new(
            store.clone(),
            backends,
            dictionary.clone(),
        ));
        Self {
            store,
            controller,
            dictionary,
            encoder: None,
        }
    }

    /// Uses `encoder` for recomposition instead of a detected FFmpeg
    pub fn with_encoder(mut self, encoder: Arc<dyn VideoEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn store(&self) -> &Arc<SceneStore> {
        &self.store
    }

    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    pub async fn plan(&self, text: &str) -> CoreResult<ProjectState> {
        self.controller.plan_project(text).await
    }

    pub async fn resplit(&self, text: &str) -> CoreResult<ProjectState> {
        self.controller.resplit(text).await
    }

    pub async fn generate(&self) -> CoreResult<GenerationReport> {
        self.controller.generate_all().await
    }

    pub async fn regenerate(
        &self,
        index: SceneIndex,
        overrides: SceneOverrides,
    ) -> CoreResult<GenerationReport> {
        self.controller.regenerate_scene(index, overrides).await
    }

    pub async fn retry_failed(&self) -> CoreResult<GenerationReport> {
        self.controller.retry_failed().await
    }

    pub async fn refresh_voice_text(&self) -> CoreResult<Vec<SceneIndex>> {
        self.controller.refresh_voice_text().await
    }

    /// Builds the final video, detecting FFmpeg unless an encoder was supplied
    pub async fn recompose(&self, options: RecomposeOptions) -> CoreResult<VideoAssetRef> {
        let encoder = match &self.encoder {
            Some(encoder) => encoder.clone(),
            None => {
                let config = self.store.config().await;
                let detected = FfmpegEncoder::detect(config.video.ffmpeg_path.as_deref())?;
                Arc::new(detected) as Arc<dyn VideoEncoder>
            }
        };
        VideoRecomposer::new(self.store.clone(), encoder)
            .recompose(options)
            .await
    }

    /// The project's pronunciation dictionary, or the VOICEVOX engine's with `remote`
    pub async fn dictionary(&self, remote: bool) -> CoreResult<Arc<dyn PronunciationDictionary>> {
        if !remote {
            return Ok(self.dictionary.clone());
        }
        remote_dictionary(&self.store.config().await)
    }

    pub async fn rollback(&self, index: SceneIndex, kind: AssetKind) -> CoreResult<()> {
        self.controller.rollback_asset(index, kind).await
    }

    pub async fn prune(&self) -> CoreResult<PruneReport> {
        self.controller.prune_assets().await
    }

    pub async fn status(&self) -> ProjectSummary {
        self.store.snapshot().await.summary()
    }
}

#[cfg(feature = "ai-providers")]
fn remote_dictionary(config: &GenerationConfig) -> CoreResult<Arc<dyn PronunciationDictionary>> {
    let dictionary = crate::core::generative::VoicevoxDictionary::from_config(config)?;
    Ok(Arc::new(dictionary))
}

#[cfg(not(feature = "ai-providers"))]
fn remote_dictionary(_config: &GenerationConfig) -> CoreResult<Arc<dyn PronunciationDictionary>> {
    Err(CoreError::ValidationError(
        "Remote dictionary requires the ai-providers feature".to_string(),
    ))
}

/// Reads a narrative text file for planning
pub fn read_story(path: &Path) -> CoreResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        CoreError::ValidationError(format!("Failed to read story {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dictionary::DictionaryWord;
    use crate::core::generative::ScriptedAdapter;
    use crate::core::recompose::RecordingEncoder;
    use crate::core::scenes::SceneState;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> (ProjectSession, Arc<ScriptedAdapter>, Arc<RecordingEncoder>) {
        let mut config = GenerationConfig::default();
        config.segmentation.preserve_line_breaks = true;
        let store = Arc::new(SceneStore::create(dir.path(), "demo", config).unwrap());
        let adapter = Arc::new(ScriptedAdapter::new("mock"));
        let backends = Backends {
            image: adapter.clone(),
            voice: adapter.clone(),
            text: None,
        };
        let encoder = Arc::new(RecordingEncoder::new(500));
        let session = ProjectSession::assemble(store, backends).with_encoder(encoder.clone());
        (session, adapter, encoder)
    }

    #[tokio::test]
    async fn plan_generate_recompose() {
        let dir = TempDir::new().unwrap();
        let (session, _adapter, encoder) = session(&dir);
        session.controller().take_event_receiver();

        session.plan("First scene.\nSecond scene.").await.unwrap();
        let report = session.generate().await.unwrap();
        assert_eq!(report.generated, vec![0, 1]);

        let video = session
            .recompose(RecomposeOptions::default())
            .await
            .unwrap();
        assert_eq!(video.rendered_scenes, vec![0, 1]);
        assert_eq!(encoder.concats().len(), 1);

        let status = session.status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.ready, 2);
    }

    #[tokio::test]
    async fn session_dictionary_feeds_planning() {
        let dir = TempDir::new().unwrap();
        let (session, _, _) = session(&dir);
        session
            .dictionary(false)
            .await
            .unwrap()
            .add(DictionaryWord::new("NarraSync", "narra sink"))
            .await
            .unwrap();

        let state = session.plan("NarraSync speaks.").await.unwrap();
        assert_eq!(state.scenes[0].voice_text, "narra sink speaks.");
    }

    #[tokio::test]
    async fn rollback_restores_previous_image() {
        let dir = TempDir::new().unwrap();
        let (session, adapter, _) = session(&dir);
        session.plan("Only scene.").await.unwrap();
        session.generate().await.unwrap();
        let first = session.store().snapshot().await.scenes[0].image.clone().unwrap();

        session
            .regenerate(
                0,
                SceneOverrides {
                    prompt: Some("A different view".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        session.rollback(0, AssetKind::Image).await.unwrap();

        let scene = session.store().snapshot().await.scenes[0].clone();
        assert_eq!(scene.image.as_ref().unwrap().asset, first.asset);
        assert_eq!(scene.state, SceneState::Ready);

        let calls = adapter.total_calls();
        session.generate().await.unwrap();
        assert_eq!(adapter.total_calls(), calls);
    }

    #[tokio::test]
    async fn prune_is_refused_during_generation() {
        use crate::core::generative::Outcome;

        let dir = TempDir::new().unwrap();
        let (session, adapter, _) = session(&dir);
        session.plan("Only scene.").await.unwrap();
        adapter.script(0, AssetKind::Audio, [Outcome::Hang]);

        let controller = session.controller().clone();
        let run = tokio::spawn(async move { controller.generate_all().await });
        for _ in 0..1000 {
            if adapter.calls_for(0, AssetKind::Audio) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(matches!(
            session.prune().await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(matches!(
            session.rollback(0, AssetKind::Image).await,
            Err(CoreError::ValidationError(_))
        ));

        session.controller().cancel_all();
        run.await.unwrap().unwrap();
        assert!(session.prune().await.is_ok());
    }

    #[tokio::test]
    async fn second_session_on_same_project_is_locked() {
        let dir = TempDir::new().unwrap();
        let (_session, _, _) = session(&dir);

        let err = ProjectSession::open(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, CoreError::ProjectLocked(_)));
    }

    #[tokio::test]
    async fn opening_missing_project_fails() {
        let dir = TempDir::new().unwrap();
        let err = ProjectSession::open(&dir.path().join("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProjectNotFound(_)));
    }

    #[test]
    fn init_logging_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        init_logging(Some(dir.path()));
        init_logging(None);
    }
}
