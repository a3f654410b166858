//! Pipeline Controller
//!
//! Drives scenes through `Unplanned -> Pending -> Generating -> Ready | Failed`.
//! Stale scenes run as independent tasks on a `JoinSet`, bounded by a
//! semaphore; within a scene the image and the narration are generated
//! concurrently and committed together in a single store update. One scene's
//! failure never blocks its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{GenerationReport, PipelineEvent, SceneOverrides};
use crate::core::config::{compose_image_prompt, GenerationConfig};
use crate::core::dictionary::{apply_substitutions, DictionaryEntry, PronunciationDictionary};
use crate::core::executor::{RetryExecutor, RetryPolicy, Sleeper, TokioSleeper};
use crate::core::generative::{local_rewrite, Backends, Capability, ImageRequest, VoiceRequest};
use crate::core::scenes::{
    reconcile_ready_scenes, stale_kinds, AssetOrigin, AssetRecord, DesiredFingerprints,
    DirtyReason, ProjectState, PruneReport, RerollTarget, Scene, SceneFailure, SceneState,
    SceneStore, StyleParams, VoiceParams,
};
use crate::core::segment::{SentenceSegmenter, TextSegmenter};
use crate::core::{
    AssetKind, CoreError, CoreResult, ExecutionErrorKind, Fingerprint, SceneIndex,
};

/// Backend id recorded on user-supplied assets
pub const UPLOAD_BACKEND: &str = "upload";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn is_cancellation(error: &CoreError) -> bool {
    match error {
        CoreError::Cancelled => true,
        CoreError::Execution(e) => e.kind == ExecutionErrorKind::Cancelled,
        _ => false,
    }
}

// =============================================================================
// Run Registration
// =============================================================================

struct ActiveRun {
    run: CancellationToken,
    scenes: HashMap<SceneIndex, CancellationToken>,
}

/// Publishes a run's cancellation tokens until dropped
struct RunRegistration<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
    run: CancellationToken,
    scenes: HashMap<SceneIndex, CancellationToken>,
}

impl<'a> RunRegistration<'a> {
    fn new(slot: &'a Mutex<Option<ActiveRun>>, scenes: &[SceneIndex]) -> Self {
        let run = CancellationToken::new();
        let scenes: HashMap<_, _> = scenes.iter().map(|i| (*i, run.child_token())).collect();
        *lock(slot) = Some(ActiveRun {
            run: run.clone(),
            scenes: scenes.clone(),
        });
        Self { slot, run, scenes }
    }

    fn scene_token(&self, index: SceneIndex) -> CancellationToken {
        self.scenes
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.run.child_token())
    }
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Orchestrates planning, generation and per-scene edits for one project
pub struct PipelineController {
    store: Arc<SceneStore>,
    backends: Backends,
    dictionary: Arc<dyn PronunciationDictionary>,
    segmenter: Option<Arc<dyn TextSegmenter>>,
    sleeper: Arc<dyn Sleeper>,
    backend_calls: Arc<AtomicU32>,
    run_guard: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveRun>>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PipelineEvent>>>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("root", &self.store.root())
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    pub fn new(
        store: Arc<SceneStore>,
        backends: Backends,
        dictionary: Arc<dyn PronunciationDictionary>,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            store,
            backends,
            dictionary,
            segmenter: None,
            sleeper: Arc::new(TokioSleeper),
            backend_calls: Arc::new(AtomicU32::new(0)),
            run_guard: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            events,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Replaces the sentence segmenter built from the project configuration
    pub fn with_segmenter(mut self, segmenter: Arc<dyn TextSegmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// Replaces the retry backoff sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &Arc<SceneStore> {
        &self.store
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Takes the progress event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<PipelineEvent>> {
        lock(&self.event_rx).take()
    }

    /// Backend attempts made through this controller so far
    pub fn backend_calls(&self) -> u32 {
        self.backend_calls.load(Ordering::SeqCst)
    }

    fn executor_for(&self, config: &GenerationConfig) -> RetryExecutor {
        let counter = self.backend_calls.clone();
        RetryExecutor::new(RetryPolicy::from_config(&config.processing))
            .with_sleeper(self.sleeper.clone())
            .with_observer(Arc::new(move |_: &str, _: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
    }

    fn begin_run(&self) -> CoreResult<tokio::sync::MutexGuard<'_, ()>> {
        self.run_guard.try_lock().map_err(|_| {
            CoreError::ValidationError(
                "Another pipeline run is already in progress for this project".to_string(),
            )
        })
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancels one scene of the current run. Returns false when it is not running.
    pub fn cancel_scene(&self, index: SceneIndex) -> bool {
        match lock(&self.active).as_ref().and_then(|r| r.scenes.get(&index)) {
            Some(token) => {
                info!(scene = index, "Cancelling scene");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the current run. Returns false when nothing is running.
    pub fn cancel_all(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(active) => {
                info!("Cancelling pipeline run");
                active.run.cancel();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Restores a scene's previous asset. Refused while a run is active.
    pub async fn rollback_asset(&self, index: SceneIndex, kind: AssetKind) -> CoreResult<()> {
        let _run = self.begin_run()?;
        self.store.rollback_asset(index, kind).await
    }

    /// Deletes unreferenced asset files.
    ///
    /// Refused while a run is active: a worker's new assets stay unreferenced
    /// until the scene commits.
    pub async fn prune_assets(&self) -> CoreResult<PruneReport> {
        let _run = self.begin_run()?;
        self.store.prune_assets().await
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Splits `text` into scenes and replaces the project's scenes with them.
    ///
    /// Blank input yields a project with zero scenes.
    pub async fn plan_project(&self, text: &str) -> CoreResult<ProjectState> {
        let _run = self.begin_run()?;
        let config = self.store.config().await;
        let scenes = self.build_scenes(text, &config, &[]).await?;
        info!(scenes = scenes.len(), "Planned project");

        self.store
            .update(move |state| {
                state.scenes = scenes;
                state.recomposition = None;
                Ok(())
            })
            .await?;
        Ok(self.store.snapshot().await)
    }

    /// Re-runs the splitter over new text. Scenes whose index and text are
    /// unchanged keep their prompt, assets and state.
    pub async fn resplit(&self, text: &str) -> CoreResult<ProjectState> {
        let _run = self.begin_run()?;
        let current = self.store.snapshot().await;
        let scenes = self
            .build_scenes(text, &current.config, &current.scenes)
            .await?;
        let kept = scenes
            .iter()
            .zip(current.scenes.iter())
            .filter(|(new, old)| new.text == old.text)
            .count();
        info!(scenes = scenes.len(), kept, "Re-split project");

        self.store
            .update(move |state| {
                state.scenes = scenes;
                Ok(())
            })
            .await?;
        Ok(self.store.snapshot().await)
    }

    async fn build_scenes(
        &self,
        text: &str,
        config: &GenerationConfig,
        existing: &[Scene],
    ) -> CoreResult<Vec<Scene>> {
        let segments = match &self.segmenter {
            Some(segmenter) => segmenter.segment(text),
            None => SentenceSegmenter::from_config(&config.segmentation).segment(text),
        };
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.planning_substitutions().await;
        let executor = self.executor_for(config);
        let registration = RunRegistration::new(&self.active, &[]);

        let mut scenes = Vec::with_capacity(segments.len());
        for (index, text) in segments.into_iter().enumerate() {
            if registration.run.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if let Some(previous) = existing.get(index).filter(|s| s.text == text) {
                scenes.push(previous.clone());
                continue;
            }
            let mut scene = Scene::new(index, text);
            scene.voice_text = apply_substitutions(&scene.text, &entries);
            scene.prompt = self
                .derive_prompt(&scene.text, config, &executor, &registration.run)
                .await;
            scene.transition(SceneState::Pending)?;
            scenes.push(scene);
        }
        Ok(scenes)
    }

    async fn planning_substitutions(&self) -> Vec<DictionaryEntry> {
        match self.dictionary.substitutions().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Pronunciation dictionary unavailable, using scene text as-is: {}", e);
                Vec::new()
            }
        }
    }

    /// Image prompt for a scene: translated when a translation backend is configured
    async fn derive_prompt(
        &self,
        text: &str,
        config: &GenerationConfig,
        executor: &RetryExecutor,
        cancel: &CancellationToken,
    ) -> String {
        let backend = match &self.backends.text {
            Some(backend)
                if config.translation.enabled && backend.supports(Capability::Translation) =>
            {
                backend
            }
            _ => return text.to_string(),
        };

        let operation = format!("{}:translate", backend.backend_id());
        let target = config.translation.target_language.as_str();
        match executor
            .execute(&operation, cancel, |_| backend.translate(text, target))
            .await
        {
            Ok(done) if !done.value.trim().is_empty() => done.value.trim().to_string(),
            Ok(_) => {
                warn!("Translation returned nothing, using scene text as prompt");
                text.to_string()
            }
            Err(e) => {
                warn!("Translation failed, using scene text as prompt: {}", e);
                text.to_string()
            }
        }
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Generates every stale Pending or Ready scene. Failed scenes wait for [`Self::retry_failed`].
    pub async fn generate_all(&self) -> CoreResult<GenerationReport> {
        let _run = self.begin_run()?;
        self.run_generation(None).await
    }

    /// Applies `overrides` to one scene and regenerates whatever they made stale
    pub async fn regenerate_scene(
        &self,
        index: SceneIndex,
        overrides: SceneOverrides,
    ) -> CoreResult<GenerationReport> {
        overrides.validate()?;
        let _run = self.begin_run()?;
        self.store.snapshot().await.scene(index)?;

        let mut uploads = Vec::new();
        for (kind, path) in overrides.uploads() {
            uploads.push((kind, self.store.assets().import(index, kind, path)?));
        }

        self.store
            .update(move |state| {
                let config = state.config.clone();
                let depth = config.processing.asset_history_depth;
                let scene = state.scene_mut(index)?;

                if let Some(prompt) = overrides.prompt.as_deref().map(str::trim) {
                    if prompt != scene.prompt {
                        scene.prompt = prompt.to_string();
                        scene.mark_dirty(DirtyReason::PromptEdited);
                    }
                }
                if let Some(voice_text) = overrides.voice_text.as_deref().map(str::trim) {
                    if voice_text != scene.voice_text {
                        scene.voice_text = voice_text.to_string();
                        scene.mark_dirty(DirtyReason::VoiceEdited);
                    }
                }
                if overrides.reroll != RerollTarget::None {
                    scene.mark_dirty(DirtyReason::Reroll(overrides.reroll));
                }
                if !uploads.is_empty() {
                    let desired = DesiredFingerprints::for_scene(scene, &config);
                    for (kind, asset) in uploads {
                        let record = AssetRecord {
                            asset,
                            fingerprint: desired.get(kind).clone(),
                            origin: AssetOrigin::Uploaded,
                            backend: UPLOAD_BACKEND.to_string(),
                            attempts: 0,
                            prompt_used: None,
                            created_at: now_rfc3339(),
                        };
                        scene.set_asset(kind, record, depth);
                    }
                }
                if matches!(scene.state, SceneState::Ready | SceneState::Failed) {
                    scene.transition(SceneState::Pending)?;
                }
                Ok(())
            })
            .await?;

        info!(scene = index, "Applied scene overrides");
        self.run_generation(Some(index)).await
    }

    /// Moves every Failed scene back to Pending and regenerates
    pub async fn retry_failed(&self) -> CoreResult<GenerationReport> {
        let _run = self.begin_run()?;
        let retried = self
            .store
            .update(|state| {
                let mut retried = Vec::new();
                for scene in state
                    .scenes
                    .iter_mut()
                    .filter(|s| s.state == SceneState::Failed)
                {
                    scene.mark_dirty(DirtyReason::ManualRetry);
                    scene.transition(SceneState::Pending)?;
                    retried.push(scene.index);
                }
                Ok(retried)
            })
            .await?;

        info!(scenes = ?retried, "Retrying failed scenes");
        self.run_generation(None).await
    }

    /// Re-derives every scene's voice text from the dictionary.
    ///
    /// Returns the scenes whose voice text changed; only those become stale.
    /// Hand-edited voice text is replaced as well.
    pub async fn refresh_voice_text(&self) -> CoreResult<Vec<SceneIndex>> {
        let _run = self.begin_run()?;
        let entries = self.dictionary.substitutions().await?;
        let changed = self
            .store
            .update(move |state| {
                let mut changed = Vec::new();
                for scene in state.scenes.iter_mut() {
                    let voice_text = apply_substitutions(&scene.text, &entries);
                    if voice_text != scene.voice_text {
                        scene.voice_text = voice_text;
                        changed.push(scene.index);
                    }
                }
                let demoted = reconcile_ready_scenes(state);
                debug!(demoted = ?demoted, "Scenes demoted after voice refresh");
                Ok(changed)
            })
            .await?;

        info!(scenes = ?changed, "Refreshed voice text");
        Ok(changed)
    }

    async fn run_generation(&self, only: Option<SceneIndex>) -> CoreResult<GenerationReport> {
        let calls_before = self.backend_calls();
        let mut report = GenerationReport::default();
        let state = self.store.snapshot().await;
        let config = Arc::new(state.config.clone());

        let mut jobs: Vec<(Scene, Vec<AssetKind>)> = Vec::new();
        let mut promote = Vec::new();
        for scene in &state.scenes {
            if only.is_some_and(|index| index != scene.index) {
                continue;
            }
            let kinds = stale_kinds(scene, &config);
            match scene.state {
                SceneState::Ready | SceneState::Pending if !kinds.is_empty() => {
                    jobs.push((scene.clone(), kinds));
                }
                SceneState::Pending => {
                    // Committed assets already match (rollback or upload)
                    promote.push(scene.index);
                    report.skipped.push(scene.index);
                }
                _ => report.skipped.push(scene.index),
            }
        }

        if jobs.is_empty() && promote.is_empty() {
            report.sort();
            debug!(skipped = report.skipped.len(), "Nothing to generate");
            return Ok(report);
        }

        let starting: Vec<SceneIndex> = jobs.iter().map(|(scene, _)| scene.index).collect();
        {
            let starting = starting.clone();
            self.store
                .update(move |state| {
                    for index in starting {
                        let scene = state.scene_mut(index)?;
                        if scene.state == SceneState::Ready {
                            scene.transition(SceneState::Pending)?;
                        }
                        scene.transition(SceneState::Generating)?;
                    }
                    for index in promote {
                        let scene = state.scene_mut(index)?;
                        scene.transition(SceneState::Generating)?;
                        scene.transition(SceneState::Ready)?;
                    }
                    Ok(())
                })
                .await?;
        }

        let registration = RunRegistration::new(&self.active, &starting);
        let worker = SceneWorker {
            store: self.store.clone(),
            backends: self.backends.clone(),
            executor: self.executor_for(&config),
            config: config.clone(),
            events: self.events.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(config.processing.scene_concurrency.max(1)));
        info!(
            scenes = starting.len(),
            concurrency = config.processing.scene_concurrency,
            "Starting generation run"
        );

        let mut tasks = JoinSet::new();
        for (scene, kinds) in jobs {
            let token = registration.scene_token(scene.index);
            tasks.spawn(worker.clone().run(scene, kinds, token, semaphore.clone()));
        }

        let mut fatal: Option<CoreError> = None;
        let mut interrupted = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => match outcome {
                    SceneOutcome::Committed => report.generated.push(index),
                    SceneOutcome::Failed(failures) => report.failed.extend(failures),
                    SceneOutcome::Cancelled => report.cancelled.push(index),
                    SceneOutcome::Deferred => report.skipped.push(index),
                },
                Ok((index, Err(e))) => {
                    error!(scene = index, "Failed to commit scene: {}", e);
                    interrupted = true;
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!("Scene task aborted: {}", e);
                    interrupted = true;
                }
            }
        }
        drop(registration);

        if interrupted {
            self.store
                .update(|state| {
                    for scene in state
                        .scenes
                        .iter_mut()
                        .filter(|s| s.state == SceneState::Generating)
                    {
                        scene.transition(SceneState::Pending)?;
                    }
                    Ok(())
                })
                .await?;
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        report.backend_calls = self.backend_calls().saturating_sub(calls_before);
        report.sort();
        info!(
            generated = report.generated.len(),
            failed = report.failed_scenes().len(),
            cancelled = report.cancelled.len(),
            skipped = report.skipped.len(),
            backend_calls = report.backend_calls,
            "Generation run finished"
        );
        Ok(report)
    }
}

// =============================================================================
// Scene Worker
// =============================================================================

enum SceneOutcome {
    Committed,
    Failed(Vec<SceneFailure>),
    Cancelled,
    /// Inputs changed while generating; the scene waits for the next run
    Deferred,
}

/// Everything one scene task needs, cheap to clone per task
#[derive(Clone)]
struct SceneWorker {
    store: Arc<SceneStore>,
    backends: Backends,
    executor: RetryExecutor,
    config: Arc<GenerationConfig>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl SceneWorker {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        self,
        scene: Scene,
        kinds: Vec<AssetKind>,
        cancel: CancellationToken,
        semaphore: Arc<Semaphore>,
    ) -> (SceneIndex, CoreResult<SceneOutcome>) {
        let index = scene.index;
        let outcome = self.process(scene, kinds, cancel, semaphore).await;
        (index, outcome)
    }

    async fn process(
        &self,
        scene: Scene,
        kinds: Vec<AssetKind>,
        cancel: CancellationToken,
        semaphore: Arc<Semaphore>,
    ) -> CoreResult<SceneOutcome> {
        let index = scene.index;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => Some(permit.map_err(|_| {
                CoreError::Internal("Scene semaphore closed".to_string())
            })?),
        };
        let Some(_permit) = permit else {
            return self.commit_cancelled(index).await;
        };

        debug!(scene = index, kinds = ?kinds, "Generating scene");
        self.emit(PipelineEvent::SceneStarted {
            scene: index,
            kinds: kinds.clone(),
        });

        let desired = DesiredFingerprints::for_scene(&scene, &self.config);
        let image = async {
            if kinds.contains(&AssetKind::Image) {
                Some(self.generate_image(&scene, desired.image.clone(), &cancel).await)
            } else {
                None
            }
        };
        let voice = async {
            if kinds.contains(&AssetKind::Audio) {
                Some(self.generate_voice(&scene, desired.audio.clone(), &cancel).await)
            } else {
                None
            }
        };
        let (image, voice) = tokio::join!(image, voice);

        let results: Vec<(AssetKind, CoreResult<AssetRecord>)> = [
            (AssetKind::Image, image),
            (AssetKind::Audio, voice),
        ]
        .into_iter()
        .filter_map(|(kind, result)| result.map(|r| (kind, r)))
        .collect();

        if results
            .iter()
            .any(|(_, r)| r.as_ref().is_err_and(is_cancellation))
        {
            return self.commit_cancelled(index).await;
        }

        let config = self.config.clone();
        let outcome = self
            .store
            .update(move |state| {
                let depth = config.processing.asset_history_depth;
                let state_config = state.config.clone();
                let scene = state.scene_mut(index)?;
                let mut failures = Vec::new();
                for (kind, result) in results {
                    match result {
                        Ok(record) => scene.set_asset(kind, record, depth),
                        Err(error) => {
                            let failure = SceneFailure::from_error(index, kind, &error);
                            scene.failures.retain(|f| f.asset_kind != kind);
                            scene.failures.push(failure.clone());
                            failures.push(failure);
                        }
                    }
                }

                if !failures.is_empty() {
                    scene.transition(SceneState::Failed)?;
                    Ok(SceneOutcome::Failed(failures))
                } else if stale_kinds(scene, &state_config).is_empty() {
                    scene.transition(SceneState::Ready)?;
                    Ok(SceneOutcome::Committed)
                } else {
                    scene.transition(SceneState::Pending)?;
                    Ok(SceneOutcome::Deferred)
                }
            })
            .await?;

        match &outcome {
            SceneOutcome::Committed => {
                info!(scene = index, "Scene ready");
                self.emit(PipelineEvent::SceneCommitted { scene: index });
            }
            SceneOutcome::Failed(failures) => {
                for failure in failures {
                    warn!(
                        scene = index,
                        kind = %failure.asset_kind,
                        retryable = failure.retryable,
                        "Scene failed: {}",
                        failure.message
                    );
                }
                self.emit(PipelineEvent::SceneFailed {
                    scene: index,
                    failures: failures.clone(),
                });
            }
            SceneOutcome::Deferred => {
                debug!(scene = index, "Scene inputs changed during generation, deferring");
            }
            SceneOutcome::Cancelled => {}
        }
        Ok(outcome)
    }

    /// Returns a cancelled scene to Pending, leaving its committed assets as they were
    async fn commit_cancelled(&self, index: SceneIndex) -> CoreResult<SceneOutcome> {
        self.store
            .update(move |state| {
                let scene = state.scene_mut(index)?;
                if scene.state == SceneState::Generating {
                    scene.transition(SceneState::Pending)?;
                }
                Ok(())
            })
            .await?;
        info!(scene = index, "Scene cancelled");
        self.emit(PipelineEvent::SceneCancelled { scene: index });
        Ok(SceneOutcome::Cancelled)
    }

    async fn generate_image(
        &self,
        scene: &Scene,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> CoreResult<AssetRecord> {
        let backend = &self.backends.image;
        let assets = self.store.assets();
        let style = StyleParams::from_config(&self.config);
        let operation = format!("{}:image", backend.backend_id());
        let mut prompt = scene.prompt.clone();
        let mut rewrites = 0u32;
        let mut attempts = 0u32;

        loop {
            let request = ImageRequest {
                scene: scene.index,
                prompt: compose_image_prompt(&prompt, &style.style_text),
                style: style.clone(),
            };
            let request = &request;
            let result = self
                .executor
                .execute(&operation, cancel, |_| backend.generate_image(request, assets))
                .await;

            match result {
                Ok(done) => {
                    attempts += done.attempts;
                    self.emit(PipelineEvent::AssetGenerated {
                        scene: scene.index,
                        kind: AssetKind::Image,
                        attempts,
                    });
                    return Ok(AssetRecord {
                        asset: done.value,
                        fingerprint,
                        origin: AssetOrigin::Generated,
                        backend: backend.backend_id().to_string(),
                        attempts,
                        prompt_used: (rewrites > 0).then(|| prompt.clone()),
                        created_at: now_rfc3339(),
                    });
                }
                Err(mut failure) => {
                    attempts += failure.attempts;
                    let can_rewrite = failure.last_cause.is_content_rejection()
                        && rewrites < self.config.processing.content_rewrite_attempts
                        && !cancel.is_cancelled();
                    if can_rewrite {
                        prompt = self.rewrite_prompt(&prompt, rewrites, cancel).await;
                        rewrites += 1;
                        warn!(
                            scene = scene.index,
                            rewrite = rewrites,
                            "Image prompt rejected, retrying with rewritten prompt"
                        );
                        continue;
                    }
                    failure.attempts = attempts;
                    return Err(CoreError::from(failure).with_scene(scene.index, AssetKind::Image));
                }
            }
        }
    }

    async fn generate_voice(
        &self,
        scene: &Scene,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> CoreResult<AssetRecord> {
        let backend = &self.backends.voice;
        let assets = self.store.assets();
        let operation = format!("{}:voice", backend.backend_id());
        let request = VoiceRequest {
            scene: scene.index,
            text: scene.voice_text.clone(),
            voice: VoiceParams::from_config(&self.config),
        };
        let request = &request;

        let done = self
            .executor
            .execute(&operation, cancel, |_| backend.generate_voice(request, assets))
            .await
            .map_err(|e| CoreError::from(e).with_scene(scene.index, AssetKind::Audio))?;

        self.emit(PipelineEvent::AssetGenerated {
            scene: scene.index,
            kind: AssetKind::Audio,
            attempts: done.attempts,
        });
        Ok(AssetRecord {
            asset: done.value,
            fingerprint,
            origin: AssetOrigin::Generated,
            backend: backend.backend_id().to_string(),
            attempts: done.attempts,
            prompt_used: None,
            created_at: now_rfc3339(),
        })
    }

    /// Rewrites a rejected prompt, through the text backend when one is configured
    async fn rewrite_prompt(&self, prompt: &str, attempt: u32, cancel: &CancellationToken) -> String {
        if let Some(text) = self
            .backends
            .text
            .as_ref()
            .filter(|t| t.supports(Capability::PromptRewrite))
        {
            let operation = format!("{}:rewrite", text.backend_id());
            match self
                .executor
                .execute(&operation, cancel, |_| text.rewrite_prompt(prompt, attempt))
                .await
            {
                Ok(done) if !done.value.trim().is_empty() => return done.value.trim().to_string(),
                Ok(_) => warn!("Prompt rewrite returned nothing, softening locally"),
                Err(e) => warn!("Prompt rewrite failed, softening locally: {}", e),
            }
        }
        local_rewrite(prompt, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dictionary::{DictionaryWord, LocalDictionary};
    use crate::core::executor::RecordingSleeper;
    use crate::core::generative::{GeneratorAdapter, Outcome, ScriptedAdapter};
    use crate::core::scenes::{resolve_relative, AssetWriter};
    use crate::core::FailureReason;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    const STORY: &str = "Scene one.\nScene two.\nScene three.";

    struct Harness {
        dir: TempDir,
        store: Arc<SceneStore>,
        adapter: Arc<ScriptedAdapter>,
        controller: Arc<PipelineController>,
    }

    impl Harness {
        async fn scene(&self, index: SceneIndex) -> Scene {
            self.store.snapshot().await.scenes[index].clone()
        }

        fn dictionary(&self) -> LocalDictionary {
            LocalDictionary::new(self.store.dictionary_path())
        }
    }

    async fn harness_with(configure: impl FnOnce(&mut GenerationConfig), text_backend: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = GenerationConfig::default();
        config.segmentation.preserve_line_breaks = true;
        configure(&mut config);

        let store = Arc::new(SceneStore::create(dir.path(), "demo", config).unwrap());
        let adapter = Arc::new(ScriptedAdapter::new("mock"));
        let backends = Backends {
            image: adapter.clone(),
            voice: adapter.clone(),
            text: text_backend.then(|| adapter.clone() as Arc<dyn GeneratorAdapter>),
        };
        let dictionary = Arc::new(LocalDictionary::new(store.dictionary_path()));
        let controller = PipelineController::new(store.clone(), backends, dictionary)
            .with_sleeper(Arc::new(RecordingSleeper::new()));

        Harness {
            dir,
            store,
            adapter,
            controller: Arc::new(controller),
        }
    }

    async fn harness() -> Harness {
        harness_with(|_| {}, false).await
    }

    async fn generated() -> Harness {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        let report = h.controller.generate_all().await.unwrap();
        assert_eq!(report.generated, vec![0, 1, 2]);
        h
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn image_inputs(adapter: &ScriptedAdapter, scene: SceneIndex) -> Vec<String> {
        adapter
            .calls()
            .into_iter()
            .filter(|c| c.scene == scene && c.kind == AssetKind::Image)
            .map(|c| c.input)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn plan_creates_pending_scenes_with_voice_text() {
        let h = harness().await;
        h.dictionary()
            .add(DictionaryWord::new("Scene", "Seen"))
            .await
            .unwrap();

        let state = h.controller.plan_project(STORY).await.unwrap();

        assert_eq!(state.scenes.len(), 3);
        assert!(state.scenes.iter().all(|s| s.state == SceneState::Pending));
        assert_eq!(state.scenes[1].text, "Scene two.");
        assert_eq!(state.scenes[1].prompt, "Scene two.");
        assert_eq!(state.scenes[1].voice_text, "Seen two.");
        assert_eq!(h.adapter.total_calls(), 0);
    }

    #[tokio::test]
    async fn blank_text_plans_zero_scenes() {
        let h = harness().await;
        let state = h.controller.plan_project("  \n\t ").await.unwrap();
        assert!(state.scenes.is_empty());

        let report = h.controller.generate_all().await.unwrap();
        assert_eq!(report, GenerationReport::default());
    }

    #[tokio::test]
    async fn custom_segmenter_replaces_sentence_splitting() {
        struct Paragraphs;
        impl TextSegmenter for Paragraphs {
            fn segment(&self, text: &str) -> Vec<String> {
                text.split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            }
        }

        let h = harness().await;
        let store = h.store.clone();
        let controller = PipelineController::new(
            store.clone(),
            h.controller.backends().clone(),
            Arc::new(LocalDictionary::new(store.dictionary_path())),
        )
        .with_segmenter(Arc::new(Paragraphs));

        let state = controller
            .plan_project("One. Two.\nThree.\n\nFour.")
            .await
            .unwrap();

        assert_eq!(state.scenes.len(), 2);
        assert_eq!(state.scenes[0].text, "One. Two.\nThree.");
    }

    #[tokio::test]
    async fn translation_derives_prompts() {
        let h = harness_with(|c| c.translation.enabled = true, true).await;

        let state = h.controller.plan_project(STORY).await.unwrap();

        assert_eq!(state.scenes[0].prompt, "[English] Scene one.");
        assert_eq!(state.scenes[0].voice_text, "Scene one.");
        assert_eq!(h.adapter.text_calls(), 3);
    }

    #[tokio::test]
    async fn resplit_keeps_unchanged_scenes() {
        let h = generated().await;

        let state = h
            .controller
            .resplit("Scene one.\nScene two, revised.\nScene three.\nScene four.")
            .await
            .unwrap();

        let states: Vec<_> = state.scenes.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                SceneState::Ready,
                SceneState::Pending,
                SceneState::Ready,
                SceneState::Pending
            ]
        );
        let report = h.controller.generate_all().await.unwrap();
        assert_eq!(report.generated, vec![1, 3]);
    }

    // -------------------------------------------------------------------------
    // Generation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn generate_all_is_idempotent() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();

        let first = h.controller.generate_all().await.unwrap();
        assert_eq!(first.generated, vec![0, 1, 2]);
        assert_eq!(first.backend_calls, 6);
        let calls = h.adapter.total_calls();

        let second = h.controller.generate_all().await.unwrap();

        assert_eq!(h.adapter.total_calls(), calls);
        assert_eq!(second.backend_calls, 0);
        assert!(second.generated.is_empty());
        assert_eq!(second.skipped, vec![0, 1, 2]);
        let state = h.store.snapshot().await;
        assert!(state.scenes.iter().all(|s| s.is_complete()));
    }

    #[tokio::test]
    async fn timed_out_image_succeeds_on_third_attempt() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(
            1,
            AssetKind::Image,
            [
                Outcome::Fail(FailureReason::Timeout),
                Outcome::Fail(FailureReason::Timeout),
            ],
        );

        let report = h.controller.generate_all().await.unwrap();

        assert_eq!(report.generated, vec![0, 1, 2]);
        assert_eq!(h.adapter.call_count(AssetKind::Image), 5);
        let scene = h.scene(1).await;
        assert_eq!(scene.state, SceneState::Ready);
        assert_eq!(scene.image.as_ref().unwrap().attempts, 3);
        assert!(scene.image_history.is_empty());
        assert!(scene.failures.is_empty());
    }

    #[tokio::test]
    async fn image_failure_does_not_block_voice_or_siblings() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter
            .script(1, AssetKind::Image, [Outcome::Fail(FailureReason::Auth)]);

        let report = h.controller.generate_all().await.unwrap();

        assert_eq!(report.generated, vec![0, 2]);
        assert_eq!(report.failed_scenes(), vec![1]);
        assert_eq!(h.adapter.calls_for(1, AssetKind::Image), 1);

        let scene = h.scene(1).await;
        assert_eq!(scene.state, SceneState::Failed);
        assert!(scene.image.is_none());
        assert!(scene.audio.is_some());
        assert_eq!(scene.failures.len(), 1);
        let failure = &scene.failures[0];
        assert_eq!(failure.asset_kind, AssetKind::Image);
        assert!(!failure.retryable);
        assert_eq!(failure.reason, Some(FailureReason::Auth));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_scene_until_manual_retry() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(
            2,
            AssetKind::Audio,
            [Outcome::Fail(FailureReason::ServerBusy); 3],
        );

        h.controller.generate_all().await.unwrap();
        let scene = h.scene(2).await;
        assert_eq!(scene.state, SceneState::Failed);
        assert_eq!(scene.failures[0].attempts, 3);
        assert!(scene.failures[0].retryable);

        let skipped = h.controller.generate_all().await.unwrap();
        assert_eq!(skipped.backend_calls, 0);

        let report = h.controller.retry_failed().await.unwrap();
        assert_eq!(report.generated, vec![2]);
        assert_eq!(h.adapter.calls_for(2, AssetKind::Image), 1);
        assert_eq!(h.adapter.calls_for(2, AssetKind::Audio), 4);
        let scene = h.scene(2).await;
        assert!(scene.is_complete());
        assert!(scene.failures.is_empty());
    }

    #[tokio::test]
    async fn events_report_progress() {
        let h = harness().await;
        let mut events = h.controller.take_event_receiver().unwrap();
        assert!(h.controller.take_event_receiver().is_none());
        h.controller.plan_project(STORY).await.unwrap();
        h.controller.generate_all().await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        let count = |f: fn(&PipelineEvent) -> bool| received.iter().filter(|e| f(e)).count();
        assert_eq!(count(|e| matches!(e, PipelineEvent::SceneStarted { .. })), 3);
        assert_eq!(count(|e| matches!(e, PipelineEvent::AssetGenerated { .. })), 6);
        assert_eq!(count(|e| matches!(e, PipelineEvent::SceneCommitted { .. })), 3);
    }

    // -------------------------------------------------------------------------
    // Scene edits
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn regenerate_scene_touches_only_that_scene() {
        let h = generated().await;
        let before = h.store.snapshot().await;

        let report = h
            .controller
            .regenerate_scene(
                1,
                SceneOverrides {
                    prompt: Some("A castle at dusk".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.generated, vec![1]);
        assert_eq!(h.adapter.calls_for(1, AssetKind::Image), 2);
        assert_eq!(h.adapter.calls_for(1, AssetKind::Audio), 1);
        assert_eq!(h.adapter.total_calls(), 7);

        let after = h.store.snapshot().await;
        for index in [0, 2] {
            assert_eq!(after.scenes[index], before.scenes[index]);
        }
        let scene = &after.scenes[1];
        assert_eq!(scene.prompt, "A castle at dusk");
        assert_eq!(scene.image_history.len(), 1);
        assert_eq!(scene.audio, before.scenes[1].audio);
    }

    #[tokio::test]
    async fn reroll_voice_regenerates_only_audio() {
        let h = generated().await;

        h.controller
            .regenerate_scene(
                0,
                SceneOverrides {
                    reroll: RerollTarget::Voice,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(h.adapter.calls_for(0, AssetKind::Audio), 2);
        assert_eq!(h.adapter.calls_for(0, AssetKind::Image), 1);
        assert!(h.scene(0).await.is_complete());
    }

    #[tokio::test]
    async fn uploaded_asset_is_not_regenerated() {
        let h = generated().await;
        let upload = h.dir.path().join("upload.png");
        std::fs::write(&upload, b"hand-drawn").unwrap();

        let report = h
            .controller
            .regenerate_scene(
                2,
                SceneOverrides {
                    image_upload: Some(upload),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(report.generated.is_empty());
        assert_eq!(report.backend_calls, 0);
        let scene = h.scene(2).await;
        assert_eq!(scene.state, SceneState::Ready);
        let image = scene.image.as_ref().unwrap();
        assert_eq!(image.origin, AssetOrigin::Uploaded);
        assert_eq!(image.backend, UPLOAD_BACKEND);

        let calls = h.adapter.total_calls();
        h.controller.generate_all().await.unwrap();
        assert_eq!(h.adapter.total_calls(), calls);
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected() {
        let h = generated().await;
        let calls = h.adapter.total_calls();

        for (index, overrides) in [
            (0, SceneOverrides::default()),
            (
                0,
                SceneOverrides {
                    prompt: Some(" ".to_string()),
                    ..Default::default()
                },
            ),
            (
                9,
                SceneOverrides {
                    prompt: Some("valid".to_string()),
                    ..Default::default()
                },
            ),
            (
                0,
                SceneOverrides {
                    audio_upload: Some(PathBuf::from("/missing/voice.wav")),
                    ..Default::default()
                },
            ),
        ] {
            assert!(matches!(
                h.controller.regenerate_scene(index, overrides).await,
                Err(CoreError::ValidationError(_))
            ));
        }
        assert_eq!(h.adapter.total_calls(), calls);
    }

    #[tokio::test]
    async fn refresh_voice_text_only_stales_changed_scenes() {
        let h = generated().await;
        h.dictionary()
            .add(DictionaryWord::new("three", "tree"))
            .await
            .unwrap();

        let changed = h.controller.refresh_voice_text().await.unwrap();

        assert_eq!(changed, vec![2]);
        let state = h.store.snapshot().await;
        assert_eq!(state.scenes[2].state, SceneState::Pending);
        assert_eq!(state.scenes[2].voice_text, "Scene tree.");
        assert_eq!(state.scenes[0].state, SceneState::Ready);

        let report = h.controller.generate_all().await.unwrap();
        assert_eq!(report.generated, vec![2]);
        assert_eq!(h.adapter.calls_for(2, AssetKind::Audio), 2);
        assert_eq!(h.adapter.calls_for(2, AssetKind::Image), 1);
    }

    // -------------------------------------------------------------------------
    // Content rejection
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn rejected_prompt_is_softened_locally() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(
            0,
            AssetKind::Image,
            [Outcome::Fail(FailureReason::ContentRejected)],
        );

        h.controller.generate_all().await.unwrap();

        let scene = h.scene(0).await;
        assert_eq!(scene.state, SceneState::Ready);
        assert_eq!(scene.prompt, "Scene one.");
        let used = local_rewrite("Scene one.", 0);
        assert_eq!(scene.image.as_ref().unwrap().prompt_used, Some(used.clone()));
        let inputs = image_inputs(&h.adapter, 0);
        assert_eq!(inputs.len(), 2);
        assert!(inputs[1].starts_with(&used));
    }

    #[tokio::test]
    async fn rejected_prompt_uses_text_backend_when_available() {
        let h = harness_with(|_| {}, true).await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(
            0,
            AssetKind::Image,
            [Outcome::Fail(FailureReason::ContentRejected)],
        );

        h.controller.generate_all().await.unwrap();

        let scene = h.scene(0).await;
        assert_eq!(
            scene.image.as_ref().unwrap().prompt_used.as_deref(),
            Some("Scene one., rewritten 0")
        );
    }

    #[tokio::test]
    async fn rewrite_budget_is_bounded() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(
            0,
            AssetKind::Image,
            [Outcome::Fail(FailureReason::ContentRejected); 3],
        );

        h.controller.generate_all().await.unwrap();

        let scene = h.scene(0).await;
        assert_eq!(scene.state, SceneState::Failed);
        assert_eq!(image_inputs(&h.adapter, 0).len(), 3);
        let failure = &scene.failures[0];
        assert_eq!(failure.reason, Some(FailureReason::ContentRejected));
        assert_eq!(failure.attempts, 3);
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn cancelling_one_scene_leaves_siblings_running() {
        let h = harness().await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(1, AssetKind::Image, [Outcome::Hang]);

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.generate_all().await });
        wait_for(|| h.adapter.calls_for(1, AssetKind::Image) == 1).await;
        assert!(h.controller.cancel_scene(1));

        let report = run.await.unwrap().unwrap();

        assert_eq!(report.cancelled, vec![1]);
        assert_eq!(report.generated, vec![0, 2]);
        let scene = h.scene(1).await;
        assert_eq!(scene.state, SceneState::Pending);
        assert!(scene.image.is_none());
        assert!(scene.audio.is_none());
        assert!(!h.controller.cancel_scene(1));

        let report = h.controller.generate_all().await.unwrap();
        assert_eq!(report.generated, vec![1]);
    }

    #[tokio::test]
    async fn cancel_all_returns_running_scenes_to_pending() {
        let h = harness_with(|c| c.processing.scene_concurrency = 4, false).await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.always(AssetKind::Image, Outcome::Hang);

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.generate_all().await });
        wait_for(|| h.adapter.call_count(AssetKind::Image) == 3).await;

        assert!(matches!(
            h.controller.generate_all().await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(h.controller.cancel_all());

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.cancelled, vec![0, 1, 2]);
        assert!(report.failed.is_empty());
        let state = h.store.snapshot().await;
        assert!(state
            .scenes
            .iter()
            .all(|s| s.state == SceneState::Pending && s.image.is_none()));
        assert!(!h.controller.cancel_all());
    }

    #[tokio::test]
    async fn maintenance_is_refused_while_generating() {
        let h = harness_with(|c| c.processing.scene_concurrency = 4, false).await;
        h.controller.plan_project(STORY).await.unwrap();
        h.adapter.script(0, AssetKind::Audio, [Outcome::Hang]);

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.generate_all().await });
        let images = AssetWriter::new(h.store.root()).asset_dir(AssetKind::Image);
        wait_for(|| {
            h.adapter.calls_for(0, AssetKind::Audio) == 1
                && std::fs::read_dir(&images).map_or(false, |entries| {
                    entries
                        .flatten()
                        .any(|e| e.file_name().to_string_lossy().starts_with("scene_000-"))
                })
        })
        .await;

        // Scene 0's image is on disk but not yet committed.
        assert!(matches!(
            h.controller.prune_assets().await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(matches!(
            h.controller.rollback_asset(1, AssetKind::Image).await,
            Err(CoreError::ValidationError(_))
        ));

        assert!(h.controller.cancel_scene(0));
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.generated, vec![1, 2]);
        assert_eq!(report.cancelled, vec![0]);

        let pruned = h.controller.prune_assets().await.unwrap();
        assert_eq!(pruned.removed.len(), 1);
        let state = h.store.snapshot().await;
        for scene in &state.scenes[1..] {
            let image = scene.image.as_ref().unwrap();
            assert!(resolve_relative(h.store.root(), &image.asset.path).exists());
        }
    }
}
