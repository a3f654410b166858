mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use narrasync_core::core::config::{GenerationConfig, CONFIG_FILE};
use narrasync_core::core::pipeline::{GenerationReport, PipelineEvent, SceneOverrides};
use narrasync_core::core::recompose::RecomposeOptions;
use narrasync_core::core::CoreError;
use narrasync_core::{init_logging, read_story, ProjectSession};
use serde::Serialize;
use tracing::{info, warn};

use cli::{Cli, Commands, DictCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_dir.as_deref());

    let config = match &cli.config {
        Some(path) => Some(
            GenerationConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
        ),
        None => None,
    };

    match cli.command {
        Commands::Plan { text_file, name } => {
            let text = read_story(&text_file)?;
            let session = open_or_create(&cli.project, name.as_deref(), config).await?;
            print_json(&session.plan(&text).await?)
        }
        Commands::Resplit { text_file } => {
            let text = read_story(&text_file)?;
            let session = open(&cli.project, config).await?;
            print_json(&session.resplit(&text).await?)
        }
        Commands::Generate => {
            let session = open(&cli.project, config).await?;
            let _progress = watch(&session);
            report(&session.generate().await?)
        }
        Commands::Regenerate {
            index,
            prompt,
            voice_text,
            reroll,
            image,
            audio,
        } => {
            let session = open(&cli.project, config).await?;
            let _progress = watch(&session);
            let overrides = SceneOverrides {
                prompt,
                voice_text,
                reroll,
                image_upload: image,
                audio_upload: audio,
            };
            report(&session.regenerate(index, overrides).await?)
        }
        Commands::RetryFailed => {
            let session = open(&cli.project, config).await?;
            let _progress = watch(&session);
            report(&session.retry_failed().await?)
        }
        Commands::RefreshVoice => {
            let session = open(&cli.project, config).await?;
            print_json(&session.refresh_voice_text().await?)
        }
        Commands::Recompose {
            incremental,
            allow_placeholders,
        } => {
            let session = open(&cli.project, config).await?;
            let options = RecomposeOptions {
                incremental,
                allow_placeholders,
            };
            print_json(&session.recompose(options).await?)
        }
        Commands::Status => {
            let session = open(&cli.project, config).await?;
            print_json(&session.status().await)
        }
        Commands::Dict(command) => {
            let session = open(&cli.project, config).await?;
            run_dict(&session, command).await
        }
        Commands::Rollback { index, kind } => {
            let session = open(&cli.project, config).await?;
            session.rollback(index, kind).await?;
            let state = session.store().snapshot().await;
            print_json(state.scene(index)?)
        }
        Commands::Prune => {
            let session = open(&cli.project, config).await?;
            print_json(&session.prune().await?)
        }
    }
}

async fn open(project: &Path, config: Option<GenerationConfig>) -> anyhow::Result<ProjectSession> {
    ProjectSession::open(project, config)
        .await
        .with_context(|| format!("Failed to open project {}", project.display()))
}

async fn open_or_create(
    project: &Path,
    name: Option<&str>,
    config: Option<GenerationConfig>,
) -> anyhow::Result<ProjectSession> {
    match ProjectSession::open(project, config.clone()).await {
        Ok(session) => Ok(session),
        Err(CoreError::ProjectNotFound(_)) => {
            let config = match config {
                Some(config) => config,
                None => GenerationConfig::load(&project.join(CONFIG_FILE))?,
            };
            let name = name
                .map(str::to_string)
                .or_else(|| {
                    project
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
                .unwrap_or_else(|| "narrasync".to_string());
            info!(project = %project.display(), "Creating project");
            Ok(ProjectSession::create(project, &name, config)?)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open project {}", project.display())),
    }
}

async fn run_dict(session: &ProjectSession, command: DictCommands) -> anyhow::Result<()> {
    match command {
        DictCommands::List { remote } => {
            let dictionary = session.dictionary(remote).await?;
            print_json(&dictionary.list().await?)
        }
        DictCommands::Add { word, remote } => {
            let dictionary = session.dictionary(remote).await?;
            print_json(&dictionary.add(word.into()).await?)
        }
        DictCommands::Update { uuid, word, remote } => {
            let dictionary = session.dictionary(remote).await?;
            print_json(&dictionary.update(&uuid, word.into()).await?)
        }
        DictCommands::Delete { uuid, remote } => {
            let dictionary = session.dictionary(remote).await?;
            dictionary.delete(&uuid).await?;
            print_json(&serde_json::json!({ "deleted": uuid }))
        }
    }
}

/// Logs pipeline progress and cancels the run on Ctrl-C until dropped
struct Progress {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Progress {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn watch(session: &ProjectSession) -> Progress {
    let mut tasks = Vec::new();

    if let Some(mut events) = session.controller().take_event_receiver() {
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PipelineEvent::SceneStarted { scene, kinds } => {
                        info!(scene, kinds = ?kinds, "Generating");
                    }
                    PipelineEvent::AssetGenerated {
                        scene,
                        kind,
                        attempts,
                    } => info!(scene, kind = %kind, attempts, "Asset generated"),
                    PipelineEvent::SceneCommitted { scene } => info!(scene, "Scene ready"),
                    PipelineEvent::SceneFailed { scene, failures } => {
                        for failure in failures {
                            warn!(scene, kind = %failure.asset_kind, "{}", failure.message);
                        }
                    }
                    PipelineEvent::SceneCancelled { scene } => info!(scene, "Scene cancelled"),
                }
            }
        }));
    }

    let controller = Arc::clone(session.controller());
    tasks.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            controller.cancel_all();
        }
    }));

    Progress { tasks }
}

fn report(report: &GenerationReport) -> anyhow::Result<()> {
    if !report.is_clean() {
        warn!(
            failed = ?report.failed_scenes(),
            cancelled = ?report.cancelled,
            "Some scenes are not ready; run `narrasync retry-failed` or `narrasync generate` again"
        );
    }
    print_json(report)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
