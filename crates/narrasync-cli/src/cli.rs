//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use narrasync_core::core::dictionary::{DictionaryWord, WordType};
use narrasync_core::core::scenes::RerollTarget;
use narrasync_core::core::AssetKind;

/// NarraSync - turn narrative text into a narrated video, one cached scene at a time
#[derive(Parser, Debug)]
#[command(name = "narrasync")]
#[command(about = "Turn narrative text into a narrated video", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Project directory
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Configuration file (replaces the project's stored configuration)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Also write daily-rolling logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split a story into scenes, creating the project if needed
    Plan {
        /// Path to the story text file
        text_file: PathBuf,

        /// Project name used when the project is created
        #[arg(long)]
        name: Option<String>,
    },

    /// Re-split a revised story, keeping scenes whose text did not change
    Resplit {
        /// Path to the story text file
        text_file: PathBuf,
    },

    /// Generate every stale scene
    Generate,

    /// Edit one scene and regenerate what the edit made stale
    Regenerate {
        /// Zero-based scene index
        index: usize,

        /// Replacement image prompt
        #[arg(long)]
        prompt: Option<String>,

        /// Replacement narration text
        #[arg(long)]
        voice_text: Option<String>,

        /// Regenerate assets even though their inputs did not change
        #[arg(long, default_value = "none")]
        reroll: RerollTarget,

        /// Use this file as the scene image
        #[arg(long)]
        image: Option<PathBuf>,

        /// Use this file as the scene narration
        #[arg(long)]
        audio: Option<PathBuf>,
    },

    /// Move failed scenes back to pending and regenerate them
    RetryFailed,

    /// Re-apply the pronunciation dictionary to every scene's narration text
    RefreshVoice,

    /// Build the final video from the committed scene assets
    Recompose {
        /// Reuse segments whose inputs did not change
        #[arg(long)]
        incremental: bool,

        /// Render placeholders for scenes without assets instead of failing
        #[arg(long)]
        allow_placeholders: bool,
    },

    /// Show scene counts and failures
    Status,

    /// Pronunciation dictionary management
    #[command(subcommand)]
    Dict(DictCommands),

    /// Restore the previous asset of a scene
    Rollback {
        /// Zero-based scene index
        index: usize,

        /// Asset kind (image or audio)
        kind: AssetKind,
    },

    /// Delete asset files no scene references any more
    Prune,
}

/// Dictionary subcommands
#[derive(Subcommand, Debug)]
pub enum DictCommands {
    /// List dictionary entries
    List {
        /// Use the VOICEVOX engine's user dictionary
        #[arg(long)]
        remote: bool,
    },

    /// Add a word
    Add {
        #[command(flatten)]
        word: WordArgs,

        /// Use the VOICEVOX engine's user dictionary
        #[arg(long)]
        remote: bool,
    },

    /// Replace an existing word
    Update {
        /// Entry uuid
        uuid: String,

        #[command(flatten)]
        word: WordArgs,

        /// Use the VOICEVOX engine's user dictionary
        #[arg(long)]
        remote: bool,
    },

    /// Delete a word
    Delete {
        /// Entry uuid
        uuid: String,

        /// Use the VOICEVOX engine's user dictionary
        #[arg(long)]
        remote: bool,
    },
}

/// Dictionary word fields
#[derive(Args, Debug)]
pub struct WordArgs {
    /// Written form
    pub surface: String,

    /// Reading (katakana for VOICEVOX)
    pub pronunciation: String,

    /// Accent nucleus position
    #[arg(long, default_value_t = 0)]
    pub accent_type: u32,

    /// Part of speech
    #[arg(long, default_value = "proper_noun")]
    pub word_type: WordType,

    /// Substitution priority (0-10)
    #[arg(long, default_value_t = 5)]
    pub priority: u32,
}

impl From<WordArgs> for DictionaryWord {
    fn from(args: WordArgs) -> Self {
        DictionaryWord {
            surface: args.surface,
            pronunciation: args.pronunciation,
            accent_type: args.accent_type,
            word_type: args.word_type,
            priority: args.priority,
        }
    }
}
