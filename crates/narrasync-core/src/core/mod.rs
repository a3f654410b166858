//! NarraSync Core Engine
//!
//! Scene pipeline and asset cache: planning, generation, the scene store and
//! video recomposition.

pub mod config;
pub mod dictionary;
pub mod executor;
pub mod ffmpeg;
pub mod fs;
pub mod generative;
pub mod pipeline;
pub mod recompose;
pub mod scenes;
pub mod segment;
pub mod subtitles;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
