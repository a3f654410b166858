//! Generator Adapters
//!
//! Image, voice and text backends behind one capability interface.
//! Remote backends need the `ai-providers` feature; the scripted adapter is
//! always available.

pub mod adapter;
pub mod mock;
pub mod prompt;

#[cfg(feature = "ai-providers")]
pub mod comfyui;
#[cfg(feature = "ai-providers")]
pub mod http;
#[cfg(feature = "ai-providers")]
pub mod midjourney;
#[cfg(feature = "ai-providers")]
pub mod openai;
#[cfg(feature = "ai-providers")]
pub mod voicevox;

// Re-export main types
pub use adapter::{
    build_adapter, unsupported, Backends, BackendKind, Capability, GeneratorAdapter,
    ImageRequest, VoiceRequest,
};
pub use mock::{Outcome, RecordedCall, ScriptedAdapter};
pub use prompt::{local_rewrite, soften_prompt};

#[cfg(feature = "ai-providers")]
pub use comfyui::ComfyUiAdapter;
#[cfg(feature = "ai-providers")]
pub use midjourney::MidjourneyAdapter;
#[cfg(feature = "ai-providers")]
pub use openai::OpenAiAdapter;
#[cfg(feature = "ai-providers")]
pub use voicevox::{Speaker, VoicevoxAdapter, VoicevoxDictionary};
