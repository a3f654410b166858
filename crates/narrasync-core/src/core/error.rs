//! NarraSync Error Definitions
//!
//! Every failure surfaced by the core maps into [`CoreError`]. Backend-specific
//! error shapes are translated at the adapter boundary, so the executor and
//! the pipeline controller only ever branch on these variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ffmpeg::FFmpegError;
use super::{AssetKind, BackendId, SceneIndex};

// =============================================================================
// Backend Failure Details
// =============================================================================

/// Classified cause of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Attempt exceeded its deadline
    Timeout,
    /// Backend asked us to slow down (HTTP 429 and friends)
    RateLimited,
    /// Connection refused, reset, DNS failure
    Transport,
    /// 5xx or an explicit "busy" signal
    ServerBusy,
    /// Credentials missing or rejected
    Auth,
    /// Content-policy rejection of the prompt
    ContentRejected,
    /// Malformed request or parameters
    BadRequest,
    /// Backend does not offer the requested capability
    Unsupported,
    /// Response could not be understood
    InvalidResponse,
}

impl FailureReason {
    /// Whether a failure with this reason is worth retrying automatically
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout
                | FailureReason::RateLimited
                | FailureReason::Transport
                | FailureReason::ServerBusy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Transport => "transport",
            FailureReason::ServerBusy => "server_busy",
            FailureReason::Auth => "auth",
            FailureReason::ContentRejected => "content_rejected",
            FailureReason::BadRequest => "bad_request",
            FailureReason::Unsupported => "unsupported",
            FailureReason::InvalidResponse => "invalid_response",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend error already mapped into the shared taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendFailure {
    pub backend: BackendId,
    pub reason: FailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<SceneIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_kind: Option<AssetKind>,
}

impl BackendFailure {
    pub fn new(backend: impl Into<String>, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            reason,
            message: message.into(),
            scene: None,
            asset_kind: None,
        }
    }
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.backend, self.reason, self.message)?;
        match (self.scene, self.asset_kind) {
            (Some(scene), Some(kind)) => write!(f, " (scene {scene}, {kind})"),
            (Some(scene), None) => write!(f, " (scene {scene})"),
            (None, Some(kind)) => write!(f, " ({kind})"),
            (None, None) => Ok(()),
        }
    }
}

// =============================================================================
// Execution Errors
// =============================================================================

/// Why the retry executor gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Every attempt failed transiently
    RetriesExhausted,
    /// A non-transient failure ended the run early
    Permanent,
    /// The caller cancelled the operation
    Cancelled,
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionErrorKind::RetriesExhausted => f.write_str("retries exhausted"),
            ExecutionErrorKind::Permanent => f.write_str("permanent failure"),
            ExecutionErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of a failed executor run
#[derive(Debug, Error)]
#[error("{operation}: {kind} after {attempts} attempt(s): {last_cause}")]
pub struct ExecutionError {
    pub operation: String,
    pub kind: ExecutionErrorKind,
    pub attempts: u32,
    pub last_cause: Box<CoreError>,
}

// =============================================================================
// Core Error
// =============================================================================

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Transient backend error: {0}")]
    TransientBackend(BackendFailure),

    #[error("Permanent backend error: {0}")]
    PermanentBackend(BackendFailure),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project is locked by another writer: {0}")]
    ProjectLocked(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // =========================================================================
    // Recomposition Errors
    // =========================================================================
    #[error("Recomposition blocked, scenes without committed assets: {incomplete:?}")]
    Recomposition { incomplete: Vec<SceneIndex> },

    #[error("Video encoding failed: {0}")]
    FFmpeg(#[from] FFmpegError),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a transient backend failure
    pub fn transient(backend: &str, reason: FailureReason, message: impl Into<String>) -> Self {
        CoreError::TransientBackend(BackendFailure::new(backend, reason, message))
    }

    /// Shorthand for a permanent backend failure
    pub fn permanent(backend: &str, reason: FailureReason, message: impl Into<String>) -> Self {
        CoreError::PermanentBackend(BackendFailure::new(backend, reason, message))
    }

    /// Builds a backend error, choosing transient or permanent from the reason
    pub fn backend(backend: &str, reason: FailureReason, message: impl Into<String>) -> Self {
        if reason.is_transient() {
            Self::transient(backend, reason, message)
        } else {
            Self::permanent(backend, reason, message)
        }
    }

    /// True when the executor may retry the failed attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientBackend(_))
    }

    /// True when a later, user-initiated retry could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::TransientBackend(_) => true,
            CoreError::Execution(e) => matches!(
                e.kind,
                ExecutionErrorKind::RetriesExhausted | ExecutionErrorKind::Cancelled
            ),
            CoreError::Cancelled => true,
            _ => false,
        }
    }

    /// Returns the mapped backend failure, looking through executor wrappers
    pub fn backend_failure(&self) -> Option<&BackendFailure> {
        match self {
            CoreError::TransientBackend(f) | CoreError::PermanentBackend(f) => Some(f),
            CoreError::Execution(e) => e.last_cause.backend_failure(),
            _ => None,
        }
    }

    /// True when the backend refused the prompt on content-policy grounds
    pub fn is_content_rejection(&self) -> bool {
        self.backend_failure()
            .is_some_and(|f| f.reason == FailureReason::ContentRejected)
    }

    /// Number of backend attempts behind this error (1 for unwrapped failures)
    pub fn attempts(&self) -> u32 {
        match self {
            CoreError::Execution(e) => e.attempts,
            _ => 1,
        }
    }

    /// Attaches scene and asset context to backend failures
    pub fn with_scene(self, scene: SceneIndex, kind: AssetKind) -> Self {
        match self {
            CoreError::TransientBackend(mut f) => {
                f.scene = Some(scene);
                f.asset_kind = Some(kind);
                CoreError::TransientBackend(f)
            }
            CoreError::PermanentBackend(mut f) => {
                f.scene = Some(scene);
                f.asset_kind = Some(kind);
                CoreError::PermanentBackend(f)
            }
            CoreError::Execution(mut e) => {
                e.last_cause = Box::new(e.last_cause.with_scene(scene, kind));
                CoreError::Execution(e)
            }
            other => other,
        }
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_reason() {
        let err = CoreError::backend("comfyui", FailureReason::RateLimited, "429");
        assert!(err.is_transient());
        assert!(err.is_retryable());

        let err = CoreError::backend("comfyui", FailureReason::Auth, "401");
        assert!(!err.is_transient());
        assert!(!err.is_retryable());
    }

    #[test]
    fn with_scene_reaches_through_execution_wrapper() {
        let inner = CoreError::transient("voicevox", FailureReason::Timeout, "deadline");
        let err = CoreError::Execution(ExecutionError {
            operation: "voicevox:voice".to_string(),
            kind: ExecutionErrorKind::RetriesExhausted,
            attempts: 3,
            last_cause: Box::new(inner),
        })
        .with_scene(2, AssetKind::Audio);

        let failure = err.backend_failure().unwrap();
        assert_eq!(failure.scene, Some(2));
        assert_eq!(failure.asset_kind, Some(AssetKind::Audio));
        assert_eq!(err.attempts(), 3);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("scene 2"));
    }

    #[test]
    fn content_rejection_is_detected() {
        let err = CoreError::permanent("midjourney", FailureReason::ContentRejected, "banned");
        assert!(err.is_content_rejection());
        assert!(!err.is_transient());
    }

    #[test]
    fn recomposition_error_lists_scenes() {
        let err = CoreError::Recomposition {
            incomplete: vec![1, 4],
        };
        assert!(err.to_string().contains("[1, 4]"));
    }
}
