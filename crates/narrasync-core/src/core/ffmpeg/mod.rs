//! FFmpeg Integration Module
//!
//! Renders per-scene segments (still image + narration + burned-in subtitle)
//! and joins them into the final video. Uses a system-installed FFmpeg or an
//! explicitly configured binary.

mod detection;
mod runner;

pub use detection::*;
pub use runner::{parse_probe_duration, FfmpegEncoder};

/// FFmpeg-related error types
#[derive(Debug, thiserror::Error)]
pub enum FFmpegError {
    #[error("FFmpeg not found. Please install FFmpeg or set video.ffmpegPath.")]
    NotFound,

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid input file: {0}")]
    InvalidInput(String),

    #[error("Output path error: {0}")]
    OutputError(String),

    #[error("FFprobe error: {0}")]
    ProbeError(String),

    #[error("Process error: {0}")]
    ProcessError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type FFmpegResult<T> = Result<T, FFmpegError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreError;

    #[test]
    fn test_ffmpeg_error_display() {
        let err = FFmpegError::NotFound;
        assert!(err.to_string().contains("FFmpeg not found"));

        let err = FFmpegError::ExecutionFailed("exit code 1".to_string());
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn converts_into_core_error() {
        let err: CoreError = FFmpegError::ProbeError("bad file".to_string()).into();
        assert!(err.to_string().contains("bad file"));
        assert!(!err.is_retryable());
    }
}
