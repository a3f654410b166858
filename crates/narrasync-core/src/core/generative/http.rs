//! Shared HTTP plumbing for remote backends.
//!
//! Every adapter funnels its reqwest errors and non-2xx responses through
//! [`map_transport_error`] and [`map_status`], so the transient/permanent
//! split is decided in exactly one place.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::core::{CoreError, CoreResult, FailureReason};

/// Upper bound for a downloaded image or audio payload (100 MB)
pub const MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Error bodies are cut to this many characters before they reach logs or state
pub const MAX_ERROR_BODY_CHARS: usize = 500;

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "banned prompt",
    "banned_prompt",
    "content policy",
    "content_policy",
    "safety system",
    "moderation",
    "nsfw",
    "inappropriate",
];

/// Builds a client with the per-request timeout from configuration
pub fn build_client(timeout_ms: u64) -> CoreResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms.max(1)))
        .build()
        .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Joins a base URL and a path without doubling slashes
pub fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub fn truncate_body(body: &str) -> String {
    let mut truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        truncated.push_str("...");
    }
    truncated
}

/// True when a message reads like a content-policy refusal
pub fn looks_like_content_rejection(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    CONTENT_POLICY_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Maps a reqwest failure (no HTTP status) into the shared taxonomy
pub fn map_transport_error(backend: &str, error: &reqwest::Error) -> CoreError {
    if error.is_timeout() {
        CoreError::transient(backend, FailureReason::Timeout, error.to_string())
    } else if error.is_decode() {
        CoreError::permanent(backend, FailureReason::InvalidResponse, error.to_string())
    } else if let Some(status) = error.status() {
        map_status(backend, status, &error.to_string())
    } else {
        CoreError::transient(backend, FailureReason::Transport, error.to_string())
    }
}

/// Maps a non-success status and its body into the shared taxonomy
pub fn map_status(backend: &str, status: StatusCode, body: &str) -> CoreError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate_body(body));
    let reason = match status.as_u16() {
        408 => FailureReason::Timeout,
        429 => FailureReason::RateLimited,
        401 | 403 => FailureReason::Auth,
        500..=599 => FailureReason::ServerBusy,
        400..=499 if looks_like_content_rejection(body) => FailureReason::ContentRejected,
        400..=499 => FailureReason::BadRequest,
        _ => FailureReason::InvalidResponse,
    };
    CoreError::backend(backend, reason, message)
}

/// Sends a prepared request, mapping transport failures
pub async fn send(backend: &str, request: reqwest::RequestBuilder) -> CoreResult<reqwest::Response> {
    request
        .send()
        .await
        .map_err(|e| map_transport_error(backend, &e))
}

/// Fails with the mapped error unless the response is 2xx
pub async fn ensure_success(backend: &str, response: reqwest::Response) -> CoreResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(map_status(backend, status, &body))
}

/// Checks the status and parses a JSON body
pub async fn read_json<T: DeserializeOwned>(backend: &str, response: reqwest::Response) -> CoreResult<T> {
    let response = ensure_success(backend, response).await?;
    let body = response
        .text()
        .await
        .map_err(|e| map_transport_error(backend, &e))?;
    serde_json::from_str(&body).map_err(|e| {
        CoreError::permanent(
            backend,
            FailureReason::InvalidResponse,
            format!("Failed to parse response: {} ({})", e, truncate_body(&body)),
        )
    })
}

/// Checks the status and reads the body, refusing payloads over `max_bytes`
pub async fn read_bytes_capped(
    backend: &str,
    response: reqwest::Response,
    max_bytes: u64,
) -> CoreResult<Vec<u8>> {
    let mut response = ensure_success(backend, response).await?;

    if let Some(content_len) = response.content_length() {
        if content_len > max_bytes {
            return Err(CoreError::permanent(
                backend,
                FailureReason::InvalidResponse,
                format!("Payload too large ({content_len} bytes > {max_bytes} bytes limit)"),
            ));
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_transport_error(backend, &e))?
    {
        if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(CoreError::permanent(
                backend,
                FailureReason::InvalidResponse,
                format!("Payload exceeded max size limit ({max_bytes} bytes)"),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }

    if bytes.is_empty() {
        return Err(CoreError::permanent(
            backend,
            FailureReason::InvalidResponse,
            "Backend returned an empty payload",
        ));
    }
    Ok(bytes)
}

/// Validates that a backend-supplied download URL is plain http(s)
pub fn validate_download_url(backend: &str, url: &str) -> CoreResult<reqwest::Url> {
    let parsed = reqwest::Url::parse(url).map_err(|e| {
        CoreError::permanent(
            backend,
            FailureReason::InvalidResponse,
            format!("Invalid download URL '{}': {}", url, e),
        )
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(CoreError::permanent(
            backend,
            FailureReason::InvalidResponse,
            format!("Unsupported download URL scheme '{scheme}'"),
        )),
    }
}

/// File extension from a response content type, falling back to `default`
pub fn extension_for_content_type(content_type: Option<&str>, default: &str) -> String {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" | "audio/mp3" => "mp3",
        _ => default,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_splits_transient_and_permanent() {
        let cases = [
            (408, FailureReason::Timeout, true),
            (429, FailureReason::RateLimited, true),
            (500, FailureReason::ServerBusy, true),
            (503, FailureReason::ServerBusy, true),
            (401, FailureReason::Auth, false),
            (403, FailureReason::Auth, false),
            (400, FailureReason::BadRequest, false),
            (422, FailureReason::BadRequest, false),
        ];
        for (code, reason, transient) in cases {
            let err = map_status("test", StatusCode::from_u16(code).unwrap(), "oops");
            assert_eq!(err.backend_failure().unwrap().reason, reason, "status {code}");
            assert_eq!(err.is_transient(), transient, "status {code}");
        }
    }

    #[test]
    fn content_policy_body_is_rejection() {
        let err = map_status(
            "openai",
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":"content_policy_violation"}}"#,
        );
        assert!(err.is_content_rejection());
        assert!(!err.is_transient());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let err = map_status("test", StatusCode::INTERNAL_SERVER_ERROR, &body);
        let message = &err.backend_failure().unwrap().message;
        assert!(message.len() < 600);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn endpoint_joins_cleanly() {
        assert_eq!(endpoint("http://h:1/", "/prompt"), "http://h:1/prompt");
        assert_eq!(endpoint("http://h:1", "history/x"), "http://h:1/history/x");
    }

    #[test]
    fn download_url_must_be_http() {
        assert!(validate_download_url("mj", "https://cdn.example.com/a.png").is_ok());
        assert!(validate_download_url("mj", "file:///etc/passwd").is_err());
        assert!(validate_download_url("mj", "not a url").is_err());
    }

    #[test]
    fn content_type_extension() {
        assert_eq!(extension_for_content_type(Some("image/jpeg; q=1"), "png"), "jpg");
        assert_eq!(extension_for_content_type(None, "png"), "png");
        assert_eq!(extension_for_content_type(Some("audio/mpeg"), "wav"), "mp3");
    }
}
