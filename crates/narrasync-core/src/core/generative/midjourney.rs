//! Midjourney image backend (through a midjourney-proxy deployment).
//!
//! An imagine task produces a four-image grid; one tile is picked at random
//! and upscaled, and the upscaled image is downloaded as the scene asset.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::adapter::{BackendKind, Capability, GeneratorAdapter, ImageRequest};
use super::http::{self, MAX_DOWNLOAD_BYTES};
use crate::core::config::{GenerationConfig, MidjourneyService};
use crate::core::scenes::{AssetRef, AssetWriter};
use crate::core::{AssetKind, CoreError, CoreResult, FailureReason};

const BACKEND: &str = "midjourney";

/// Appended to every imagine prompt
pub const MIDJOURNEY_PROMPT_SUFFIX: &str = ", high quality, detailed";

const SUBMIT_OK: i64 = 1;
const SUBMIT_EXISTS: i64 = 21;
const SUBMIT_QUEUED: i64 = 22;
const SUBMIT_BANNED: i64 = 24;

const MAX_POLLS: u32 = 120;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagineRequest {
    prompt: String,
    base64_array: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SimpleChangeRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    code: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    fail_reason: Option<String>,
}

/// Midjourney proxy adapter
pub struct MidjourneyAdapter {
    client: reqwest::Client,
    service: MidjourneyService,
}

impl std::fmt::Debug for MidjourneyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidjourneyAdapter")
            .field("url", &self.service.url)
            .finish_non_exhaustive()
    }
}

impl MidjourneyAdapter {
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        Ok(Self {
            client: http::build_client(config.services.request_timeout_ms)?,
            service: config.services.midjourney.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        http::endpoint(&self.service.url, &format!("mj/{path}"))
    }

    fn with_secret(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.service.api_secret.is_empty() {
            builder
        } else {
            builder.header("mj-api-secret", &self.service.api_secret)
        }
    }

    /// Builds the imagine prompt, adding `--ar` for the supported wide/tall ratios
    pub fn imagine_prompt(prompt: &str, aspect_ratio: &str) -> String {
        let mut enhanced = format!("{prompt}{MIDJOURNEY_PROMPT_SUFFIX}");
        if matches!(aspect_ratio, "16:9" | "9:16") {
            enhanced.push_str(&format!(" --ar {aspect_ratio}"));
        }
        enhanced
    }

    async fn submit(&self, path: &str, body: &impl Serialize, accepted: &[i64]) -> CoreResult<String> {
        let response = http::send(
            BACKEND,
            self.with_secret(self.client.post(self.url(path)).json(body)),
        )
        .await?;
        let submitted: SubmitResponse = http::read_json(BACKEND, response).await?;
        let description = submitted.description.unwrap_or_default();

        if submitted.code == SUBMIT_BANNED || http::looks_like_content_rejection(&description) {
            return Err(CoreError::permanent(
                BACKEND,
                FailureReason::ContentRejected,
                format!("Prompt rejected: {description}"),
            ));
        }
        if !accepted.contains(&submitted.code) {
            return Err(CoreError::transient(
                BACKEND,
                FailureReason::ServerBusy,
                format!("Submit returned code {}: {}", submitted.code, description),
            ));
        }

        match submitted.result {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id),
            Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
            _ => Err(CoreError::permanent(
                BACKEND,
                FailureReason::InvalidResponse,
                "Submit response carried no task id",
            )),
        }
    }

    async fn wait_for_task(&self, task_id: &str) -> CoreResult<String> {
        let interval = Duration::from_millis(self.service.poll_interval_ms.max(1));
        for _ in 0..MAX_POLLS {
            let response = http::send(
                BACKEND,
                self.with_secret(self.client.get(self.url(&format!("task/{task_id}/fetch")))),
            )
            .await?;
            let task: TaskResponse = http::read_json(BACKEND, response).await?;
            let status = task.status.unwrap_or_default();

            match status.as_str() {
                "SUCCESS" => {
                    return task.image_url.filter(|u| !u.is_empty()).ok_or_else(|| {
                        CoreError::permanent(
                            BACKEND,
                            FailureReason::InvalidResponse,
                            format!("Task {task_id} succeeded without an image URL"),
                        )
                    });
                }
                "FAILURE" => {
                    let reason = task.fail_reason.unwrap_or_else(|| "unknown".to_string());
                    let kind = if http::looks_like_content_rejection(&reason) {
                        FailureReason::ContentRejected
                    } else {
                        FailureReason::ServerBusy
                    };
                    return Err(CoreError::backend(
                        BACKEND,
                        kind,
                        format!("Task {task_id} failed: {reason}"),
                    ));
                }
                other => {
                    debug!(
                        task_id,
                        status = other,
                        progress = task.progress.as_deref().unwrap_or(""),
                        "Midjourney task in progress"
                    );
                }
            }
            tokio::time::sleep(interval).await;
        }
        Err(CoreError::transient(
            BACKEND,
            FailureReason::Timeout,
            format!("Task {task_id} did not finish after {MAX_POLLS} polls"),
        ))
    }
}

#[async_trait]
impl GeneratorAdapter for MidjourneyAdapter {
    fn backend_id(&self) -> &str {
        BackendKind::Midjourney.id()
    }

    fn capabilities(&self) -> Vec<Capability> {
        BackendKind::Midjourney.capabilities().to_vec()
    }

    async fn generate_image(&self, request: &ImageRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        let imagine = ImagineRequest {
            prompt: Self::imagine_prompt(&request.prompt, &request.style.aspect_ratio),
            base64_array: Vec::new(),
        };
        let grid_task = self
            .submit("submit/imagine", &imagine, &[SUBMIT_OK, SUBMIT_QUEUED])
            .await?;
        info!(scene = request.scene, task_id = %grid_task, "Submitted Midjourney imagine task");
        self.wait_for_task(&grid_task).await?;

        let tile = rand::thread_rng().gen_range(1..=4);
        let upscale = SimpleChangeRequest {
            content: format!("{grid_task} U{tile}"),
        };
        let upscale_task = self
            .submit(
                "submit/simple-change",
                &upscale,
                &[SUBMIT_OK, SUBMIT_EXISTS, SUBMIT_QUEUED],
            )
            .await?;
        debug!(scene = request.scene, tile, task_id = %upscale_task, "Submitted upscale");
        let image_url = self.wait_for_task(&upscale_task).await?;

        let url = http::validate_download_url(BACKEND, &image_url)?;
        let response = http::send(BACKEND, self.client.get(url)).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = http::read_bytes_capped(BACKEND, response, MAX_DOWNLOAD_BYTES).await?;
        let ext = http::extension_for_content_type(content_type.as_deref(), "png");
        assets.write(request.scene, AssetKind::Image, &ext, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenes::StyleParams;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(url: &str) -> MidjourneyAdapter {
        let mut config = GenerationConfig::default();
        config.services.midjourney.url = url.to_string();
        config.services.midjourney.api_secret = "secret".to_string();
        config.services.midjourney.poll_interval_ms = 5;
        MidjourneyAdapter::from_config(&config).unwrap()
    }

    fn request() -> ImageRequest {
        ImageRequest {
            scene: 0,
            prompt: "a lighthouse".to_string(),
            style: StyleParams::from_config(&GenerationConfig::default()),
        }
    }

    #[test]
    fn imagine_prompt_adds_aspect_ratio_only_when_supported() {
        assert_eq!(
            MidjourneyAdapter::imagine_prompt("a cat", "16:9"),
            "a cat, high quality, detailed --ar 16:9"
        );
        assert_eq!(
            MidjourneyAdapter::imagine_prompt("a cat", "4:3"),
            "a cat, high quality, detailed"
        );
    }

    #[tokio::test]
    async fn imagine_upscale_and_download() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mj/submit/imagine"))
            .and(header("mj-api-secret", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 1, "result": "grid-1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mj/task/grid-1/fetch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS", "imageUrl": format!("{}/img/grid.png", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mj/submit/simple-change"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 22, "result": "up-1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mj/task/up-1/fetch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS", "imageUrl": format!("{}/img/up.png", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/up.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"upscaled".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let writer = AssetWriter::new(dir.path());
        let asset = adapter(&server.uri())
            .generate_image(&request(), &writer)
            .await
            .unwrap();
        assert!(asset.path.ends_with(".png"));
        assert_eq!(std::fs::read(writer.resolve(&asset)).unwrap(), b"upscaled");
    }

    #[tokio::test]
    async fn banned_prompt_code_is_content_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mj/submit/imagine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 24, "description": "Banned prompt: blood"
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = adapter(&server.uri())
            .generate_image(&request(), &AssetWriter::new(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_content_rejection());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn failed_task_is_transient_unless_banned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mj/submit/imagine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 1, "result": "t-9" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mj/task/t-9/fetch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "FAILURE", "failReason": "Discord queue full"
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = adapter(&server.uri())
            .generate_image(&request(), &AssetWriter::new(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
