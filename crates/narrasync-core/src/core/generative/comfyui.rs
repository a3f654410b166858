//! ComfyUI image backend.
//!
//! Queues an API-format workflow with `POST /prompt`, polls
//! `GET /history/{prompt_id}` until the graph produced an image and fetches it
//! through `GET /view`. The workflow is either loaded from the configured
//! template or the built-in text-to-image graph.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::adapter::{BackendKind, Capability, GeneratorAdapter, ImageRequest};
use super::http::{self, MAX_DOWNLOAD_BYTES};
use crate::core::config::{ComfyUiService, GenerationConfig};
use crate::core::scenes::{AssetRef, AssetWriter};
use crate::core::{AssetKind, CoreError, CoreResult, FailureReason};

const BACKEND: &str = "comfyui";

/// Appended to every positive prompt sent to ComfyUI
pub const COMFYUI_PROMPT_SUFFIX: &str = ", masterpiece, best quality";

/// Upper bound on history polls for one prompt
const MAX_POLLS: u32 = 600;

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct OutputImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_output_type")]
    folder_type: String,
}

fn default_output_type() -> String {
    "output".to_string()
}

/// ComfyUI adapter
pub struct ComfyUiAdapter {
    client: reqwest::Client,
    service: ComfyUiService,
    workflow: Value,
    client_id: String,
}

impl std::fmt::Debug for ComfyUiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUiAdapter")
            .field("url", &self.service.url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ComfyUiAdapter {
    pub fn from_config(config: &GenerationConfig) -> CoreResult<Self> {
        let service = config.services.comfyui.clone();
        let workflow = match &service.workflow_path {
            Some(path) => load_workflow(std::path::Path::new(path))?,
            None => default_workflow(),
        };
        Ok(Self {
            client: http::build_client(config.services.request_timeout_ms)?,
            service,
            workflow,
            client_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Fills the template with the prompt, negative prompt, seed, LoRA and size
    fn build_workflow(&self, request: &ImageRequest, seed: u64) -> CoreResult<Value> {
        let mut workflow = self.workflow.clone();
        let positive = format!("{}{}", request.prompt, COMFYUI_PROMPT_SUFFIX);

        set_input(&mut workflow, &self.service.positive_node, "text", json!(positive))?;
        set_input(
            &mut workflow,
            &self.service.negative_node,
            "text",
            json!(request.style.negative_prompt),
        )?;
        set_input(&mut workflow, &self.service.sampler_node, "seed", json!(seed))?;
        if workflow.get(&self.service.latent_node).is_some() {
            set_input(&mut workflow, &self.service.latent_node, "width", json!(request.style.width))?;
            set_input(&mut workflow, &self.service.latent_node, "height", json!(request.style.height))?;
        }

        if let Some(lora) = &request.style.lora {
            if let Some(nodes) = workflow.as_object_mut() {
                for node in nodes.values_mut() {
                    if node.get("class_type").and_then(Value::as_str) == Some("LoraLoader") {
                        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
                            inputs.insert("lora_name".to_string(), json!(lora));
                        }
                    }
                }
            }
        }
        Ok(workflow)
    }

    async fn queue(&self, workflow: &Value) -> CoreResult<String> {
        let body = json!({ "prompt": workflow, "client_id": self.client_id });
        let response = http::send(
            BACKEND,
            self.client
                .post(http::endpoint(&self.service.url, "prompt"))
                .json(&body),
        )
        .await?;
        let queued: QueueResponse = http::read_json(BACKEND, response).await?;
        Ok(queued.prompt_id)
    }

    async fn wait_for_output(&self, prompt_id: &str) -> CoreResult<OutputImage> {
        let interval = Duration::from_millis(self.service.poll_interval_ms.max(1));
        for poll in 0..MAX_POLLS {
            let response = http::send(
                BACKEND,
                self.client.get(http::endpoint(
                    &self.service.url,
                    &format!("history/{prompt_id}"),
                )),
            )
            .await?;
            let history: Value = http::read_json(BACKEND, response).await?;

            if let Some(entry) = history.get(prompt_id) {
                if let Some(image) = first_output_image(entry) {
                    debug!(prompt_id, polls = poll + 1, "ComfyUI prompt finished");
                    return Ok(image);
                }
                if let Some(error) = execution_error(entry) {
                    return Err(CoreError::backend(
                        BACKEND,
                        if http::looks_like_content_rejection(&error) {
                            FailureReason::ContentRejected
                        } else {
                            FailureReason::ServerBusy
                        },
                        format!("Workflow execution failed: {}", http::truncate_body(&error)),
                    ));
                }
                if is_completed(entry) {
                    return Err(CoreError::permanent(
                        BACKEND,
                        FailureReason::InvalidResponse,
                        "Workflow completed without an image output",
                    ));
                }
            }
            tokio::time::sleep(interval).await;
        }
        Err(CoreError::transient(
            BACKEND,
            FailureReason::Timeout,
            format!("Prompt {prompt_id} did not finish after {MAX_POLLS} polls"),
        ))
    }

    async fn fetch_image(&self, image: &OutputImage) -> CoreResult<(Vec<u8>, String)> {
        let response = http::send(
            BACKEND,
            self.client
                .get(http::endpoint(&self.service.url, "view"))
                .query(&[
                    ("filename", image.filename.as_str()),
                    ("subfolder", image.subfolder.as_str()),
                    ("type", image.folder_type.as_str()),
                ]),
        )
        .await?;
        let ext = std::path::Path::new(&image.filename)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let bytes = http::read_bytes_capped(BACKEND, response, MAX_DOWNLOAD_BYTES).await?;
        Ok((bytes, ext))
    }
}

#[async_trait]
impl GeneratorAdapter for ComfyUiAdapter {
    fn backend_id(&self) -> &str {
        BackendKind::ComfyUi.id()
    }

    fn capabilities(&self) -> Vec<Capability> {
        BackendKind::ComfyUi.capabilities().to_vec()
    }

    async fn generate_image(&self, request: &ImageRequest, assets: &AssetWriter) -> CoreResult<AssetRef> {
        let seed = rand::thread_rng().gen_range(1..=9_999_999_999u64);
        let workflow = self.build_workflow(request, seed)?;

        let prompt_id = self.queue(&workflow).await?;
        info!(scene = request.scene, prompt_id = %prompt_id, seed, "Queued ComfyUI prompt");

        let image = self.wait_for_output(&prompt_id).await?;
        let (bytes, ext) = self.fetch_image(&image).await?;
        assets.write(request.scene, AssetKind::Image, &ext, &bytes)
    }
}

fn set_input(workflow: &mut Value, node: &str, field: &str, value: Value) -> CoreResult<()> {
    let inputs = workflow
        .get_mut(node)
        .and_then(|n| n.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            CoreError::ValidationError(format!(
                "ComfyUI workflow has no node '{node}' with inputs"
            ))
        })?;
    inputs.insert(field.to_string(), value);
    Ok(())
}

fn first_output_image(entry: &Value) -> Option<OutputImage> {
    let outputs = entry.get("outputs")?.as_object()?;
    let mut node_ids: Vec<&String> = outputs.keys().collect();
    node_ids.sort();
    node_ids.into_iter().find_map(|id| {
        outputs[id]
            .get("images")?
            .as_array()?
            .iter()
            .find_map(|img| serde_json::from_value::<OutputImage>(img.clone()).ok())
    })
}

fn execution_error(entry: &Value) -> Option<String> {
    let status = entry.get("status")?;
    if status.get("status_str").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let detail = status
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                let pair = m.as_array()?;
                if pair.first()?.as_str()? == "execution_error" {
                    pair.get(1)?
                        .get("exception_message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                } else {
                    None
                }
            })
        });
    Some(detail.unwrap_or_else(|| "unknown execution error".to_string()))
}

fn is_completed(entry: &Value) -> bool {
    entry
        .get("status")
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn load_workflow(path: &std::path::Path) -> CoreResult<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::ValidationError(format!(
            "Failed to read ComfyUI workflow {}: {}",
            path.display(),
            e
        ))
    })?;
    let workflow: Value = serde_json::from_str(&content).map_err(|e| {
        CoreError::ValidationError(format!(
            "Invalid ComfyUI workflow {}: {}",
            path.display(),
            e
        ))
    })?;
    if !workflow.is_object() {
        return Err(CoreError::ValidationError(
            "ComfyUI workflow must be an API-format JSON object".to_string(),
        ));
    }
    Ok(workflow)
}

/// Built-in text-to-image graph (API format)
pub fn default_workflow() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 0,
                "steps": 20,
                "cfg": 7.0,
                "sampler_name": "euler",
                "scheduler": "normal",
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": "v1-5-pruned-emaonly.safetensors" }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": 1024, "height": 576, "batch_size": 1 }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "", "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "", "clip": ["4", 1] }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": "narrasync", "images": ["8", 0] }
        }
    })
}
