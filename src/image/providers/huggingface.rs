//! Hugging Face Inference API text-to-image provider.

use crate::error::{parse_retry_after, sanitize_error_message, DreamPixelError, Result};
use crate::image::provider::ImageProvider;
use crate::image::types::{GeneratedImage, GenerationMetadata, GenerationRequest, ImageFormat};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Stable Diffusion 2.1 on the hosted inference API.
pub const DEFAULT_ENDPOINT: &str =
    "https://api-inference.huggingface.co/models/stabilityai/stable-diffusion-2-1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_ENV_VARS: [&str; 2] = ["HF_API_TOKEN", "HUGGINGFACE_API_TOKEN"];
const ENDPOINT_ENV_VAR: &str = "DREAMPIXEL_ENDPOINT";

/// Builder for HuggingFaceProvider.
#[derive(Debug, Clone)]
pub struct HuggingFaceProviderBuilder {
    api_key: Option<String>,
    endpoint: Option<String>,
    timeout: Duration,
}

impl Default for HuggingFaceProviderBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HuggingFaceProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bearer token. Falls back to `HF_API_TOKEN`, then
    /// `HUGGINGFACE_API_TOKEN`.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the inference endpoint URL. Falls back to `DREAMPIXEL_ENDPOINT`,
    /// then [`DEFAULT_ENDPOINT`].
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Sets the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the provider, resolving the token and endpoint.
    pub fn build(self) -> Result<HuggingFaceProvider> {
        let api_key = self
            .api_key
            .or_else(|| {
                TOKEN_ENV_VARS
                    .iter()
                    .find_map(|var| std::env::var(var).ok())
            })
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                DreamPixelError::Auth("HF_API_TOKEN not set and no API token provided".into())
            })?;

        let endpoint = self
            .endpoint
            .or_else(|| std::env::var(ENDPOINT_ENV_VAR).ok())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let endpoint = Url::parse(&endpoint).map_err(|e| {
            DreamPixelError::InvalidRequest(format!("invalid endpoint '{endpoint}': {e}"))
        })?;

        if self.timeout.is_zero() {
            return Err(DreamPixelError::InvalidRequest(
                "timeout must be greater than zero".into(),
            ));
        }

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        Ok(HuggingFaceProvider {
            client,
            api_key,
            endpoint,
            timeout: self.timeout,
        })
    }
}

/// Hugging Face hosted inference provider.
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: Url,
    timeout: Duration,
}

impl HuggingFaceProvider {
    /// Returns a builder.
    pub fn builder() -> HuggingFaceProviderBuilder {
        HuggingFaceProviderBuilder::new()
    }

    /// Returns the configured endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Returns the model id encoded in the endpoint path (the part after
    /// `/models/`), or the whole path for custom deployments.
    pub fn model_id(&self) -> String {
        let path = self.endpoint.path();
        match path.find("/models/") {
            Some(pos) => path[pos + "/models/".len()..].trim_matches('/').to_string(),
            None => path.trim_matches('/').to_string(),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> DreamPixelError {
        if err.is_timeout() {
            DreamPixelError::Timeout(self.timeout)
        } else {
            DreamPixelError::Network(err)
        }
    }
}

#[async_trait]
impl ImageProvider for HuggingFaceProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        let start = Instant::now();
        let body = InferenceRequest::from_generation_request(request);

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let data = response
                .bytes()
                .await
                .map_err(|e| self.transport_error(e))?
                .to_vec();

            if data.is_empty() {
                return Err(DreamPixelError::Decode("empty image body".into()));
            }

            let format = ImageFormat::from_magic_bytes(&data)
                .or_else(|| content_type.as_deref().and_then(ImageFormat::from_mime_type))
                .unwrap_or_default();
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::debug!(bytes = data.len(), duration_ms, "generation complete");

            return Ok(GeneratedImage::new(
                data,
                format,
                GenerationMetadata {
                    model: Some(self.model_id()),
                    duration_ms: Some(duration_ms),
                },
            ));
        }

        match status.as_u16() {
            429 => Err(DreamPixelError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            }),
            503 => {
                let text = error_body(response).await;
                Err(DreamPixelError::ModelLoading {
                    estimated_time: parse_estimated_time(&text),
                })
            }
            code => {
                let text = error_body(response).await;
                Err(DreamPixelError::Api {
                    status: code,
                    message: upstream_error_message(&text),
                })
            }
        }
    }

    fn name(&self) -> &str {
        "Hugging Face Inference API"
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status().as_u16() {
            401 | 403 => Err(DreamPixelError::Auth("Invalid API token".into())),
            _ => Ok(()),
        }
    }
}

/// Wire payload for the text-to-image task.
#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: InferenceParameters<'a>,
}

#[derive(Debug, Serialize)]
struct InferenceParameters<'a> {
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f32,
    negative_prompt: &'a str,
}

impl<'a> InferenceRequest<'a> {
    fn from_generation_request(req: &'a GenerationRequest) -> Self {
        Self {
            inputs: &req.prompt,
            parameters: InferenceParameters {
                width: req.width,
                height: req.height,
                num_inference_steps: req.num_inference_steps,
                guidance_scale: req.guidance_scale,
                negative_prompt: &req.negative_prompt,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct InferenceErrorBody {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    estimated_time: Option<f64>,
}

/// Body of a failed response; the status alone still classifies the
/// failure when the body cannot be read.
async fn error_body(response: reqwest::Response) -> String {
    let status = response.status().as_u16();
    match response.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(status, error = %e, "failed to read error response body");
            String::new()
        }
    }
}

/// Reads `estimated_time` (seconds) out of a 503 body.
fn parse_estimated_time(body: &str) -> Option<Duration> {
    let parsed: InferenceErrorBody = serde_json::from_str(body).ok()?;
    parsed
        .estimated_time
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Prefers the JSON `error` field, falling back to the raw body.
fn upstream_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<InferenceErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .map(|e| match e {
            serde_json::Value::String(s) => s,
            serde_json::Value::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_owned).unwrap_or_else(|| i.to_string()))
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        });
    sanitize_error_message(from_json.as_deref().unwrap_or(body))
}
