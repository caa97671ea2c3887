//! Core types for image generation.

use crate::error::{DreamPixelError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default image edge length in pixels.
pub const DEFAULT_DIMENSION: u32 = 768;
/// Default number of denoising steps.
pub const DEFAULT_INFERENCE_STEPS: u32 = 50;
/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless).
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
    /// WebP format (modern, efficient).
    WebP,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Attempts to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Attempts to detect format from a `Content-Type` header value.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }

        None
    }
}

/// Aspect ratios offered for generation, each mapped to upstream-friendly
/// dimensions (multiples of 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1:1 square aspect ratio.
    #[serde(rename = "1:1")]
    Square,
    /// 16:9 landscape (widescreen) aspect ratio.
    #[serde(rename = "16:9")]
    Landscape,
    /// 9:16 portrait (tall) aspect ratio.
    #[serde(rename = "9:16")]
    Portrait,
    /// 4:3 standard landscape aspect ratio.
    #[serde(rename = "4:3")]
    Standard,
    /// 3:4 standard portrait aspect ratio.
    #[serde(rename = "3:4")]
    StandardPortrait,
    /// 21:9 ultrawide aspect ratio.
    #[serde(rename = "21:9")]
    Ultrawide,
}

impl AspectRatio {
    /// Returns the aspect ratio as a string (e.g., "16:9").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Standard => "4:3",
            Self::StandardPortrait => "3:4",
            Self::Ultrawide => "21:9",
        }
    }

    /// Returns the `(width, height)` used for this ratio.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Square => (768, 768),
            Self::Landscape => (1024, 576),
            Self::Portrait => (576, 1024),
            Self::Standard => (768, 576),
            Self::StandardPortrait => (576, 768),
            Self::Ultrawide => (1344, 576),
        }
    }

    /// Parses strings like `"16:9"`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1:1" => Some(Self::Square),
            "16:9" => Some(Self::Landscape),
            "9:16" => Some(Self::Portrait),
            "4:3" => Some(Self::Standard),
            "3:4" => Some(Self::StandardPortrait),
            "21:9" => Some(Self::Ultrawide),
            _ => None,
        }
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata about the generation process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Model or endpoint that produced the image.
    pub model: Option<String>,
    /// Duration of the successful upstream call in milliseconds.
    pub duration_ms: Option<u64>,
}

/// A request to generate an image.
///
/// Built once with the `with_*` methods and then only borrowed by the
/// fetcher, so it never changes while a fetch is in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The text prompt describing the desired image.
    pub prompt: String,
    /// Desired width in pixels.
    pub width: u32,
    /// Desired height in pixels.
    pub height: u32,
    /// Number of denoising steps.
    pub num_inference_steps: u32,
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Things the image should not contain.
    pub negative_prompt: String,
    /// Variation index within a batch (1-based). Not sent upstream.
    #[serde(skip)]
    pub variation: Option<u32>,
}

impl GenerationRequest {
    /// Creates a new request with the given prompt and default parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            negative_prompt: String::new(),
            variation: None,
        }
    }

    /// Sets the desired dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the dimensions from an aspect ratio.
    pub fn with_aspect_ratio(self, ratio: AspectRatio) -> Self {
        let (width, height) = ratio.dimensions();
        self.with_size(width, height)
    }

    /// Sets the number of inference steps.
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.num_inference_steps = steps;
        self
    }

    /// Sets the guidance scale.
    pub fn with_guidance_scale(mut self, scale: f32) -> Self {
        self.guidance_scale = scale;
        self
    }

    /// Sets the negative prompt.
    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = negative.into();
        self
    }

    /// Derives the request for variation `index` (1-based) of this prompt.
    ///
    /// The prompt gets a `" Variation <index>"` suffix so the upstream
    /// produces a distinct image for each member of a batch.
    pub fn with_variation(&self, index: u32) -> Self {
        let mut derived = self.clone();
        derived.prompt = format!("{} Variation {}", self.prompt, index);
        derived.variation = Some(index);
        derived
    }

    /// Checks the request shape before any network call is made.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(DreamPixelError::InvalidRequest(
                "prompt must not be empty".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(DreamPixelError::InvalidRequest(format!(
                "width and height must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            tracing::warn!(
                width = self.width,
                height = self.height,
                "dimensions are not multiples of 8; upstream may resize"
            );
        }
        if self.num_inference_steps == 0 {
            return Err(DreamPixelError::InvalidRequest(
                "num_inference_steps must be positive".into(),
            ));
        }
        if !self.guidance_scale.is_finite() {
            return Err(DreamPixelError::InvalidRequest(
                "guidance_scale must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// A generated image with its data and metadata.
#[derive(Debug, Clone)]
#[must_use = "generated image should be saved or processed"]
pub struct GeneratedImage {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Image format.
    pub format: ImageFormat,
    /// Generation metadata.
    pub metadata: GenerationMetadata,
}

impl GeneratedImage {
    /// Creates a new generated image.
    pub fn new(data: Vec<u8>, format: ImageFormat, metadata: GenerationMetadata) -> Self {
        Self {
            data,
            format,
            metadata,
        }
    }

    /// Creates a new generated image, detecting format from magic bytes.
    pub fn from_bytes(data: Vec<u8>, metadata: GenerationMetadata) -> Result<Self> {
        let format = ImageFormat::from_magic_bytes(&data)
            .ok_or_else(|| DreamPixelError::Decode("Unknown image format".into()))?;
        Ok(Self::new(data, format, metadata))
    }

    /// Returns the size of the image data in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Saves the image to the specified path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Encodes the image data as base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Returns the image as a data URL.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            self.to_base64()
        )
    }
}
