//! Image generation module.

mod provider;
pub mod providers;
mod types;

pub use provider::ImageProvider;
pub use types::{
    AspectRatio, GeneratedImage, GenerationMetadata, GenerationRequest, ImageFormat,
    DEFAULT_DIMENSION, DEFAULT_GUIDANCE_SCALE, DEFAULT_INFERENCE_STEPS,
};
