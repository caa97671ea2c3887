//! Image provider trait.

use crate::error::Result;
use crate::image::types::{GeneratedImage, GenerationRequest};
use async_trait::async_trait;
use std::sync::Arc;

/// A single upstream text-to-image endpoint.
///
/// `generate` performs exactly one outbound call and classifies the result
/// into [`DreamPixelError`](crate::DreamPixelError). Retrying is the job of
/// [`ResilientFetcher`](crate::ResilientFetcher).
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Issues one generation call.
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage>;

    /// Returns the name of this provider for display.
    fn name(&self) -> &str;

    /// Checks if the provider is reachable and authenticated.
    async fn health_check(&self) -> Result<()>;
}

#[async_trait]
impl<P: ImageProvider + ?Sized> ImageProvider for Arc<P> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        (**self).generate(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn health_check(&self) -> Result<()> {
        (**self).health_check().await
    }
}
