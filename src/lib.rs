#![warn(missing_docs)]
//! DreamPixel - resilient text-to-image generation against hosted inference
//! endpoints.
//!
//! The core is [`ResilientFetcher`], which wraps one [`ImageProvider`] call
//! in a retry loop that understands rate limiting (429, exponential
//! backoff), cold starts (503 with a server-supplied `estimated_time`) and
//! generic failures. Outcomes are always returned as a [`FetchOutcome`].
//!
//! # Quick Start
//!
//! ```no_run
//! use dreampixel::{GenerationRequest, HuggingFaceProvider, ResilientFetcher, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> dreampixel::Result<()> {
//!     let provider = HuggingFaceProvider::builder().build()?;
//!     let fetcher = ResilientFetcher::new(provider, RetryPolicy::from_env()?)
//!         .with_observer(|event| eprintln!("waiting {:?}", event.wait()));
//!
//!     let request = GenerationRequest::new("A lighthouse in a storm").with_size(768, 512);
//!     match fetcher.execute(&request).await.into_result() {
//!         Ok(image) => image.save("generated_image.png")?,
//!         Err(failure) => eprintln!("generation failed: {failure}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Caching and batches
//!
//! ```no_run
//! use dreampixel::{
//!     BatchGenerator, BatchPolicy, CachedFetcher, GenerationRequest, HuggingFaceProvider,
//!     ResilientFetcher, RetryPolicy,
//! };
//!
//! # async fn run() -> dreampixel::Result<()> {
//! let provider = HuggingFaceProvider::builder().build()?;
//! let fetcher = CachedFetcher::new(ResilientFetcher::new(provider, RetryPolicy::default()));
//!
//! let report = BatchGenerator::new(fetcher, GenerationRequest::new("A red fox"), 4)
//!     .with_policy(BatchPolicy::CollectSuccesses)
//!     .run()
//!     .await;
//! for (index, image) in report.images() {
//!     image.save(format!("fox-{index}.png"))?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `huggingface` (default): Hugging Face Inference API provider
//! - `cli`: Command-line interface

mod error;

pub mod batch;
pub mod cache;
pub mod fetch;
pub mod image;

#[cfg(test)]
mod test_support;

// Re-export error types at crate root
pub use error::{parse_retry_after, sanitize_error_message, DreamPixelError, Result};

pub use batch::{BatchEvent, BatchGenerator, BatchPolicy, BatchReport, BatchState};
pub use cache::{CacheKey, CachedFetcher, TtlCache};
pub use fetch::{
    FailureKind, Fetch, FetchEvent, FetchFailure, FetchOutcome, ResilientFetcher, RetryPolicy,
};
pub use image::{
    AspectRatio, GeneratedImage, GenerationMetadata, GenerationRequest, ImageFormat, ImageProvider,
};

#[cfg(feature = "huggingface")]
pub use fetch::fetch;

#[cfg(feature = "huggingface")]
pub use image::providers::{HuggingFaceProvider, HuggingFaceProviderBuilder};

pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::batch::{BatchGenerator, BatchPolicy, BatchState};
    pub use crate::cache::CachedFetcher;
    pub use crate::error::{DreamPixelError, Result};
    pub use crate::fetch::{Fetch, FetchOutcome, ResilientFetcher, RetryPolicy};
    pub use crate::image::{GeneratedImage, GenerationRequest, ImageProvider};

    #[cfg(feature = "huggingface")]
    pub use crate::image::providers::HuggingFaceProvider;
}
