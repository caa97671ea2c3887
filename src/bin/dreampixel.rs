//! CLI for DreamPixel - text-to-image generation with retries.

use clap::{Args, Parser, Subcommand, ValueEnum};
use dreampixel::{
    AspectRatio, BatchEvent, BatchGenerator, BatchPolicy, BatchState, CachedFetcher, FetchEvent,
    GenerationRequest, HuggingFaceProvider, ImageFormat, ImageProvider, ResilientFetcher,
    RetryPolicy,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dreampixel")]
#[command(about = "Generate images from text prompts via a hosted inference endpoint")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inference endpoint URL (defaults to DREAMPIXEL_ENDPOINT or Stable Diffusion 2.1)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one or more images from a text prompt
    Generate(GenerateArgs),

    /// Check that the endpoint is reachable and the token is accepted
    Health,
}

#[derive(Args)]
struct GenerateArgs {
    /// The text prompt describing the image
    prompt: String,

    /// Output file path
    #[arg(short, long, default_value = "generated_image.png")]
    output: PathBuf,

    /// Image width in pixels
    #[arg(long, requires = "height", conflicts_with = "aspect_ratio")]
    width: Option<u32>,

    /// Image height in pixels
    #[arg(long, requires = "width", conflicts_with = "aspect_ratio")]
    height: Option<u32>,

    /// Aspect ratio (alternative to width/height)
    #[arg(long, value_enum)]
    aspect_ratio: Option<AspectRatioArg>,

    /// Number of inference steps
    #[arg(long)]
    steps: Option<u32>,

    /// Guidance scale
    #[arg(long)]
    guidance: Option<f32>,

    /// Negative prompt
    #[arg(long)]
    negative: Option<String>,

    /// Number of variations to generate (1-10)
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Concurrent requests when generating several variations (1-4, with --collect-successes)
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Keep successful variations when others fail instead of stopping
    #[arg(long)]
    collect_successes: bool,

    /// Attempts per image (defaults to DREAMPIXEL_MAX_ATTEMPTS or 3)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Base wait between attempts in seconds (defaults to DREAMPIXEL_INITIAL_WAIT_SECS or 1)
    #[arg(long)]
    initial_wait: Option<f64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AspectRatioArg {
    #[value(name = "1:1")]
    Square,
    #[value(name = "16:9")]
    Landscape,
    #[value(name = "9:16")]
    Portrait,
    #[value(name = "4:3")]
    Standard,
    #[value(name = "3:4")]
    StandardPortrait,
    #[value(name = "21:9")]
    Ultrawide,
}

impl From<AspectRatioArg> for AspectRatio {
    fn from(arg: AspectRatioArg) -> Self {
        match arg {
            AspectRatioArg::Square => AspectRatio::Square,
            AspectRatioArg::Landscape => AspectRatio::Landscape,
            AspectRatioArg::Portrait => AspectRatio::Portrait,
            AspectRatioArg::Standard => AspectRatio::Standard,
            AspectRatioArg::StandardPortrait => AspectRatio::StandardPortrait,
            AspectRatioArg::Ultrawide => AspectRatio::Ultrawide,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dreampixel=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => {
            generate(args, cli.endpoint, cli.json).await?;
        }
        Commands::Health => {
            health(cli.endpoint, cli.json).await?;
        }
    }

    Ok(())
}

fn build_provider(endpoint: Option<String>) -> anyhow::Result<HuggingFaceProvider> {
    let mut builder = HuggingFaceProvider::builder();
    if let Some(url) = endpoint {
        builder = builder.endpoint(url);
    }
    Ok(builder.build()?)
}

fn build_request(args: &GenerateArgs) -> anyhow::Result<GenerationRequest> {
    if args.prompt.trim().is_empty() {
        anyhow::bail!("please enter a prompt to generate an image");
    }

    let mut request = GenerationRequest::new(&args.prompt);

    if let (Some(w), Some(h)) = (args.width, args.height) {
        request = request.with_size(w, h);
    }
    if let Some(ar) = args.aspect_ratio {
        request = request.with_aspect_ratio(ar.into());
    }
    if let Some(steps) = args.steps {
        request = request.with_steps(steps);
    }
    if let Some(scale) = args.guidance {
        request = request.with_guidance_scale(scale);
    }
    if let Some(ref negative) = args.negative {
        request = request.with_negative_prompt(negative);
    }

    request.validate()?;
    Ok(request)
}

fn build_policy(args: &GenerateArgs) -> anyhow::Result<RetryPolicy> {
    let mut policy = RetryPolicy::from_env()?;
    if let Some(attempts) = args.max_attempts {
        policy = policy.with_max_attempts(attempts);
    }
    if let Some(secs) = args.initial_wait {
        let wait = Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow::anyhow!("invalid --initial-wait {secs}: {e}"))?;
        policy = policy.with_initial_wait(wait);
    }
    policy.validate()?;
    Ok(policy)
}

/// `out.png` -> `out-3.png` for variation 3 of a multi-image batch.
///
/// A recognised image extension that disagrees with what the endpoint
/// actually returned is replaced, so a JPEG is never saved as `out.png`.
fn output_path(output: &Path, index: u32, count: u32, format: ImageFormat) -> PathBuf {
    let ext = output.extension().and_then(|e| e.to_str());
    let ext = match ext.map(|e| (e, ImageFormat::from_extension(e))) {
        Some((_, Some(declared))) if declared != format => Some(format.extension()),
        Some((e, _)) => Some(e),
        None => None,
    };
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("generated_image");
    let stem = if count <= 1 {
        stem.to_string()
    } else {
        format!("{stem}-{index}")
    };
    let name = match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    };
    output.with_file_name(name)
}

fn report_wait(event: &FetchEvent) {
    let secs = event.wait().as_secs_f64();
    match event {
        FetchEvent::RateLimitWait { attempt, .. } => {
            eprintln!("Rate limited (attempt {}), waiting {secs:.1}s...", attempt + 1)
        }
        FetchEvent::ColdStartWait { attempt, .. } => eprintln!(
            "Model is loading (attempt {}), waiting {secs:.1}s...",
            attempt + 1
        ),
        FetchEvent::RetryWait { attempt, error, .. } => eprintln!(
            "Request failed (attempt {}): {error}; retrying in {secs:.1}s...",
            attempt + 1
        ),
    }
}

fn report_batch(event: &BatchEvent) {
    if let BatchEvent::StateChanged(BatchState::Generating { current, total }) = event {
        if *total > 1 {
            eprintln!("Generating image {current} of {total}...");
        }
    }
}

async fn generate(args: GenerateArgs, endpoint: Option<String>, json_output: bool) -> anyhow::Result<()> {
    let request = build_request(&args)?;
    let policy = build_policy(&args)?;
    let provider = build_provider(endpoint)?;

    let fetcher = CachedFetcher::new(
        ResilientFetcher::new(provider, policy).with_observer(report_wait),
    );
    let policy = if args.collect_successes {
        BatchPolicy::CollectSuccesses
    } else {
        BatchPolicy::StopOnFirstFailure
    };
    let batch = BatchGenerator::new(fetcher, request, args.count)
        .with_policy(policy)
        .with_concurrency(args.concurrency)
        .with_observer(report_batch);
    let count = batch.count();

    let report = batch.run().await;

    let mut saved = Vec::new();
    for (index, image) in report.images() {
        let path = output_path(&args.output, index, count, image.format);
        image.save(&path)?;
        saved.push(serde_json::json!({
            "index": index,
            "output": path.display().to_string(),
            "size_bytes": image.size(),
            "format": image.format.extension(),
            "model": image.metadata.model,
            "duration_ms": image.metadata.duration_ms,
        }));
    }
    let errors: Vec<String> = report
        .failures()
        .map(|(index, failure)| format!("image {index}: {failure}"))
        .collect();

    if json_output {
        let result = serde_json::json!({
            "success": report.is_complete(),
            "requested": count,
            "succeeded": saved.len(),
            "failed": errors.len(),
            "images": saved,
            "errors": if errors.is_empty() { None } else { Some(&errors) },
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for entry in &saved {
            println!(
                "Generated image: {} ({} bytes)",
                entry["output"].as_str().unwrap_or_default(),
                entry["size_bytes"]
            );
        }
        for error in &errors {
            eprintln!("Failed: {error}");
        }
    }

    match report.state {
        BatchState::Complete { .. } => Ok(()),
        BatchState::Failed { reason, .. } => anyhow::bail!("generation failed: {reason}"),
        other => anyhow::bail!("batch ended in unexpected state {other:?}"),
    }
}

async fn health(endpoint: Option<String>, json_output: bool) -> anyhow::Result<()> {
    let provider = build_provider(endpoint)?;
    let result = provider.health_check().await;

    if json_output {
        let value = serde_json::json!({
            "provider": provider.name(),
            "endpoint": provider.endpoint().as_str(),
            "healthy": result.is_ok(),
            "error": result.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match &result {
            Ok(()) => println!("{} at {} is reachable", provider.name(), provider.endpoint()),
            Err(e) => println!("{} at {} is unhealthy: {e}", provider.name(), provider.endpoint()),
        }
    }

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        let out = Path::new("renders/fox.png");
        assert_eq!(
            output_path(out, 1, 1, ImageFormat::Png),
            PathBuf::from("renders/fox.png")
        );
        assert_eq!(
            output_path(out, 3, 4, ImageFormat::Png),
            PathBuf::from("renders/fox-3.png")
        );
        assert_eq!(
            output_path(Path::new("fox"), 2, 2, ImageFormat::Png),
            PathBuf::from("fox-2")
        );
    }

    #[test]
    fn test_output_path_follows_returned_format() {
        assert_eq!(
            output_path(Path::new("fox.png"), 1, 1, ImageFormat::Jpeg),
            PathBuf::from("fox.jpg")
        );
        assert_eq!(
            output_path(Path::new("fox.JPEG"), 2, 3, ImageFormat::Jpeg),
            PathBuf::from("fox-2.JPEG")
        );
        assert_eq!(
            output_path(Path::new("out/fox.jpg"), 1, 2, ImageFormat::WebP),
            PathBuf::from("out/fox-1.webp")
        );
        // unknown extensions are left alone
        assert_eq!(
            output_path(Path::new("fox.img"), 1, 1, ImageFormat::Jpeg),
            PathBuf::from("fox.img")
        );
    }

    #[test]
    fn test_cli_parses_generate() {
        let cli = Cli::try_parse_from([
            "dreampixel",
            "generate",
            "A fox",
            "--aspect-ratio",
            "16:9",
            "-n",
            "3",
            "--collect-successes",
        ])
        .unwrap();
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let request = build_request(&args).unwrap();
        assert_eq!((request.width, request.height), (1024, 576));
        assert_eq!(args.count, 3);
        assert!(args.collect_successes);
        assert_eq!(args.output, PathBuf::from("generated_image.png"));
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let cli = Cli::try_parse_from(["dreampixel", "generate", "  "]).unwrap();
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let err = build_request(&args).unwrap_err();
        assert!(err.to_string().contains("please enter a prompt"));
    }

    #[test]
    fn test_width_conflicts_with_aspect_ratio() {
        let parsed = Cli::try_parse_from([
            "dreampixel",
            "generate",
            "A fox",
            "--width",
            "512",
            "--height",
            "512",
            "--aspect-ratio",
            "1:1",
        ]);
        assert!(parsed.is_err());
    }
}
