//! Blueprint Vision CLI
//!
//! Analyze engineering drawings through an OpenAI-compatible vision endpoint
//! and maintain the on-disk result cache.

use anyhow::{bail, Context, Result};
use blueprint_vision::tiling::tile_image;
use blueprint_vision::{
    classify_document, DrawingImage, OpenAIClient, OpenAIModel, PipelineConfig, ResultCache, VisualPipeline,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_CACHE_PATH: &str = ".blueprint-vision-cache.json";

#[derive(Parser)]
#[command(name = "blueprint-vision")]
#[command(about = "Component and connection detection for P&ID and HVAC drawings")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Endpoint selection shared by commands that call the model
#[derive(clap::Args)]
struct ServiceArgs {
    /// Model id (gpt-4o, gpt-4o-mini)
    #[arg(long, default_value = "gpt-4o")]
    model: OpenAIModel,

    /// Override the chat completions base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full detection pipeline on one image
    Analyze {
        /// Path to a PNG or JPEG drawing
        #[arg(short, long)]
        image: PathBuf,

        /// Write the JSON result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JSON config file; missing fields keep their defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Result cache file
        #[arg(long, default_value = DEFAULT_CACHE_PATH)]
        cache: PathBuf,

        /// Do not read or write the cache
        #[arg(long)]
        no_cache: bool,

        /// Tile overlap in percent (overrides config)
        #[arg(long)]
        overlap: Option<f64>,

        /// NMS IoU threshold (overrides config)
        #[arg(long)]
        iou_threshold: Option<f64>,

        /// Concurrent tile calls (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip the full-image refinement pass
        #[arg(long)]
        no_refine: bool,

        /// Run detection without classifying the document first
        #[arg(long)]
        skip_classify: bool,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Classify a document image
    Classify {
        /// Path to a PNG or JPEG image
        #[arg(short, long)]
        image: PathBuf,

        /// Result cache file
        #[arg(long, default_value = DEFAULT_CACHE_PATH)]
        cache: PathBuf,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Cut an image into the overlapping 2x2 grid and write the tiles
    Tile {
        /// Path to a PNG or JPEG drawing
        #[arg(short, long)]
        image: PathBuf,

        /// Directory for the tile PNGs and manifest
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Tile overlap in percent
        #[arg(long, default_value = "10")]
        overlap: f64,
    },

    /// Show cache statistics
    CacheStats {
        #[arg(long, default_value = DEFAULT_CACHE_PATH)]
        cache: PathBuf,
    },

    /// Remove cache entries
    CacheClear {
        #[arg(long, default_value = DEFAULT_CACHE_PATH)]
        cache: PathBuf,

        /// Only remove expired entries
        #[arg(long)]
        expired: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "blueprint_vision=info"
                    .parse()
                    .expect("directive is compile-time constant"),
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Analyze {
            image,
            output,
            config,
            cache,
            no_cache,
            overlap,
            iou_threshold,
            concurrency,
            no_refine,
            skip_classify,
            service,
        } => {
            let mut config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            if let Some(overlap) = overlap {
                config.tiling.overlap_percent = overlap;
            }
            if let Some(threshold) = iou_threshold {
                config.merge.iou_threshold = threshold;
            }
            if concurrency.is_some() {
                config.batch.max_concurrency = concurrency;
            }
            if no_refine {
                config.refine.enabled = false;
            }
            config.validate().context("Invalid configuration")?;
            let options = AnalyzeOptions {
                output: output.as_deref(),
                cache_path: &cache,
                no_cache,
                skip_classify,
            };
            analyze(&image, config, &options, &service).await?;
        }
        Command::Classify {
            image,
            cache,
            service,
        } => {
            classify(&image, &cache, &service).await?;
        }
        Command::Tile {
            image,
            output_dir,
            overlap,
        } => {
            tile(&image, &output_dir, overlap)?;
        }
        Command::CacheStats { cache } => {
            let cache = ResultCache::open(&cache, PipelineConfig::default().cache);
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        Command::CacheClear { cache, expired } => {
            let cache = ResultCache::open(&cache, PipelineConfig::default().cache);
            if expired {
                let removed = cache.cleanup();
                println!("Removed {removed} expired entries");
            } else {
                let entries = cache.stats().entries;
                cache.clear();
                println!("Removed {entries} entries");
            }
        }
    }

    Ok(())
}

fn client(service: &ServiceArgs) -> Result<OpenAIClient> {
    let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;
    let mut client = OpenAIClient::new(api_key).with_model(service.model);
    if let Some(url) = &service.base_url {
        client = client.with_base_url(url);
    }
    Ok(client)
}

fn load_image(path: &Path) -> Result<DrawingImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(DrawingImage::from_bytes(&bytes))
}

struct AnalyzeOptions<'a> {
    output: Option<&'a Path>,
    cache_path: &'a Path,
    no_cache: bool,
    skip_classify: bool,
}

async fn analyze(
    image_path: &Path,
    config: PipelineConfig,
    options: &AnalyzeOptions<'_>,
    service: &ServiceArgs,
) -> Result<()> {
    let image = load_image(image_path)?;
    let cache = if options.no_cache {
        ResultCache::new(config.cache.clone())
    } else {
        ResultCache::open(options.cache_path, config.cache.clone())
    };
    let pipeline = VisualPipeline::new(Arc::new(client(service)?), config);

    info!(path = %image_path.display(), "Analyzing document");
    let (text, result) = if options.skip_classify {
        let result = pipeline.analyze(&image, &cache).await;
        let text = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        (text, Some(result))
    } else {
        let document = pipeline.analyze_document(&image, &file_name(image_path), &cache).await;
        let text = serde_json::to_string_pretty(&document).context("Failed to serialize result")?;
        (text, document.visual)
    };

    if let Some(error) = result.as_ref().and_then(|r| r.metadata.error.as_ref()) {
        bail!("Analysis failed: {error}");
    }

    match options.output {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                path = %path.display(),
                components = result.as_ref().map_or(0, |r| r.metadata.total_components),
                connections = result.as_ref().map_or(0, |r| r.metadata.total_connections),
                "Wrote result"
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().to_string())
}

async fn classify(image_path: &Path, cache_path: &Path, service: &ServiceArgs) -> Result<()> {
    let image = load_image(image_path)?;
    let cache = ResultCache::open(cache_path, PipelineConfig::default().cache);
    let client = client(service)?;
    let classification = classify_document(&client, &cache, &image, &file_name(image_path)).await;
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

fn tile(image_path: &Path, output_dir: &Path, overlap: f64) -> Result<()> {
    let image = load_image(image_path)?;
    let config = PipelineConfig::default();
    let set = tile_image(&image, overlap, &config.tiling).context("Failed to tile image")?;

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let mut manifest = Vec::with_capacity(set.tiles.len() + 1);
    for tile in set.tiles.iter().chain(std::iter::once(&set.full_image)) {
        let file = format!("{}.png", tile.position);
        let bytes = tile.image.decode().context("Failed to decode tile")?;
        std::fs::write(output_dir.join(&file), bytes)
            .with_context(|| format!("Failed to write {file}"))?;
        manifest.push(json!({
            "position": tile.position,
            "file": file,
            "bbox": tile.bbox,
            "width": tile.width,
            "height": tile.height,
        }));
    }

    let manifest = json!({ "metadata": set.metadata, "tiles": manifest });
    std::fs::write(
        output_dir.join("tiles.json"),
        serde_json::to_string_pretty(&manifest)?,
    )
    .context("Failed to write manifest")?;

    info!(
        tiles = set.tiles.len(),
        width = set.metadata.original_width,
        height = set.metadata.original_height,
        dir = %output_dir.display(),
        "Wrote tiles"
    );
    Ok(())
}
