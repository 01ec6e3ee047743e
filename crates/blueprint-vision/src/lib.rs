//! Blueprint Vision - detection reconciliation for engineering drawings
//!
//! This crate turns vision-model detections on P&ID and HVAC drawings into a
//! clean component and connection inventory. Large sheets are cut into
//! overlapping tiles, analyzed in parallel, merged with type-aware NMS and
//! corrected against the full image. A chain of deterministic passes then
//! normalizes types, decodes ISA-5.1 tags, infers and validates connections
//! and finds control loops.
//!
//! ```no_run
//! use blueprint_vision::{DrawingImage, OpenAIClient, PipelineConfig, ResultCache, VisualPipeline};
//! use std::sync::Arc;
//!
//! # async fn run(bytes: &[u8]) {
//! let client = Arc::new(OpenAIClient::new("sk-...".to_string()));
//! let pipeline = VisualPipeline::new(client, PipelineConfig::default());
//! let cache = ResultCache::default();
//! let result = pipeline.analyze(&DrawingImage::from_bytes(bytes), &cache).await;
//! println!("{} components", result.components.len());
//! # }
//! ```

pub mod analyzer;
pub mod batch;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod enhance;
pub mod error;
pub mod geometry;
pub mod inference;
pub mod merge;
pub mod model;
pub mod parse;
pub mod pipeline;
pub mod refine;
pub mod tiling;

pub use batch::{BatchProcessor, BatchResult, ProgressTracker};
pub use cache::{CacheStats, ResultCache};
pub use classifier::{classify_document, detect_blueprint_type, BlueprintType, Classification, DocumentType};
pub use config::{
    BatchConfig, CacheConfig, EnhanceConfig, MergeConfig, PipelineConfig, RefineConfig, TilingConfig,
};
pub use enhance::{enhance, EnhancementStats};
pub use error::{Result, VisionError};
pub use geometry::BBox;
pub use inference::openai::{OpenAIClient, OpenAIModel};
pub use inference::{GenerateOptions, VisionClient};
pub use model::{
    AnalysisMetadata, AnalysisResult, Component, Connection, ConnectionType, ControlLoop, DrawingImage,
};
pub use pipeline::{DocumentAnalysis, VisualPipeline};
