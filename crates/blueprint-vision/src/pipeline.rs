//! End-to-end analysis entry point.
//!
//! ## Overview
//!
//! [`VisualPipeline::analyze_document`] classifies the document first and
//! runs detection only on drawings. [`VisualPipeline::analyze`] skips the
//! triage and always runs detection:
//!
//! 1. cache lookup
//! 2. blueprint-type detection
//! 3. tiled analysis (tile, analyze in parallel, merge, refine) or a single
//!    standard call, depending on the image size
//! 4. deterministic enhancement and quality scoring
//! 5. cache store
//!
//! The cache is passed in explicitly so callers decide its lifetime and
//! whether it is persisted.

use crate::analyzer::{analyze_standard, analyze_tile, TileAnalysis};
use crate::batch::BatchProcessor;
use crate::cache::ResultCache;
use crate::classifier::{classify_document, detect_blueprint_type, BlueprintType, Classification, DocumentType};
use crate::config::PipelineConfig;
use crate::enhance::enhance;
use crate::error::Result;
use crate::inference::VisionClient;
use crate::merge::merge_tile_results;
use crate::model::{AnalysisResult, DrawingImage};
use crate::refine::refine_with_full_image;
use crate::tiling::{image_dimensions, should_tile, should_tile_dimensions, tile_image, Tile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Number of trailing base64 characters used in the cache signature.
const CACHE_SIGNATURE_CHARS: usize = 64;

/// Cache key for a visual analysis of `image`.
#[must_use = "returns the cache key"]
pub fn visual_cache_key(image: &DrawingImage) -> String {
    format!(
        "visual:{}:{}",
        image.payload_len(),
        image.tail(CACHE_SIGNATURE_CHARS)
    )
}

/// Outcome of [`VisualPipeline::analyze_document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    pub document_type: DocumentType,
    pub file_name: String,
    /// RFC 3339 time the analysis finished
    pub timestamp: String,
    pub classification: Classification,
    /// Detection result, present only for drawings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual: Option<AnalysisResult>,
    pub processing_time_ms: u64,
}

/// Detection pipeline bound to one inference client and configuration.
#[derive(Clone)]
pub struct VisualPipeline {
    client: Arc<dyn VisionClient>,
    config: PipelineConfig,
}

impl std::fmt::Debug for VisualPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualPipeline")
            .field("client", &self.client.name())
            .field("config", &self.config)
            .finish()
    }
}

impl VisualPipeline {
    #[must_use = "creates a pipeline"]
    pub fn new(client: Arc<dyn VisionClient>, config: PipelineConfig) -> Self {
        Self { client, config }
    }

    #[inline]
    #[must_use = "returns the pipeline configuration"]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Classify a document and run detection if it is a drawing.
    ///
    /// Spec sheets, schedules and unclassifiable documents come back with
    /// `visual: None`. A classification failure is not an error here: it
    /// yields the `UNKNOWN` classification and no detection.
    pub async fn analyze_document(&self, image: &DrawingImage, name: &str, cache: &ResultCache) -> DocumentAnalysis {
        let start = Instant::now();
        let classification = classify_document(self.client.as_ref(), cache, image, name).await;
        let document_type = classification.document_type;
        info!(
            name,
            %document_type,
            confidence = classification.confidence,
            "Classified document"
        );

        let visual = if document_type.is_drawing() {
            Some(self.analyze(image, cache).await)
        } else {
            warn!(name, %document_type, "No detection pipeline for document type");
            None
        };

        DocumentAnalysis {
            document_type,
            file_name: name.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            classification,
            visual,
            processing_time_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Analyze one drawing.
    ///
    /// Always returns a structurally valid result. Failures are reported in
    /// `metadata.error`, and failed results are not cached.
    pub async fn analyze(&self, image: &DrawingImage, cache: &ResultCache) -> AnalysisResult {
        let key = visual_cache_key(image);
        if let Some(mut cached) = cache.get_as::<AnalysisResult>(&key) {
            info!(components = cached.components.len(), "Using cached analysis");
            cached.metadata.from_cache = true;
            return cached;
        }

        let start = Instant::now();
        let result = match self.run(image).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Analysis failed");
                return AnalysisResult::failed(e.to_string());
            }
        };

        if result.metadata.error.is_none() {
            if let Err(e) = cache.set_as(&key, &result, None) {
                warn!(error = %e, "Failed to cache analysis");
            }
        }

        info!(
            components = result.metadata.total_components,
            connections = result.metadata.total_connections,
            tiled = result.metadata.tiled,
            failed_tiles = result.metadata.failed_tiles.len(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Analysis complete"
        );
        result
    }

    fn wants_tiling(&self, image: &DrawingImage) -> bool {
        let cfg = &self.config.tiling;
        if should_tile(image, cfg) {
            return true;
        }
        match image_dimensions(image) {
            Ok((width, height)) => should_tile_dimensions(width, height, cfg),
            Err(e) => {
                debug!(error = %e, "Could not read image dimensions");
                false
            }
        }
    }

    async fn run(&self, image: &DrawingImage) -> Result<AnalysisResult> {
        let blueprint_type = detect_blueprint_type(self.client.as_ref(), image).await;
        info!(%blueprint_type, "Detected blueprint type");

        let mut result = if self.wants_tiling(image) {
            self.run_tiled(image, blueprint_type).await?
        } else {
            analyze_standard(self.client.as_ref(), image, blueprint_type).await?
        };

        result.metadata.blueprint_type = Some(blueprint_type);
        if result.metadata.error.is_some() {
            return Ok(result);
        }
        Ok(enhance(result, &self.config.enhance))
    }

    async fn run_tiled(&self, image: &DrawingImage, blueprint_type: BlueprintType) -> Result<AnalysisResult> {
        let tile_set = tile_image(image, self.config.tiling.overlap_percent, &self.config.tiling)?;
        let positions: Vec<String> = tile_set.tiles.iter().map(|t| t.position.to_string()).collect();

        let client = Arc::clone(&self.client);
        let processor = BatchProcessor::new(self.config.batch.clone());
        let batch = processor
            .process_batch(tile_set.tiles, move |tile: Tile, _index| {
                let client = Arc::clone(&client);
                async move { analyze_tile(client.as_ref(), &tile, blueprint_type).await }
            })
            .await;

        let failed_tiles: Vec<String> = batch
            .failures
            .iter()
            .filter_map(|f| positions.get(f.index).cloned())
            .collect();
        for failure in &batch.failures {
            warn!(tile = ?positions.get(failure.index), attempts = failure.attempts, error = %failure.error, "Tile failed");
        }

        let tiles: Vec<TileAnalysis> = batch.into_values();
        if tiles.is_empty() {
            let mut failed = AnalysisResult::failed("all tiles failed analysis");
            failed.metadata.tiled = true;
            failed.metadata.failed_tiles = failed_tiles;
            return Ok(failed);
        }

        let merged = merge_tile_results(tiles, &self.config.merge);
        let mut refined = refine_with_full_image(
            self.client.as_ref(),
            &merged,
            &tile_set.full_image.image,
            blueprint_type,
            &self.config.refine,
        )
        .await;
        refined.metadata.tiled = true;
        refined.metadata.failed_tiles = failed_tiles;
        Ok(refined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visual_cache_key() {
        let image = DrawingImage::from_base64("a".repeat(100) + "XYZ", "image/png");
        let key = visual_cache_key(&image);
        assert!(key.starts_with("visual:103:"));
        assert!(key.ends_with("XYZ"));
        assert_eq!(key.len(), "visual:103:".len() + 64);

        let short = DrawingImage::from_base64("abc", "image/png");
        assert_eq!(visual_cache_key(&short), "visual:3:abc");
    }
}
