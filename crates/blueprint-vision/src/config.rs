//! Pipeline configuration.
//!
//! Every stage has its own config struct with a `Default` impl carrying the
//! production thresholds. All structs deserialize with `#[serde(default)]`,
//! so a JSON override file only needs the fields it changes:
//!
//! ```json
//! { "merge": { "iou_threshold": 0.6 }, "batch": { "retry_attempts": 3 } }
//! ```

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for [`crate::pipeline::VisualPipeline`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tiling decision and grid parameters
    pub tiling: TilingConfig,
    /// Tile merge / NMS parameters
    pub merge: MergeConfig,
    /// Self-correction pass parameters
    pub refine: RefineConfig,
    /// Enhancement pass toggles and thresholds
    pub enhance: EnhanceConfig,
    /// Parallel tile processing
    pub batch: BatchConfig,
    /// Result cache bounds
    pub cache: CacheConfig,
}

impl PipelineConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// fails [`PipelineConfig::validate`].
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that thresholds and ratios are in range.
    ///
    /// # Errors
    ///
    /// Returns [`VisionError::InvalidInput`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        in_range("tiling.overlap_percent", self.tiling.overlap_percent, 0.0, 50.0)?;
        in_range("merge.iou_threshold", self.merge.iou_threshold, 0.0, 1.0)?;
        in_range("refine.match_iou_threshold", self.refine.match_iou_threshold, 0.0, 1.0)?;
        in_range("enhance.association.max_distance", self.enhance.association.max_distance, 0.0, 1.0)?;
        in_range("enhance.association.min_confidence", self.enhance.association.min_confidence, 0.0, 1.0)?;
        in_range("enhance.path_trace.max_distance", self.enhance.path_trace.max_distance, 0.0, 1.0)?;
        in_range("cache.evict_to_ratio", self.cache.evict_to_ratio, 0.0, 1.0)?;
        in_range("cache.warn_ratio", self.cache.warn_ratio, 0.0, 1.0)?;

        if self.batch.max_concurrency == Some(0) {
            return Err(invalid("batch.max_concurrency must be at least 1"));
        }
        if self.batch.timeout_ms == 0 {
            return Err(invalid("batch.timeout_ms must be positive"));
        }
        if self.tiling.full_image_max_dimension == 0 {
            return Err(invalid("tiling.full_image_max_dimension must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> VisionError {
    VisionError::InvalidInput(message.into())
}

fn in_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{field} must be within {min}..={max}, got {value}")))
    }
}

/// Tiling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Tile when the base64 payload is longer than this many characters
    pub byte_threshold: usize,
    /// Tile when either pixel dimension reaches this size
    pub dimension_threshold: u32,
    /// Overlap between neighbouring tiles, in percent of the tile size
    pub overlap_percent: f64,
    /// Longest side of the downsampled full image used for refinement
    pub full_image_max_dimension: u32,
}

impl Default for TilingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            byte_threshold: 500_000,
            dimension_threshold: 2048,
            overlap_percent: 10.0,
            full_image_max_dimension: 2048,
        }
    }
}

/// Merge parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Same-type boxes overlapping more than this are duplicates
    pub iou_threshold: f64,
}

impl Default for MergeConfig {
    #[inline]
    fn default() -> Self {
        Self { iou_threshold: 0.5 }
    }
}

/// Refinement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// Run the full-image self-correction pass after a tiled merge
    pub enabled: bool,
    /// Minimum `IoU` for a refined component to claim a tiled box
    pub match_iou_threshold: f64,
}

impl Default for RefineConfig {
    #[inline]
    fn default() -> Self {
        Self {
            enabled: true,
            match_iou_threshold: 0.5,
        }
    }
}

/// Orphaned-label association parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Maximum normalized distance between a label and its component
    pub max_distance: f64,
    /// Labels below this confidence are not associated
    pub min_confidence: f64,
    /// Use edge-to-edge distance instead of center distance
    pub use_edge_distance: bool,
}

impl Default for AssociationConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_distance: 0.08,
            min_confidence: 0.5,
            use_edge_distance: true,
        }
    }
}

/// Spatial path tracing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTraceConfig {
    /// Maximum center distance for a process-line connection
    pub max_distance: f64,
    /// Only connect process components that are horizontally or vertically aligned
    pub require_alignment: bool,
}

impl Default for PathTraceConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_distance: 0.08,
            require_alignment: true,
        }
    }
}

/// Enhancement pass toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct EnhanceConfig {
    pub normalize_types: bool,
    pub associate_labels: bool,
    pub validate_shapes: bool,
    pub decode_tags: bool,
    pub enhance_connections: bool,
    /// Rewrite connection types when the rule table is very confident
    pub correct_connection_types: bool,
    pub infer_missing_connections: bool,
    pub trace_paths: bool,
    pub validate_connections: bool,
    pub detect_loops: bool,
    pub association: AssociationConfig,
    pub path_trace: PathTraceConfig,
}

impl Default for EnhanceConfig {
    #[inline]
    fn default() -> Self {
        Self {
            normalize_types: true,
            associate_labels: true,
            validate_shapes: true,
            decode_tags: true,
            enhance_connections: true,
            correct_connection_types: false,
            infer_missing_connections: true,
            trace_paths: true,
            validate_connections: true,
            detect_loops: true,
            association: AssociationConfig::default(),
            path_trace: PathTraceConfig::default(),
        }
    }
}

/// Batch processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrent calls; `None` derives it from the batch size
    pub max_concurrency: Option<usize>,
    /// Retries after the first failed attempt
    pub retry_attempts: u32,
    /// Base backoff delay, doubled after each attempt
    pub retry_delay_ms: u64,
    /// Per-call timeout
    pub timeout_ms: u64,
}

impl BatchConfig {
    #[inline]
    #[must_use = "returns the base retry delay"]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[inline]
    #[must_use = "returns the per-call timeout"]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BatchConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_concurrency: None,
            retry_attempts: 2,
            retry_delay_ms: 1000,
            timeout_ms: 60_000,
        }
    }
}

/// Result cache bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry lifetime
    pub ttl_ms: u64,
    /// Upper bound on the summed entry size
    pub max_bytes: usize,
    /// Eviction stops once usage drops to this fraction of `max_bytes`
    pub evict_to_ratio: f64,
    /// Usage fraction at which a warning is logged
    pub warn_ratio: f64,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        Self {
            ttl_ms: 24 * 60 * 60 * 1000, // 24h
            max_bytes: 4 * 1024 * 1024,
            evict_to_ratio: 0.7,
            warn_ratio: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert!((cfg.merge.iou_threshold - 0.5).abs() < f64::EPSILON);
        assert!((cfg.enhance.association.max_distance - 0.08).abs() < f64::EPSILON);
        assert_eq!(cfg.tiling.byte_threshold, 500_000);
        assert_eq!(cfg.batch.retry_attempts, 2);
        assert_eq!(cfg.cache.ttl_ms, 86_400_000);
        assert!(!cfg.enhance.correct_connection_types);
    }

    #[test]
    fn test_partial_json_override() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"merge": {"iou_threshold": 0.65}, "batch": {"timeout_ms": 5}}"#)
                .unwrap();
        assert!((cfg.merge.iou_threshold - 0.65).abs() < f64::EPSILON);
        assert_eq!(cfg.batch.timeout(), Duration::from_millis(5));
        assert_eq!(cfg.batch.retry_attempts, 2);
        assert!(cfg.refine.enabled);
    }

    #[test]
    fn test_validate() {
        assert!(PipelineConfig::default().validate().is_ok());

        let mut cfg = PipelineConfig::default();
        cfg.tiling.overlap_percent = 60.0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("tiling.overlap_percent"), "{err}");

        let mut cfg = PipelineConfig::default();
        cfg.merge.iou_threshold = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.batch.max_concurrency = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_json_file_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"merge": {"iou_threshold": 1.5}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(&path),
            Err(VisionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"enhance": {"trace_paths": false}}"#).unwrap();
        let cfg = PipelineConfig::from_json_file(&path).unwrap();
        assert!(!cfg.enhance.trace_paths);
        assert!(cfg.enhance.detect_loops);
    }
}
