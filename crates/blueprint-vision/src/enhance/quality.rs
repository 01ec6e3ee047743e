//! Result quality scoring.

use crate::model::{AnalysisResult, DetectionQuality};
use serde::{Deserialize, Serialize};

const CONFIDENCE_WEIGHT: f64 = 0.3;
const ISA_WEIGHT: f64 = 0.25;
const COVERAGE_WEIGHT: f64 = 0.2;
const EXCELLENT_WEIGHT: f64 = 0.25;

/// Aggregate quality of one analysis result. All ratios are in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall_score: f64,
    /// Share of components bucketed as excellent
    pub detection_quality: f64,
    pub isa_completeness: f64,
    /// Connections per component, capped at 1
    pub connection_coverage: f64,
    pub confidence_avg: f64,
    pub total_components: usize,
    pub total_connections: usize,
    pub isa_functions_detected: usize,
    pub excellent_detections: usize,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Score a result. Empty results score zero.
#[allow(clippy::cast_precision_loss)]
#[must_use = "returns the quality metrics"]
pub fn calculate_quality_metrics(result: &AnalysisResult) -> QualityMetrics {
    let components = &result.components;
    let total = components.len();

    let confidence_avg = if total == 0 {
        0.0
    } else {
        components.iter().map(|c| c.confidence).sum::<f64>() / total as f64
    };
    let isa_functions_detected = components
        .iter()
        .filter(|c| c.meta.isa_function.is_some())
        .count();
    let excellent_detections = components
        .iter()
        .filter(|c| c.meta.detection_quality == Some(DetectionQuality::Excellent))
        .count();

    let isa_completeness = ratio(isa_functions_detected, total);
    let connection_coverage = ratio(result.connections.len(), total).min(1.0);
    let detection_quality = ratio(excellent_detections, total);

    QualityMetrics {
        overall_score: confidence_avg * CONFIDENCE_WEIGHT
            + isa_completeness * ISA_WEIGHT
            + connection_coverage * COVERAGE_WEIGHT
            + detection_quality * EXCELLENT_WEIGHT,
        detection_quality,
        isa_completeness,
        connection_coverage,
        confidence_avg,
        total_components: total,
        total_connections: result.connections.len(),
        isa_functions_detected,
        excellent_detections,
    }
}
