//! Deterministic post-processing of a merged result.
//!
//! ## Overview
//!
//! [`enhance`] runs a fixed sequence of pure passes over an
//! [`AnalysisResult`]. Each pass can be switched off in [`EnhanceConfig`]:
//!
//! 1. [`normalize`]: map free-form types into the canonical vocabulary
//! 2. [`spatial`]: fold orphaned tag labels into nearby symbols
//! 3. [`shape`]: correct types that contradict the drawn shape
//! 4. [`isa`]: decode ISA-5.1 instrument tags
//! 5. [`connections`]: annotate, correct, infer, trace and validate edges
//! 6. [`loops`]: detect sensor/controller/actuator feedback loops
//! 7. [`quality`]: score the final result
//!
//! [`hvac`] classification runs earlier, when responses are parsed, so that
//! every component carries subsystem and quality metadata from the start.
//!
//! Components and connections are never dropped. Problems are reported in
//! `metadata.validation_issues`.

pub mod connections;
pub mod hvac;
pub mod isa;
pub mod loops;
pub mod normalize;
pub mod quality;
pub mod shape;
pub mod spatial;

use crate::config::EnhanceConfig;
use crate::model::AnalysisResult;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Counters recorded by [`enhance`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancementStats {
    pub isa_detected: usize,
    pub isa_rate: f64,
    pub annotated_connections: usize,
    pub corrected_connections: usize,
    pub inferred_connections: usize,
    pub traced_connections: usize,
    pub validation_issues: usize,
    pub control_loops: usize,
    pub shape_corrections: usize,
    pub label_merges: usize,
    pub duration_ms: u64,
}

/// Run every enabled pass in order.
#[allow(clippy::cast_precision_loss)]
#[must_use = "returns the enhanced result"]
pub fn enhance(mut result: AnalysisResult, cfg: &EnhanceConfig) -> AnalysisResult {
    let start = Instant::now();
    let mut stats = EnhancementStats::default();

    if cfg.normalize_types {
        normalize::normalize_components(&mut result.components);
        normalize::normalize_connections(&mut result.connections);
    }

    if cfg.associate_labels {
        let components = std::mem::take(&mut result.components);
        let (components, merges) = spatial::merge_orphaned_labels(components, &cfg.association);
        result.components = components;
        stats.label_merges = merges;
    }

    if cfg.validate_shapes {
        stats.shape_corrections = shape::validate_component_shapes(&mut result.components).corrected;
    }

    if cfg.decode_tags {
        stats.isa_detected = isa::decode_component_tags(&mut result.components);
        if !result.components.is_empty() {
            stats.isa_rate = stats.isa_detected as f64 / result.components.len() as f64;
        }
    }

    if cfg.enhance_connections {
        stats.annotated_connections =
            connections::enhance_connections(&result.components, &mut result.connections);
    }

    if cfg.correct_connection_types {
        stats.corrected_connections =
            connections::correct_connection_types(&result.components, &mut result.connections);
    }

    if cfg.infer_missing_connections {
        let inferred = connections::infer_missing_connections(&result.components, &result.connections);
        stats.inferred_connections = inferred.len();
        result.connections.extend(inferred);
    }

    if cfg.trace_paths {
        let traced =
            connections::trace_connection_paths(&result.components, &result.connections, &cfg.path_trace);
        stats.traced_connections = traced.len();
        result.connections.extend(traced);
    }

    if cfg.validate_connections {
        let issues = connections::validate_connections(&result.components, &result.connections);
        stats.validation_issues = issues.len();
        result.metadata.validation_issues = issues;
    }

    if cfg.detect_loops {
        let found = loops::detect_control_loops(&result.components, &result.connections);
        stats.control_loops = found.len();
        result.metadata.control_loops = found;
    }

    result.refresh_totals();
    result.metadata.quality_metrics = Some(quality::calculate_quality_metrics(&result));
    stats.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        components = result.components.len(),
        connections = result.connections.len(),
        isa_detected = stats.isa_detected,
        inferred = stats.inferred_connections,
        traced = stats.traced_connections,
        loops = stats.control_loops,
        issues = stats.validation_issues,
        duration_ms = stats.duration_ms,
        "Enhancement complete"
    );

    result.metadata.enhancement = Some(stats);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::model::{Component, Connection, ConnectionType};

    fn drawing() -> AnalysisResult {
        let mut sensor = Component::new("s", "Temperature Sensor", "TT-101", BBox::new(0.1, 0.1, 0.12, 0.12), 0.92);
        sensor.meta.description = Some("temperature transmitter".to_string());
        let controller = Component::new("c", "instrument_controller", "TIC-101", BBox::new(0.3, 0.1, 0.32, 0.12), 0.9);
        let valve = Component::new("v", "valve_control", "TV-101", BBox::new(0.5, 0.1, 0.52, 0.12), 0.85);
        AnalysisResult::new(
            vec![sensor, controller, valve],
            vec![Connection::new("c1", "s", "c", ConnectionType::ElectricSignal, 0.9)],
        )
    }

    #[test]
    fn test_full_enhancement() {
        let out = enhance(drawing(), &EnhanceConfig::default());
        assert_eq!(out.components.len(), 3);
        assert_eq!(out.components[0].component_type, "sensor_temperature");

        // controller -> valve was filled in, making a complete loop
        assert!(out.connections.iter().any(|c| c.id == "inferred-c-v"));
        assert_eq!(out.metadata.control_loops.len(), 1);
        assert_eq!(out.metadata.control_loops[0].id, "loop-TT-101");

        let stats = out.metadata.enhancement.as_ref().unwrap();
        assert_eq!(stats.isa_detected, 3);
        assert!((stats.isa_rate - 1.0).abs() < 1e-9);
        assert_eq!(stats.inferred_connections, 1);
        assert_eq!(stats.control_loops, 1);
        assert_eq!(out.metadata.total_connections, out.connections.len());
        assert!(out.metadata.quality_metrics.is_some());
    }

    #[test]
    fn test_disabled_passes_leave_result_alone() {
        let cfg = EnhanceConfig {
            normalize_types: false,
            associate_labels: false,
            validate_shapes: false,
            decode_tags: false,
            enhance_connections: false,
            correct_connection_types: false,
            infer_missing_connections: false,
            trace_paths: false,
            validate_connections: false,
            detect_loops: false,
            ..EnhanceConfig::default()
        };
        let input = drawing();
        let out = enhance(input.clone(), &cfg);
        assert_eq!(out.components, input.components);
        assert_eq!(out.connections, input.connections);
        assert_eq!(out.metadata.enhancement.unwrap().isa_detected, 0);
    }

    #[test]
    fn test_empty_result() {
        let out = enhance(AnalysisResult::default(), &EnhanceConfig::default());
        assert!(out.components.is_empty());
        let stats = out.metadata.enhancement.unwrap();
        assert!(stats.isa_rate.abs() < f64::EPSILON);
    }
}
