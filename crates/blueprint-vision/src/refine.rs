//! Full-image self-correction after a tiled merge.
//!
//! ## Overview
//!
//! Tiles localize small symbols well but lose context across seams. The
//! refinement pass shows the model the whole (downsampled) sheet together
//! with the merged inventory and asks for a corrected one. The model's
//! semantic answer wins, but its boxes are drawn at lower resolution, so
//! [`reconcile`] puts the tiled boxes back wherever a refined component can
//! be matched to a merged one.

use crate::classifier::BlueprintType;
use crate::config::RefineConfig;
use crate::geometry::iou;
use crate::inference::prompts::{detection_schema, refine_system_instruction, refinement_prompt};
use crate::inference::{GenerateOptions, VisionClient};
use crate::model::{AnalysisResult, Component, DrawingImage, TransformRecord};
use crate::parse::{is_placeholder, parse_detection_response};
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::{debug, info, warn};

const REFINE_TEMPERATURE: f64 = 0.2;

/// Ask the model to correct the merged result against the full image.
///
/// Returns `merged` unchanged when refinement is disabled, the call fails,
/// or the reply yields no components.
pub async fn refine_with_full_image(
    client: &dyn VisionClient,
    merged: &AnalysisResult,
    full_image: &DrawingImage,
    blueprint_type: BlueprintType,
    cfg: &RefineConfig,
) -> AnalysisResult {
    if !cfg.enabled {
        return merged.clone();
    }

    let payload = json!({
        "components": merged.components,
        "connections": merged.connections,
    });
    let prompt = refinement_prompt(&payload.to_string(), blueprint_type);
    let options = GenerateOptions::default()
        .with_system_instruction(refine_system_instruction())
        .with_schema(detection_schema())
        .with_temperature(REFINE_TEMPERATURE);

    let text = match client.generate_vision(full_image, &prompt, &options).await {
        Ok(text) => text,
        Err(e) => {
            warn!(client = client.name(), error = %e, "Refinement call failed, keeping merged result");
            return merged.clone();
        }
    };

    let refined = parse_detection_response(&text);
    if is_placeholder(&refined) || refined.components.is_empty() {
        warn!(
            parse_error = refined.metadata.parse_error.as_deref().unwrap_or(""),
            "Refinement produced no components, keeping merged result"
        );
        return merged.clone();
    }

    let out = reconcile(merged, refined, cfg.match_iou_threshold);
    info!(
        merged = merged.components.len(),
        refined = out.components.len(),
        connections = out.connections.len(),
        "Refinement reconciled"
    );
    out
}

fn find_match(
    refined: &Component,
    merged: &[Component],
    used: &[bool],
    by_id: &FxHashMap<&str, usize>,
    by_label: &FxHashMap<&str, usize>,
    threshold: f64,
) -> Option<usize> {
    if let Some(&i) = by_id.get(refined.id.as_str()) {
        if !used[i] {
            return Some(i);
        }
    }
    if !refined.label.is_empty() {
        if let Some(&i) = by_label.get(refined.label.as_str()) {
            if !used[i] {
                return Some(i);
            }
        }
    }

    let mut best: Option<(usize, f64)> = None;
    for (i, cand) in merged.iter().enumerate() {
        if used[i] {
            continue;
        }
        let score = iou(&refined.bbox, &cand.bbox);
        if score > threshold && best.map_or(true, |(_, s)| score > s) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

/// Merge a refined result back onto the tiled one.
///
/// Each refined component is matched against `merged` by id, then by
/// non-empty label, then by best `IoU` above `threshold`. Every merged
/// component is claimed at most once. A matched component keeps the
/// refined type, label and metadata, takes the tiled bbox and the higher
/// confidence. Unmatched refined components pass through as drawn.
#[must_use = "returns the reconciled result"]
pub fn reconcile(merged: &AnalysisResult, refined: AnalysisResult, threshold: f64) -> AnalysisResult {
    let mut by_id: FxHashMap<&str, usize> = FxHashMap::default();
    let mut by_label: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, comp) in merged.components.iter().enumerate() {
        by_id.entry(comp.id.as_str()).or_insert(i);
        if !comp.label.is_empty() {
            by_label.entry(comp.label.as_str()).or_insert(i);
        }
    }

    let mut used = vec![false; merged.components.len()];
    let mut matched = 0usize;
    let mut components = Vec::with_capacity(refined.components.len());

    for mut comp in refined.components {
        if let Some(i) = find_match(&comp, &merged.components, &used, &by_id, &by_label, threshold) {
            used[i] = true;
            matched += 1;
            let tiled = &merged.components[i];
            let drawn = comp.bbox;
            comp.bbox = tiled.bbox;
            comp.confidence = comp.confidence.max(tiled.confidence);

            let meta = &mut comp.meta;
            if meta.source_tile.is_none() {
                meta.source_tile.clone_from(&tiled.meta.source_tile);
            }
            if meta.sources.is_empty() {
                meta.sources.clone_from(&tiled.meta.sources);
                meta.merged_from_count = tiled.meta.merged_from_count;
            }
            if meta.transform_history.is_empty() {
                meta.transform_history.clone_from(&tiled.meta.transform_history);
            }
            meta.transform_history
                .push(TransformRecord::now("refine_reconcile", Some(drawn.to_array().to_vec())));
            debug!(refined = %comp.id, tiled = %tiled.id, "Matched refined component");
        }
        components.push(comp);
    }

    let connections = if refined.connections.is_empty() {
        merged.connections.clone()
    } else {
        refined.connections
    };

    debug!(matched, unmatched = components.len() - matched, "Reconcile complete");

    let mut metadata = merged.metadata.clone();
    if refined.metadata.process_log.is_some() {
        metadata.process_log = refined.metadata.process_log;
    }
    let mut out = AnalysisResult {
        components,
        connections,
        metadata,
    };
    out.refresh_totals();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VisionError};
    use crate::geometry::BBox;
    use crate::model::{Connection, ConnectionType};
    use async_trait::async_trait;

    fn merged() -> AnalysisResult {
        let mut valve = Component::new("v1", "valve_gate", "HV-1", BBox::new(0.10, 0.10, 0.20, 0.20), 0.9);
        valve.meta.sources = vec!["v1".into(), "v7".into()];
        valve.meta.merged_from_count = Some(2);
        let pump = Component::new("p1", "pump", "P-1", BBox::new(0.50, 0.50, 0.60, 0.60), 0.7);
        let mut result = AnalysisResult::new(
            vec![valve, pump],
            vec![Connection::new("c1", "v1", "p1", ConnectionType::ProcessFlow, 0.8)],
        );
        result.metadata.tiled = true;
        result
    }

    #[test]
    fn test_reconcile_keeps_tiled_bbox() {
        let refined = AnalysisResult::new(
            vec![
                // Matched by id, boxed loosely at low resolution
                Component::new("v1", "valve_globe", "HV-1", BBox::new(0.08, 0.08, 0.22, 0.22), 0.8),
                // Matched by IoU, renamed by the model
                Component::new("x9", "pump_centrifugal", "", BBox::new(0.50, 0.50, 0.61, 0.60), 0.95),
                // New symbol
                Component::new("n1", "tank", "TK-1", BBox::new(0.80, 0.80, 0.90, 0.90), 0.6),
            ],
            Vec::new(),
        );

        let out = reconcile(&merged(), refined, 0.5);
        assert_eq!(out.components.len(), 3);

        let valve = &out.components[0];
        assert_eq!(valve.component_type, "valve_globe");
        assert_eq!(valve.bbox, BBox::new(0.10, 0.10, 0.20, 0.20));
        assert!((valve.confidence - 0.9).abs() < 1e-9);
        assert_eq!(valve.meta.merged_from_count, Some(2));
        assert_eq!(valve.meta.transform_history.last().unwrap().stage, "refine_reconcile");

        let pump = &out.components[1];
        assert_eq!(pump.component_type, "pump_centrifugal");
        assert_eq!(pump.bbox, BBox::new(0.50, 0.50, 0.60, 0.60));
        assert!((pump.confidence - 0.95).abs() < 1e-9);

        assert_eq!(out.components[2].bbox, BBox::new(0.80, 0.80, 0.90, 0.90));
        // No refined connections, so the merged ones survive
        assert_eq!(out.connections.len(), 1);
        assert!(out.metadata.tiled);
        assert_eq!(out.metadata.total_components, 3);
    }

    #[test]
    fn test_merged_component_claimed_once() {
        let refined = AnalysisResult::new(
            vec![
                Component::new("a", "valve_gate", "HV-1", BBox::new(0.1, 0.1, 0.2, 0.2), 0.5),
                Component::new("b", "valve_gate", "HV-1", BBox::new(0.1, 0.1, 0.2, 0.2), 0.5),
            ],
            Vec::new(),
        );
        let out = reconcile(&merged(), refined, 0.5);
        assert!(out.components[0].meta.transform_history.iter().any(|r| r.stage == "refine_reconcile"));
        assert!(out.components[1].meta.transform_history.is_empty());
    }

    struct Reply(Result<String>);

    #[async_trait]
    impl VisionClient for Reply {
        async fn generate_vision(&self, _: &DrawingImage, prompt: &str, _: &GenerateOptions) -> Result<String> {
            assert!(prompt.contains("HV-1"));
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(VisionError::Inference(e.to_string())),
            }
        }
    }

    fn image() -> DrawingImage {
        DrawingImage::from_base64("AAAA", "image/png")
    }

    #[tokio::test]
    async fn test_failures_return_merged() {
        let base = merged();
        let cfg = RefineConfig::default();

        let failing = Reply(Err(VisionError::Inference("503".into())));
        let out = refine_with_full_image(&failing, &base, &image(), BlueprintType::Pid, &cfg).await;
        assert_eq!(out, base);

        let empty = Reply(Ok(r#"{"components": []}"#.into()));
        let out = refine_with_full_image(&empty, &base, &image(), BlueprintType::Pid, &cfg).await;
        assert_eq!(out, base);

        let garbage = Reply(Ok("no idea".into()));
        let out = refine_with_full_image(&garbage, &base, &image(), BlueprintType::Pid, &cfg).await;
        assert_eq!(out, base);
    }

    #[tokio::test]
    async fn test_refine_applies_reply() {
        let reply = Reply(Ok(
            r#"{"components":[{"id":"v1","type":"valve_ball","label":"BV-1","bbox":[0.09,0.09,0.21,0.21],"confidence":0.7}],
                "connections":[]}"#
                .into(),
        ));
        let out = refine_with_full_image(&reply, &merged(), &image(), BlueprintType::Pid, &RefineConfig::default()).await;
        assert_eq!(out.components.len(), 1);
        assert_eq!(out.components[0].component_type, "valve_ball");
        assert_eq!(out.components[0].bbox, BBox::new(0.10, 0.10, 0.20, 0.20));
    }

    #[tokio::test]
    async fn test_disabled_skips_call() {
        let reply = Reply(Ok("unused".into()));
        let cfg = RefineConfig {
            enabled: false,
            ..RefineConfig::default()
        };
        let base = merged();
        assert_eq!(refine_with_full_image(&reply, &base, &image(), BlueprintType::Hvac, &cfg).await, base);
    }
}
