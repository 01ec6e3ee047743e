//! Map-reduce merge of per-tile detections.
//!
//! ## Overview
//!
//! [`merge_tile_results`] maps every tile-local box onto the sheet, then
//! reduces with [`merge_components`], a type-aware non-maximum suppression.
//! Symbols on a tile seam are usually reported by two or more tiles; NMS
//! keeps the most confident report and folds the rest into its
//! `meta.sources`.
//!
//! Invariants of [`merge_components`]:
//! - the output is never longer than the input
//! - no two kept components of the same type overlap with IoU above the
//!   threshold

use crate::analyzer::TileAnalysis;
use crate::config::MergeConfig;
use crate::geometry::{iou, local_to_global};
use crate::model::{AnalysisResult, Component, Connection, TransformRecord};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// Confidence used for ordering when a component reports a non-finite value.
const MISSING_CONFIDENCE: f64 = 1.0;

#[inline]
fn sort_confidence(comp: &Component) -> f64 {
    if comp.confidence.is_finite() {
        comp.confidence
    } else {
        MISSING_CONFIDENCE
    }
}

fn fold_duplicate(keeper: &mut Component, duplicate: Component) {
    let duplicate_confidence = sort_confidence(&duplicate);
    if keeper.meta.sources.is_empty() {
        keeper.meta.sources.push(keeper.id.clone());
    }
    if duplicate.meta.sources.is_empty() {
        keeper.meta.sources.push(duplicate.id);
    } else {
        keeper.meta.sources.extend(duplicate.meta.sources);
    }
    keeper.confidence = sort_confidence(keeper).max(duplicate_confidence);
    keeper.meta.merged_from_count = Some(keeper.meta.sources.len());
}

/// Type-aware NMS.
///
/// Components are visited by descending confidence (ties by id). A
/// candidate whose IoU with an already kept component of the same type
/// exceeds `iou_threshold` is folded into that keeper.
#[must_use = "returns the deduplicated components"]
pub fn merge_components(mut components: Vec<Component>, iou_threshold: f64) -> Vec<Component> {
    let input = components.len();
    components.sort_by(|a, b| {
        sort_confidence(b)
            .partial_cmp(&sort_confidence(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut kept: Vec<Component> = Vec::with_capacity(components.len());
    for candidate in components {
        let keeper = kept.iter_mut().find(|k| {
            k.component_type == candidate.component_type && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        match keeper {
            Some(keeper) => {
                debug!(keeper = %keeper.id, duplicate = %candidate.id, "Suppressed duplicate");
                fold_duplicate(keeper, candidate);
            }
            None => kept.push(candidate),
        }
    }

    debug!(input, output = kept.len(), iou_threshold, "NMS complete");
    kept
}

/// Point connections at the components that survived NMS.
///
/// Every id folded into a keeper's `meta.sources` is rewritten to the
/// keeper id. Edges that collapse onto one component are dropped, and edges
/// that end up with the same endpoints and type keep the most confident one.
fn remap_connections(connections: Vec<Connection>, kept: &[Component]) -> Vec<Connection> {
    let survivors: FxHashMap<&str, &str> = kept
        .iter()
        .flat_map(|c| {
            c.meta
                .sources
                .iter()
                .filter(move |s| **s != c.id)
                .map(move |s| (s.as_str(), c.id.as_str()))
        })
        .collect();

    let mut out: Vec<Connection> = Vec::with_capacity(connections.len());
    let mut edges: FxHashMap<(String, String, String), usize> = FxHashMap::default();
    let mut dropped = 0usize;

    for mut conn in connections {
        if let Some(&keeper) = survivors.get(conn.from_id.as_str()) {
            conn.from_id = keeper.to_string();
        }
        if let Some(&keeper) = survivors.get(conn.to_id.as_str()) {
            conn.to_id = keeper.to_string();
        }
        if conn.from_id == conn.to_id {
            dropped += 1;
            continue;
        }

        let key = (conn.from_id.clone(), conn.to_id.clone(), conn.connection_type.clone());
        match edges.get(&key) {
            Some(&i) => {
                dropped += 1;
                if conn.confidence > out[i].confidence {
                    out[i] = conn;
                }
            }
            None => {
                edges.insert(key, out.len());
                out.push(conn);
            }
        }
    }

    if dropped > 0 {
        debug!(dropped, "Collapsed connections onto merged components");
    }
    out
}

/// Map tile results onto the sheet, concatenate them and deduplicate.
///
/// Component and connection ids that repeat across tiles are renamed to
/// `{id}-{position}`, and the tile's connections follow the rename. After
/// NMS, connections that referenced a suppressed duplicate point at its
/// keeper.
#[must_use = "returns the merged result"]
pub fn merge_tile_results(tiles: Vec<TileAnalysis>, cfg: &MergeConfig) -> AnalysisResult {
    let mut components = Vec::new();
    let mut connections = Vec::new();
    let mut logs = Vec::new();
    let mut seen_components: FxHashSet<String> = FxHashSet::default();
    let mut seen_connections: FxHashSet<String> = FxHashSet::default();
    let tile_count = tiles.len();

    for TileAnalysis {
        position,
        tile_bbox,
        result,
    } in tiles
    {
        let mut renamed: FxHashMap<String, String> = FxHashMap::default();

        for mut comp in result.components {
            if !seen_components.insert(comp.id.clone()) {
                let new_id = format!("{}-{position}", comp.id);
                renamed.insert(comp.id.clone(), new_id.clone());
                seen_components.insert(new_id.clone());
                comp.id = new_id;
            }
            comp.meta.source_tile = Some(position.to_string());
            let local = comp.bbox;
            match local_to_global(&local, &tile_bbox) {
                Ok(global) => {
                    comp.bbox = global;
                    comp.meta
                        .transform_history
                        .push(TransformRecord::now("local_to_global", Some(local.to_array().to_vec())));
                }
                Err(e) => {
                    warn!(id = %comp.id, tile = %position, error = %e, "Keeping tile-local bbox");
                    comp.meta.transform_error = Some(e.to_string());
                }
            }
            components.push(comp);
        }

        for mut conn in result.connections {
            if let Some(id) = renamed.get(&conn.from_id) {
                conn.from_id.clone_from(id);
            }
            if let Some(id) = renamed.get(&conn.to_id) {
                conn.to_id.clone_from(id);
            }
            if !seen_connections.insert(conn.id.clone()) {
                conn.id = format!("{}-{position}", conn.id);
                seen_connections.insert(conn.id.clone());
            }
            connections.push(conn);
        }

        if let Some(log) = result.metadata.process_log {
            logs.push(format!("[{position}] {log}"));
        }
    }

    let before = components.len();
    let components = merge_components(components, cfg.iou_threshold);
    let connections = remap_connections(connections, &components);
    info!(
        tiles = tile_count,
        components_before = before,
        components_after = components.len(),
        connections = connections.len(),
        "Merged tile results"
    );

    let mut merged = AnalysisResult::new(components, connections);
    merged.metadata.tiled = true;
    if !logs.is_empty() {
        merged.metadata.process_log = Some(logs.join("\n"));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::model::ConnectionType;
    use crate::tiling::TilePosition;

    fn valve(id: &str, bbox: BBox, conf: f64) -> Component {
        Component::new(id, "valve_gate", "HV-1", bbox, conf)
    }

    #[test]
    fn test_duplicate_valve_across_tiles() {
        let a = valve("a", BBox::new(0.40, 0.40, 0.50, 0.50), 0.85);
        let b = valve("b", BBox::new(0.41, 0.41, 0.51, 0.51), 0.9);
        assert!(iou(&a.bbox, &b.bbox) > 0.6);

        let out = merge_components(vec![a, b], 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "b");
        assert!((out[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(out[0].meta.sources, vec!["b", "a"]);
        assert_eq!(out[0].meta.merged_from_count, Some(2));
    }

    #[test]
    fn test_different_types_are_kept() {
        let a = valve("a", BBox::new(0.4, 0.4, 0.5, 0.5), 0.9);
        let b = Component::new("b", "sensor_flow", "FT-1", BBox::new(0.4, 0.4, 0.5, 0.5), 0.9);
        assert_eq!(merge_components(vec![a, b], 0.5).len(), 2);
    }

    #[test]
    fn test_ties_break_by_id() {
        let a = valve("z", BBox::new(0.4, 0.4, 0.5, 0.5), 0.8);
        let b = valve("m", BBox::new(0.4, 0.4, 0.5, 0.5), 0.8);
        let out = merge_components(vec![a, b], 0.5);
        assert_eq!(out[0].id, "m");
    }

    #[test]
    fn test_merge_tile_results_maps_and_renames() {
        let left = TileAnalysis {
            position: TilePosition::TopLeft,
            tile_bbox: BBox::new(0.0, 0.0, 0.5, 0.5),
            result: AnalysisResult::new(
                vec![valve("v1", BBox::new(0.2, 0.2, 0.4, 0.4), 0.9)],
                Vec::new(),
            ),
        };
        let right = TileAnalysis {
            position: TilePosition::TopRight,
            tile_bbox: BBox::new(0.5, 0.0, 1.0, 0.5),
            result: AnalysisResult::new(
                vec![
                    valve("v1", BBox::new(0.2, 0.2, 0.4, 0.4), 0.9),
                    Component::new("p1", "pump", "P-1", BBox::new(0.6, 0.6, 0.8, 0.8), 0.8),
                ],
                vec![Connection::new("c1", "v1", "p1", ConnectionType::ProcessFlow, 0.8)],
            ),
        };

        let merged = merge_tile_results(vec![left, right], &MergeConfig::default());
        assert!(merged.metadata.tiled);
        assert_eq!(merged.components.len(), 3);
        let renamed = merged.components.iter().find(|c| c.id == "v1-top-right").unwrap();
        assert_eq!(renamed.meta.source_tile.as_deref(), Some("top-right"));
        assert!((renamed.bbox.xmin - 0.6).abs() < 1e-9);
        assert_eq!(merged.connections[0].from_id, "v1-top-right");
        assert_eq!(merged.metadata.total_components, 3);
    }

    fn tile(position: TilePosition, tile_bbox: BBox, components: Vec<Component>, connections: Vec<Connection>) -> TileAnalysis {
        TileAnalysis {
            position,
            tile_bbox,
            result: AnalysisResult::new(components, connections),
        }
    }

    #[test]
    fn test_connections_follow_suppressed_duplicates() {
        // Valve and pump sit in the overlap strip and are seen by both tiles
        let left = tile(
            TilePosition::TopLeft,
            BBox::new(0.0, 0.0, 0.55, 0.5),
            vec![
                valve("a", BBox::new(0.80, 0.20, 0.90, 0.30), 0.9),
                Component::new("b", "pump", "P-1", BBox::new(0.82, 0.50, 0.95, 0.60), 0.9),
            ],
            vec![Connection::new("c9", "a", "b", ConnectionType::ProcessFlow, 0.7)],
        );
        let right = tile(
            TilePosition::TopRight,
            BBox::new(0.45, 0.0, 1.0, 0.5),
            vec![
                valve("v1", BBox::new(0.0, 0.20, 0.10, 0.30), 0.8),
                Component::new("p1", "pump", "P-1", BBox::new(0.02, 0.50, 0.15, 0.60), 0.8),
            ],
            vec![Connection::new("c1", "v1", "p1", ConnectionType::ProcessFlow, 0.8)],
        );

        let merged = merge_tile_results(vec![left, right], &MergeConfig::default());
        let ids: Vec<&str> = merged.components.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(merged.connections.len(), 1);
        let conn = &merged.connections[0];
        assert_eq!((conn.from_id.as_str(), conn.to_id.as_str()), ("a", "b"));
        assert_eq!(conn.id, "c1");
        for conn in &merged.connections {
            assert!(ids.contains(&conn.from_id.as_str()));
            assert!(ids.contains(&conn.to_id.as_str()));
        }
        assert_eq!(merged.metadata.total_connections, 1);
    }

    #[test]
    fn test_connection_inside_one_merged_component_is_dropped() {
        let kept = vec![{
            let mut v = valve("a", BBox::new(0.4, 0.4, 0.5, 0.5), 0.9);
            v.meta.sources = vec!["a".to_string(), "a2".to_string()];
            v
        }];
        let conns = vec![Connection::new("c1", "a", "a2", ConnectionType::ProcessFlow, 0.8)];
        assert!(remap_connections(conns, &kept).is_empty());
    }
}
