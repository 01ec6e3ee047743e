//! Spatial association of orphaned tag labels with unlabeled symbols.
//!
//! Models often report a tag (`TT-101`) as a separate text component next to
//! an unlabeled symbol. This pass folds each orphaned label into the nearest
//! plausible symbol.
//!
//! Matching is greedy and deterministic: unlabeled components are visited in
//! ascending id order, each claims its highest-scoring unclaimed label, and
//! equal scores keep the lowest label id. A label is claimed at most once.

use crate::config::AssociationConfig;
use crate::geometry::{center_distance, edge_distance};
use crate::model::Component;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

/// Distance at which the proximity term of the score reaches zero.
const SCORE_DISTANCE_SCALE: f64 = 0.15;

const MISSING_CONFIDENCE: f64 = 0.5;

static NUMBERED_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z]{1,4}-?\d{2,4}$").expect("Invalid numbered tag regex"));

static FUNCTION_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z]{2,4}$").expect("Invalid function code regex"));

const TEXT_TYPES: &[&str] = &["text", "label", "text_label", "annotation", "tag"];

const GENERIC_LABELS: &[&str] = &["", "unlabeled", "unknown", "n/a", "none"];

/// True for labels such as `TT-101`, `FV203` or `PIC`.
#[must_use = "returns whether the text looks like an engineering tag"]
pub fn is_engineering_tag(label: &str) -> bool {
    let trimmed = label.trim();
    NUMBERED_TAG.is_match(trimmed) || FUNCTION_CODE.is_match(trimmed)
}

fn is_orphaned_label(comp: &Component) -> bool {
    let ty = comp.component_type.to_lowercase();
    TEXT_TYPES.contains(&ty.as_str()) && is_engineering_tag(&comp.label)
}

fn is_unlabeled(comp: &Component) -> bool {
    let label = comp.label.trim().to_lowercase();
    GENERIC_LABELS.contains(&label.as_str()) || label == comp.component_type.to_lowercase()
}

/// Score a candidate pairing; higher is better.
#[must_use = "returns the pairing score"]
pub fn pairing_score(label: &Component, component: &Component, distance: f64) -> f64 {
    let mut score = (1.0 - distance / SCORE_DISTANCE_SCALE).max(0.0) * 50.0;
    if is_engineering_tag(&label.label) {
        score += 30.0;
    }
    match label.label.trim().chars().count() {
        3..=8 => score += 15.0,
        n if n > 8 => score += 5.0,
        _ => {}
    }
    let conf = |c: f64| if c > 0.0 { c } else { MISSING_CONFIDENCE };
    score + (conf(label.confidence) + conf(component.confidence)) * 2.5
}

struct Candidate {
    label_index: usize,
    distance: f64,
    score: f64,
}

/// Merge orphaned labels into nearby unlabeled components.
///
/// Output order is: components that already had labels (plus unlabeled ones
/// with no match), merged components, then labels that stayed orphaned.
#[must_use = "returns the associated components"]
pub fn merge_orphaned_labels(components: Vec<Component>, cfg: &AssociationConfig) -> (Vec<Component>, usize) {
    let mut labels = Vec::new();
    let mut unlabeled = Vec::new();
    let mut labeled = Vec::new();
    for comp in components {
        if is_orphaned_label(&comp) {
            labels.push(comp);
        } else if is_unlabeled(&comp) {
            unlabeled.push(comp);
        } else {
            labeled.push(comp);
        }
    }

    debug!(
        orphaned = labels.len(),
        unlabeled = unlabeled.len(),
        labeled = labeled.len(),
        "Spatial association candidates"
    );

    if labels.is_empty() || unlabeled.is_empty() {
        labeled.extend(unlabeled);
        labeled.extend(labels);
        return (labeled, 0);
    }

    unlabeled.sort_by(|a, b| a.id.cmp(&b.id));
    let mut label_order: Vec<usize> = (0..labels.len()).collect();
    label_order.sort_by(|&a, &b| labels[a].id.cmp(&labels[b].id));

    let mut claimed = vec![false; labels.len()];
    let mut merged = Vec::new();

    for mut comp in unlabeled {
        let mut best: Option<Candidate> = None;
        for &li in &label_order {
            if claimed[li] {
                continue;
            }
            let label = &labels[li];
            let distance = if cfg.use_edge_distance {
                edge_distance(&comp.bbox, &label.bbox)
            } else {
                center_distance(&comp.bbox, &label.bbox)
            };
            if distance > cfg.max_distance || label.confidence < cfg.min_confidence {
                continue;
            }
            let score = pairing_score(label, &comp, distance);
            // Strict comparison keeps the lowest label id on ties
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    label_index: li,
                    distance,
                    score,
                });
            }
        }

        match best {
            Some(Candidate {
                label_index,
                distance,
                score,
            }) => {
                let label = &labels[label_index];
                debug!(
                    label = %label.label,
                    component = %comp.id,
                    distance,
                    score,
                    "Merging orphaned label"
                );
                comp.label = label.label.trim().to_string();
                comp.confidence = comp.confidence.max(label.confidence);
                comp.meta.tag = Some(comp.label.clone());
                comp.meta.merged_from_orphaned_label = Some(true);
                comp.meta.orphaned_label_id = Some(label.id.clone());
                comp.meta.merge_distance = Some(distance);
                comp.meta.merge_score = Some(score);
                if comp.meta.reasoning.is_none() {
                    comp.meta.reasoning = Some(format!(
                        "{} with merged tag {}",
                        comp.component_type, comp.label
                    ));
                }
                claimed[label_index] = true;
                merged.push(comp);
            }
            None => labeled.push(comp),
        }
    }

    let merge_count = merged.len();
    let remaining: Vec<Component> = labels
        .into_iter()
        .zip(claimed)
        .filter_map(|(label, used)| (!used).then_some(label))
        .collect();

    info!(
        merged = merge_count,
        still_orphaned = remaining.len(),
        "Spatial association complete"
    );

    labeled.extend(merged);
    labeled.extend(remaining);
    (labeled, merge_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn comp(id: &str, ty: &str, label: &str, bbox: BBox, conf: f64) -> Component {
        Component::new(id, ty, label, bbox, conf)
    }

    #[test]
    fn test_engineering_tags() {
        assert!(is_engineering_tag("TT-101"));
        assert!(is_engineering_tag("fv203"));
        assert!(is_engineering_tag("PIC"));
        assert!(!is_engineering_tag("Supply air to zone 3"));
        assert!(!is_engineering_tag("T-1"));
    }

    #[test]
    fn test_merges_nearest_label() {
        let comps = vec![
            comp("v1", "valve_gate", "valve_gate", BBox::new(0.10, 0.10, 0.15, 0.15), 0.8),
            comp("t1", "text", "HV-101", BBox::new(0.16, 0.10, 0.20, 0.12), 0.9),
            comp("p1", "pump", "P-1", BBox::new(0.5, 0.5, 0.6, 0.6), 0.9),
        ];
        let (out, merged) = merge_orphaned_labels(comps, &AssociationConfig::default());
        assert_eq!(merged, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "p1");
        let v = &out[1];
        assert_eq!(v.label, "HV-101");
        assert_eq!(v.meta.tag.as_deref(), Some("HV-101"));
        assert_eq!(v.meta.orphaned_label_id.as_deref(), Some("t1"));
        assert!((v.confidence - 0.9).abs() < 1e-9);
        assert!(v.meta.merge_distance.unwrap() <= 0.08);
    }

    #[test]
    fn test_far_or_weak_labels_stay_orphaned() {
        let comps = vec![
            comp("v1", "valve_gate", "", BBox::new(0.10, 0.10, 0.15, 0.15), 0.8),
            comp("t1", "text", "HV-101", BBox::new(0.80, 0.80, 0.85, 0.85), 0.9),
            comp("t2", "text", "HV-102", BBox::new(0.16, 0.10, 0.20, 0.12), 0.3),
        ];
        let (out, merged) = merge_orphaned_labels(comps, &AssociationConfig::default());
        assert_eq!(merged, 0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "v1");
    }

    #[test]
    fn test_each_label_claimed_once() {
        let comps = vec![
            comp("b", "valve_gate", "unknown", BBox::new(0.10, 0.10, 0.15, 0.15), 0.8),
            comp("a", "valve_gate", "unknown", BBox::new(0.10, 0.16, 0.15, 0.21), 0.8),
            comp("t1", "label", "HV-101", BBox::new(0.16, 0.14, 0.20, 0.16), 0.9),
        ];
        let (out, merged) = merge_orphaned_labels(comps, &AssociationConfig::default());
        assert_eq!(merged, 1);
        // "a" is visited first and claims the only label
        let a = out.iter().find(|c| c.id == "a").unwrap();
        assert_eq!(a.label, "HV-101");
        let b = out.iter().find(|c| c.id == "b").unwrap();
        assert_eq!(b.label, "unknown");
    }

    #[test]
    fn test_score_terms() {
        let label = comp("t", "text", "TT-101", BBox::default(), 0.0);
        let target = comp("c", "sensor", "", BBox::default(), 0.0);
        // 50 + 30 + 15 + (0.5 + 0.5) * 2.5
        assert!((pairing_score(&label, &target, 0.0) - 97.5).abs() < 1e-9);
        assert!((pairing_score(&label, &target, 0.3) - 47.5).abs() < 1e-9);
    }
}
