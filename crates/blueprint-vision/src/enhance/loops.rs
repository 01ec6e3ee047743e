//! Control loop detection.
//!
//! A loop is a sensor whose forward reach (following connections whose
//! targets exist) contains both a controller and a final element.

use crate::enhance::connections::loop_token;
use crate::model::{Component, Connection, ControlLoop};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use tracing::debug;

const LOOP_CONFIDENCE: f64 = 0.85;

static MEASURED_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]+)").expect("Invalid measured variable regex"));

fn is_final_element(ty: &str) -> bool {
    ty.contains("valve") || ty.contains("damper")
}

/// Detect feedback loops starting at every `sensor_*` component.
#[must_use = "returns the detected control loops"]
pub fn detect_control_loops(components: &[Component], connections: &[Connection]) -> Vec<ControlLoop> {
    let by_id: FxHashMap<&str, &Component> = components.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut outgoing: FxHashMap<&str, Vec<&Connection>> = FxHashMap::default();
    for conn in connections {
        outgoing.entry(conn.from_id.as_str()).or_default().push(conn);
    }

    let mut loops = Vec::new();
    for sensor in components.iter().filter(|c| c.component_type.starts_with("sensor_")) {
        let mut members: Vec<&Component> = vec![sensor];
        let mut edges: Vec<String> = Vec::new();
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        visited.insert(sensor.id.as_str());
        let mut queue = VecDeque::from([sensor.id.as_str()]);

        while let Some(current) = queue.pop_front() {
            for conn in outgoing.get(current).into_iter().flatten() {
                let target = conn.to_id.as_str();
                if !visited.insert(target) {
                    continue;
                }
                if let Some(&comp) = by_id.get(target) {
                    members.push(comp);
                    edges.push(conn.id.clone());
                    queue.push_back(target);
                }
            }
        }

        let has_controller = members.iter().any(|c| c.component_type.contains("controller"));
        let has_actuator = members.iter().any(|c| is_final_element(&c.component_type));
        if !(has_controller && has_actuator) {
            continue;
        }

        let variable = MEASURED_PREFIX
            .captures(&sensor.label)
            .map_or_else(|| "Unknown".to_string(), |c| c[1].to_string());
        let token = loop_token(&sensor.label);
        debug!(sensor = %sensor.id, members = members.len(), "Detected control loop");
        loops.push(ControlLoop {
            id: format!("loop-{}", sensor.label),
            name: format!("{variable} Control Loop ({})", sensor.label),
            loop_type: variable.to_lowercase(),
            loop_id: (token != "default").then(|| token.to_string()),
            components: members.iter().map(|c| c.id.clone()).collect(),
            connections: edges,
            strategy: "feedback".to_string(),
            confidence: LOOP_CONFIDENCE,
        });
    }
    loops
}
