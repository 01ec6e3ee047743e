//! Connection type inference, gap filling and consistency checks.
//!
//! ## Overview
//!
//! Connection types are inferred from the component types at both ends via
//! an ordered rule table. Rule patterns ending in `_*` match any type with
//! that prefix. When no rule matches, a proximity heuristic over the two
//! bounding boxes is consulted, and failing that the type is `unknown`.
//!
//! The same inference drives four passes:
//! - [`enhance_connections`] annotates existing connections
//! - [`correct_connection_types`] rewrites confidently wrong types
//! - [`infer_missing_connections`] and [`trace_connection_paths`] add edges
//! - [`validate_connections`] reports problems without removing anything

use crate::config::PathTraceConfig;
use crate::geometry::{alignment, center_distance};
use crate::model::{Component, Connection, ConnectionType, IssueSeverity, ValidationIssue};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Minimum inference confidence before an existing type is overwritten.
const CORRECTION_THRESHOLD: f64 = 0.85;
/// Minimum inference confidence before a mismatch is reported.
const MISMATCH_THRESHOLD: f64 = 0.8;

const PATH_MIN_CONFIDENCE: f64 = 0.6;
const PATH_CONFIDENCE_FACTOR: f64 = 0.85;
const SIGNAL_MIN_CONFIDENCE: f64 = 0.65;
const SIGNAL_CONFIDENCE_FACTOR: f64 = 0.8;
const SIGNAL_DISTANCE_FACTOR: f64 = 1.5;

static LOOP_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_](\d+)").expect("Invalid loop token regex"));

struct ConnectionRule {
    from: &'static str,
    to: &'static str,
    connection_type: ConnectionType,
    confidence: f64,
    reasoning: &'static str,
}

const fn rule(
    from: &'static str,
    to: &'static str,
    connection_type: ConnectionType,
    confidence: f64,
    reasoning: &'static str,
) -> ConnectionRule {
    ConnectionRule {
        from,
        to,
        connection_type,
        confidence,
        reasoning,
    }
}

use ConnectionType::{ControlSignal, Data, ElectricSignal, Measurement, PneumaticSignal, ProcessFlow};

/// First match wins.
#[rustfmt::skip]
const CONNECTION_RULES: &[ConnectionRule] = &[
    // sensor -> controller
    rule("sensor_temperature", "instrument_controller", ElectricSignal, 0.95, "Temperature sensor to controller signal path"),
    rule("sensor_pressure", "instrument_controller", ElectricSignal, 0.95, "Pressure sensor to controller signal path"),
    rule("sensor_flow", "instrument_controller", ElectricSignal, 0.95, "Flow sensor to controller signal path"),
    rule("sensor_level", "instrument_controller", ElectricSignal, 0.95, "Level sensor to controller signal path"),
    // sensor -> transmitter -> controller/indicator
    rule("sensor_temperature", "instrument_transmitter", ElectricSignal, 0.93, "Temperature sensor to transmitter"),
    rule("sensor_pressure", "instrument_transmitter", ElectricSignal, 0.93, "Pressure sensor to transmitter"),
    rule("sensor_flow", "instrument_transmitter", ElectricSignal, 0.93, "Flow sensor to transmitter"),
    rule("instrument_transmitter", "instrument_controller", ElectricSignal, 0.94, "Transmitter output to controller input"),
    rule("instrument_transmitter", "instrument_indicator", ElectricSignal, 0.92, "Transmitter signal to indicator display"),
    // controller -> final element
    rule("instrument_controller", "valve_control", ControlSignal, 0.93, "Controller to control valve actuation"),
    rule("instrument_controller", "valve_solenoid", ControlSignal, 0.92, "Controller to solenoid valve actuation"),
    rule("instrument_controller", "damper", ControlSignal, 0.91, "Controller to damper actuator"),
    rule("instrument_controller", "pump", ControlSignal, 0.90, "Controller to pump VFD/starter"),
    rule("instrument_logic", "valve_control", ControlSignal, 0.88, "Logic output to control valve"),
    rule("instrument_logic", "valve_solenoid", ControlSignal, 0.88, "Logic output to solenoid valve"),
    // relays
    rule("sensor_temperature", "instrument_relay", ElectricSignal, 0.90, "Sensor to relay/signal conditioner"),
    rule("instrument_relay", "sensor_*", ElectricSignal, 0.88, "Relay output to downstream sensor"),
    // process lines
    rule("pipe", "valve_*", ProcessFlow, 0.85, "Pipe to valve process flow"),
    rule("valve_*", "pipe", ProcessFlow, 0.85, "Valve to pipe process flow"),
    rule("pipe", "pump", ProcessFlow, 0.87, "Pipe to pump process flow"),
    rule("pump", "pipe", ProcessFlow, 0.87, "Pump discharge to pipe"),
    rule("pipe", "heat_exchanger", ProcessFlow, 0.86, "Pipe to heat exchanger"),
    rule("heat_exchanger", "pipe", ProcessFlow, 0.86, "Heat exchanger to pipe"),
    rule("pipe", "equipment", ProcessFlow, 0.80, "Pipe to equipment connection"),
    rule("equipment", "pipe", ProcessFlow, 0.80, "Equipment to pipe connection"),
    rule("pipe", "valve_check", ProcessFlow, 0.88, "Pipe to check valve (one-way flow)"),
    rule("valve_check", "pipe", ProcessFlow, 0.88, "Check valve to pipe (forward flow only)"),
    rule("valve_ball", "pipe", ProcessFlow, 0.87, "Manual ball valve to pipe"),
    rule("pipe", "valve_ball", ProcessFlow, 0.87, "Pipe to manual ball valve"),
    // pneumatic
    rule("instrument_logic", "pipe", PneumaticSignal, 0.82, "Pneumatic signal to instrument air pipe"),
    rule("valve_solenoid", "pipe", PneumaticSignal, 0.80, "Solenoid to pneumatic control line"),
    // measurement taps
    rule("sensor_*", "pipe", Measurement, 0.75, "Sensor measuring pipe parameter"),
    rule("sensor_temperature", "equipment", Measurement, 0.78, "Temperature sensor measuring equipment"),
    rule("sensor_pressure", "pipe", Measurement, 0.80, "Pressure sensor tapped into pipe"),
    rule("sensor_flow", "pipe", Measurement, 0.82, "Flow sensor measuring pipe flow"),
    // data links
    rule("sensor_*", "data", Data, 0.80, "Sensor to data link connection"),
    rule("instrument_controller", "data", Data, 0.82, "Controller to data network"),
    // equipment chains
    rule("pump", "heat_exchanger", ProcessFlow, 0.75, "Pump circulating through heat exchanger"),
    rule("chiller", "pump", ProcessFlow, 0.78, "Chiller to circulation pump"),
    rule("cooling_tower", "chiller", ProcessFlow, 0.77, "Cooling tower to chiller condenser"),
];

/// Inferred type for a component pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInference {
    pub connection_type: ConnectionType,
    pub confidence: f64,
    pub reasoning: String,
}

impl TypeInference {
    fn new(connection_type: ConnectionType, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            connection_type,
            confidence,
            reasoning: reasoning.into(),
        }
    }
}

#[inline]
fn matches_pattern(component_type: &str, pattern: &str) -> bool {
    match pattern.strip_suffix("_*") {
        Some(prefix) => component_type.starts_with(prefix),
        None => component_type == pattern,
    }
}

fn has_pneumatic_indicator(comp: &Component) -> bool {
    let check = |text: &str| {
        let upper = text.to_uppercase();
        ["PN", "PNEUM", "AIR", "//"].iter().any(|m| upper.contains(m))
    };
    check(&comp.label) || comp.meta.description.as_deref().is_some_and(check)
}

fn infer_from_proximity(from: &Component, to: &Component) -> Option<TypeInference> {
    let distance = center_distance(&from.bbox, &to.bbox);
    let from_ty = from.component_type.as_str();
    let to_ty = to.component_type.as_str();

    if distance < 0.05 {
        if from_ty.contains("pipe") || to_ty.contains("pipe") {
            if has_pneumatic_indicator(from) || has_pneumatic_indicator(to) {
                return Some(TypeInference::new(
                    PneumaticSignal,
                    0.78,
                    "Close proximity pneumatic line detected",
                ));
            }
            return Some(TypeInference::new(ProcessFlow, 0.75, "Close proximity on process line"));
        }
        if from_ty.contains("sensor") || from_ty.contains("instrument") {
            return Some(TypeInference::new(
                ElectricSignal,
                0.70,
                "Close proximity signal components",
            ));
        }
        if from_ty == "instrument_logic" && alignment(&from.bbox, &to.bbox).horizontal {
            return Some(TypeInference::new(
                PneumaticSignal,
                0.72,
                "Horizontal pneumatic connection from logic element",
            ));
        }
    }

    if distance < 0.15 {
        if from_ty.contains("sensor") && to_ty.contains("controller") {
            return Some(TypeInference::new(
                ElectricSignal,
                0.65,
                "Likely control loop sensor to controller",
            ));
        }
        if from_ty.contains("controller") && to_ty.contains("valve") {
            return Some(TypeInference::new(
                ControlSignal,
                0.68,
                "Likely control loop controller to valve",
            ));
        }
    }

    None
}

/// Infer the type of a `from -> to` connection.
#[must_use = "returns the inferred connection type"]
pub fn infer_connection_type(from: &Component, to: &Component) -> TypeInference {
    CONNECTION_RULES
        .iter()
        .find(|r| {
            matches_pattern(&from.component_type, r.from) && matches_pattern(&to.component_type, r.to)
        })
        .map(|r| TypeInference::new(r.connection_type, r.confidence, r.reasoning))
        .or_else(|| infer_from_proximity(from, to))
        .unwrap_or_else(|| {
            TypeInference::new(
                ConnectionType::Unknown,
                0.5,
                "Could not determine connection type from component types",
            )
        })
}

fn index(components: &[Component]) -> FxHashMap<&str, &Component> {
    components.iter().map(|c| (c.id.as_str(), c)).collect()
}

/// Annotate each connection whose endpoints exist with the inferred type
/// and endpoint details. Returns the number annotated.
pub fn enhance_connections(components: &[Component], connections: &mut [Connection]) -> usize {
    let by_id = index(components);
    let mut annotated = 0;
    for conn in connections.iter_mut() {
        let (Some(&from), Some(&to)) = (
            by_id.get(conn.from_id.as_str()),
            by_id.get(conn.to_id.as_str()),
        ) else {
            continue;
        };
        let inference = infer_connection_type(from, to);
        conn.meta.inferred_type = Some(inference.connection_type);
        conn.meta.type_confidence = Some(inference.confidence);
        conn.meta.type_reasoning = Some(inference.reasoning);
        conn.meta.from_component_type = Some(from.component_type.clone());
        conn.meta.to_component_type = Some(to.component_type.clone());
        conn.meta.from_label = Some(from.label.clone());
        conn.meta.to_label = Some(to.label.clone());
        annotated += 1;
    }
    annotated
}

/// Overwrite connection types that disagree with a confident inference.
/// Returns the number of corrected connections.
pub fn correct_connection_types(components: &[Component], connections: &mut [Connection]) -> usize {
    let by_id = index(components);
    let mut corrected = 0;
    for conn in connections.iter_mut() {
        let (Some(&from), Some(&to)) = (
            by_id.get(conn.from_id.as_str()),
            by_id.get(conn.to_id.as_str()),
        ) else {
            continue;
        };
        let expected = infer_connection_type(from, to);
        let expected_type = expected.connection_type.as_str();
        if conn.connection_type != expected_type && expected.confidence > CORRECTION_THRESHOLD {
            warn!(
                id = %conn.id,
                from = %conn.connection_type,
                to = expected_type,
                "Correcting connection type"
            );
            conn.meta.original_type = Some(std::mem::replace(
                &mut conn.connection_type,
                expected_type.to_string(),
            ));
            conn.meta.corrected = Some(true);
            conn.meta.correction_reasoning = Some(expected.reasoning);
            corrected += 1;
        }
    }
    corrected
}

/// Loop token of a label (`TT-101` -> `101`), else `default`.
#[must_use = "returns the loop token"]
pub fn loop_token(label: &str) -> &str {
    LOOP_TOKEN
        .captures(label)
        .and_then(|c| c.get(1))
        .map_or("default", |m| m.as_str())
}

fn inferred_connection(
    id: String,
    from: &Component,
    to: &Component,
    connection_type: ConnectionType,
    confidence: f64,
    reasoning: String,
) -> Connection {
    let mut conn = Connection::new(id, &from.id, &to.id, connection_type, confidence);
    conn.inferred = true;
    conn.meta.reasoning = Some(reasoning);
    conn
}

/// Fill in sensor -> controller and controller -> valve edges within each
/// loop group, skipping pairs that are already connected.
#[must_use = "returns the inferred connections"]
pub fn infer_missing_connections(components: &[Component], connections: &[Connection]) -> Vec<Connection> {
    let existing: FxHashSet<(&str, &str)> = connections
        .iter()
        .map(|c| (c.from_id.as_str(), c.to_id.as_str()))
        .collect();

    // Insertion-ordered grouping keeps output deterministic
    let mut groups: Vec<(&str, Vec<&Component>)> = Vec::new();
    for comp in components {
        let token = loop_token(&comp.label);
        match groups.iter_mut().find(|(t, _)| *t == token) {
            Some((_, members)) => members.push(comp),
            None => groups.push((token, vec![comp])),
        }
    }

    let mut inferred = Vec::new();
    for (loop_id, members) in &groups {
        let sensors: Vec<&Component> = members
            .iter()
            .copied()
            .filter(|c| c.component_type.starts_with("sensor_"))
            .collect();
        let controllers: Vec<&Component> = members
            .iter()
            .copied()
            .filter(|c| c.component_type.contains("controller"))
            .collect();
        let valves: Vec<&Component> = members
            .iter()
            .copied()
            .filter(|c| c.component_type.starts_with("valve_"))
            .collect();

        for sensor in &sensors {
            for controller in &controllers {
                if !existing.contains(&(sensor.id.as_str(), controller.id.as_str())) {
                    inferred.push(inferred_connection(
                        format!("inferred-{}-{}", sensor.id, controller.id),
                        sensor,
                        controller,
                        ElectricSignal,
                        0.85,
                        format!("Inferred control loop connection: {loop_id}"),
                    ));
                }
            }
        }
        for controller in &controllers {
            for valve in &valves {
                if !existing.contains(&(controller.id.as_str(), valve.id.as_str())) {
                    inferred.push(inferred_connection(
                        format!("inferred-{}-{}", controller.id, valve.id),
                        controller,
                        valve,
                        ControlSignal,
                        0.82,
                        format!("Inferred control loop actuation: {loop_id}"),
                    ));
                }
            }
        }
    }

    debug!(count = inferred.len(), groups = groups.len(), "Inferred loop connections");
    inferred
}

fn is_process_component(ty: &str) -> bool {
    ["pipe", "valve", "pump", "equipment"].iter().any(|k| ty.contains(k))
}

fn is_signal_component(ty: &str) -> bool {
    ["sensor", "instrument", "controller", "transmitter"]
        .iter()
        .any(|k| ty.contains(k))
}

/// Discover edges between nearby components that no connection covers.
///
/// Each unordered pair is claimed at most once, whether by an existing
/// connection or a traced one.
#[must_use = "returns the traced connections"]
pub fn trace_connection_paths(
    components: &[Component],
    connections: &[Connection],
    cfg: &PathTraceConfig,
) -> Vec<Connection> {
    let mut connected: FxHashSet<(&str, &str)> = FxHashSet::default();
    for conn in connections {
        connected.insert((conn.from_id.as_str(), conn.to_id.as_str()));
        connected.insert((conn.to_id.as_str(), conn.from_id.as_str()));
    }

    let process: Vec<&Component> = components
        .iter()
        .filter(|c| is_process_component(&c.component_type))
        .collect();
    let signal: Vec<&Component> = components
        .iter()
        .filter(|c| is_signal_component(&c.component_type))
        .collect();

    let mut discovered = Vec::new();

    for a in &process {
        for b in &process {
            if a.id == b.id || connected.contains(&(a.id.as_str(), b.id.as_str())) {
                continue;
            }
            let distance = center_distance(&a.bbox, &b.bbox);
            if distance > cfg.max_distance {
                continue;
            }
            if cfg.require_alignment && !alignment(&a.bbox, &b.bbox).is_axis_aligned() {
                continue;
            }
            let inference = infer_connection_type(a, b);
            if inference.confidence > PATH_MIN_CONFIDENCE {
                let mut conn = inferred_connection(
                    format!("inferred-path-{}-{}", a.id, b.id),
                    a,
                    b,
                    inference.connection_type,
                    inference.confidence * PATH_CONFIDENCE_FACTOR,
                    format!("Path-traced: {}", inference.reasoning),
                );
                conn.meta.distance = Some(distance);
                conn.meta.method = Some("path_tracing".to_string());
                discovered.push(conn);
                connected.insert((a.id.as_str(), b.id.as_str()));
                connected.insert((b.id.as_str(), a.id.as_str()));
            }
        }
    }

    let signal_reach = cfg.max_distance * SIGNAL_DISTANCE_FACTOR;
    for a in &signal {
        for b in &signal {
            if a.id == b.id || connected.contains(&(a.id.as_str(), b.id.as_str())) {
                continue;
            }
            let distance = center_distance(&a.bbox, &b.bbox);
            if distance > signal_reach {
                continue;
            }
            let inference = infer_connection_type(a, b);
            if inference.confidence > SIGNAL_MIN_CONFIDENCE && inference.connection_type.is_signal() {
                let mut conn = inferred_connection(
                    format!("inferred-signal-{}-{}", a.id, b.id),
                    a,
                    b,
                    inference.connection_type,
                    inference.confidence * SIGNAL_CONFIDENCE_FACTOR,
                    format!("Signal-traced: {}", inference.reasoning),
                );
                conn.meta.distance = Some(distance);
                conn.meta.method = Some("signal_tracing".to_string());
                discovered.push(conn);
                connected.insert((a.id.as_str(), b.id.as_str()));
                connected.insert((b.id.as_str(), a.id.as_str()));
            }
        }
    }

    debug!(count = discovered.len(), "Traced connection paths");
    discovered
}

/// Report dangling endpoints, confident type mismatches and reversed
/// control signals. Nothing is removed.
#[must_use = "returns the validation issues"]
pub fn validate_connections(components: &[Component], connections: &[Connection]) -> Vec<ValidationIssue> {
    let by_id = index(components);
    let mut issues = Vec::new();
    let mut report = |conn: &Connection, issue: String, severity: IssueSeverity| {
        issues.push(ValidationIssue {
            connection_id: conn.id.clone(),
            issue,
            severity,
        });
    };

    for conn in connections {
        let Some(&from) = by_id.get(conn.from_id.as_str()) else {
            report(
                conn,
                format!("Source component not found: {}", conn.from_id),
                IssueSeverity::Error,
            );
            continue;
        };
        let Some(&to) = by_id.get(conn.to_id.as_str()) else {
            report(
                conn,
                format!("Target component not found: {}", conn.to_id),
                IssueSeverity::Error,
            );
            continue;
        };

        let inference = infer_connection_type(from, to);
        let expected = inference.connection_type.as_str();
        if conn.connection_type != expected && inference.confidence > MISMATCH_THRESHOLD {
            report(
                conn,
                format!(
                    "Connection type mismatch: expected {expected}, got {}",
                    conn.connection_type
                ),
                IssueSeverity::Warning,
            );
        }

        let touches_process = |c: &Component| {
            c.component_type.contains("pipe") || c.component_type.contains("valve")
        };
        if conn.connection_type == "chilled_water" && !touches_process(from) && !touches_process(to) {
            report(
                conn,
                "Chilled water connection between non-process components".to_string(),
                IssueSeverity::Warning,
            );
        }

        if conn.connection_type == ControlSignal.as_str()
            && from.component_type.contains("valve")
            && to.component_type.contains("sensor")
        {
            report(
                conn,
                "Control signal flowing from valve to sensor (likely reversed)".to_string(),
                IssueSeverity::Warning,
            );
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn comp(id: &str, ty: &str, label: &str, bbox: BBox) -> Component {
        Component::new(id, ty, label, bbox, 0.9)
    }

    fn far(id: &str, ty: &str, label: &str) -> Component {
        comp(id, ty, label, BBox::new(0.0, 0.0, 0.01, 0.01))
    }

    #[test]
    fn test_rule_table_and_wildcards() {
        let sensor = far("s", "sensor_temperature", "TT-101");
        let controller = far("c", "instrument_controller", "TIC-101");
        let inf = infer_connection_type(&sensor, &controller);
        assert_eq!(inf.connection_type, ElectricSignal);
        assert!((inf.confidence - 0.95).abs() < 1e-9);

        let pipe = far("p", "pipe", "");
        let valve = far("v", "valve_gate", "HV-1");
        assert_eq!(infer_connection_type(&pipe, &valve).connection_type, ProcessFlow);

        let level = far("l", "sensor_level", "LT-1");
        assert_eq!(infer_connection_type(&level, &pipe).connection_type, Measurement);
    }

    #[test]
    fn test_proximity_fallback() {
        let a = comp("a", "pipe", "PN-1", BBox::new(0.10, 0.10, 0.12, 0.12));
        let b = comp("b", "tank", "T-1", BBox::new(0.12, 0.10, 0.14, 0.12));
        let inf = infer_connection_type(&a, &b);
        assert_eq!(inf.connection_type, PneumaticSignal);
        assert!((inf.confidence - 0.78).abs() < 1e-9);

        let c = comp("c", "instrument_logic", "", BBox::new(0.10, 0.10, 0.12, 0.12));
        let d = comp("d", "tank", "", BBox::new(0.14, 0.10, 0.16, 0.12));
        // instrument sources resolve before the logic-specific check
        assert_eq!(infer_connection_type(&c, &d).connection_type, ElectricSignal);

        let e = comp("e", "tank", "", BBox::new(0.0, 0.0, 0.1, 0.1));
        let f = comp("f", "tank", "", BBox::new(0.8, 0.8, 0.9, 0.9));
        let inf = infer_connection_type(&e, &f);
        assert_eq!(inf.connection_type, ConnectionType::Unknown);
        assert!((inf.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_enhance_and_correct() {
        let comps = vec![
            far("s", "sensor_pressure", "PT-1"),
            far("c", "instrument_controller", "PIC-1"),
        ];
        let mut conns = vec![
            Connection::new("c1", "s", "c", ConnectionType::Supply, 0.6),
            Connection::new("c2", "s", "missing", ConnectionType::Supply, 0.6),
        ];
        assert_eq!(enhance_connections(&comps, &mut conns), 1);
        assert_eq!(conns[0].meta.inferred_type, Some(ElectricSignal));
        assert_eq!(conns[0].meta.to_label.as_deref(), Some("PIC-1"));
        assert!(conns[1].meta.inferred_type.is_none());

        assert_eq!(correct_connection_types(&comps, &mut conns), 1);
        assert_eq!(conns[0].connection_type, "electric_signal");
        assert_eq!(conns[0].meta.original_type.as_deref(), Some("supply"));
        assert_eq!(conns[0].meta.corrected, Some(true));
    }

    #[test]
    fn test_infer_missing_connections() {
        let comps = vec![
            far("s1", "sensor_temperature", "TT-101"),
            far("c1", "instrument_controller", "TIC-101"),
            far("v1", "valve_control", "TV-101"),
            far("s2", "sensor_temperature", "TT-202"),
        ];
        let existing = vec![Connection::new("e", "s1", "c1", ElectricSignal, 0.9)];
        let inferred = infer_missing_connections(&comps, &existing);
        assert_eq!(inferred.len(), 1);
        assert_eq!(inferred[0].id, "inferred-c1-v1");
        assert_eq!(inferred[0].connection_type, "control_signal");
        assert!(inferred[0].inferred);
        assert!((inferred[0].confidence - 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_loop_token() {
        assert_eq!(loop_token("TT-101"), "101");
        assert_eq!(loop_token("FV_7"), "7");
        assert_eq!(loop_token("PUMP"), "default");
    }

    #[test]
    fn test_trace_paths_claims_pairs_once() {
        let comps = vec![
            comp("p", "pipe", "", BBox::new(0.10, 0.10, 0.12, 0.12)),
            comp("v", "valve_gate", "", BBox::new(0.14, 0.10, 0.16, 0.12)),
            comp("far", "valve_gate", "", BBox::new(0.80, 0.80, 0.82, 0.82)),
        ];
        let traced = trace_connection_paths(&comps, &[], &PathTraceConfig::default());
        assert_eq!(traced.len(), 1);
        assert_eq!(traced[0].id, "inferred-path-p-v");
        assert!((traced[0].confidence - 0.85 * 0.85).abs() < 1e-9);
        assert_eq!(traced[0].meta.method.as_deref(), Some("path_tracing"));

        let existing = vec![Connection::new("x", "v", "p", ProcessFlow, 0.9)];
        assert!(trace_connection_paths(&comps, &existing, &PathTraceConfig::default()).is_empty());
    }

    #[test]
    fn test_trace_signal_paths() {
        let comps = vec![
            comp("s", "sensor_flow", "FT-1", BBox::new(0.10, 0.10, 0.12, 0.12)),
            comp("c", "instrument_controller", "FIC-1", BBox::new(0.15, 0.17, 0.17, 0.19)),
        ];
        let traced = trace_connection_paths(&comps, &[], &PathTraceConfig::default());
        assert_eq!(traced.len(), 1);
        assert_eq!(traced[0].id, "inferred-signal-s-c");
        assert!((traced[0].confidence - 0.95 * 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_validate_connections() {
        let comps = vec![
            far("v", "valve_control", "TV-1"),
            far("s", "sensor_temperature", "TT-1"),
            far("c", "instrument_controller", "TIC-1"),
        ];
        let conns = vec![
            Connection::new("dangling", "ghost", "s", ElectricSignal, 0.9),
            Connection::new("reversed", "v", "s", ControlSignal, 0.9),
            Connection::new("mismatch", "s", "c", ProcessFlow, 0.9),
        ];
        let issues = validate_connections(&comps, &conns);
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].severity, IssueSeverity::Error);
        assert!(issues[1].issue.contains("reversed"));
        assert!(issues[2].issue.contains("expected electric_signal"));
    }
}
