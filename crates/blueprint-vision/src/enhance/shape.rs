//! Shape/type consistency enforcement.
//!
//! ## Overview
//!
//! ISA-5.1 ties symbol geometry to component families: circles are
//! instruments (or ball/butterfly valves), bowties are valve bodies,
//! diamonds are logic. A model that reads the tag but ignores the geometry
//! will call a `PV-101` bubble a pressure valve. This pass trusts the shape.
//!
//! For each component with an explicit shape:
//! 1. Tag/shape conflict rules run first.
//! 2. Otherwise a type forbidden for the shape is corrected.
//! 3. Otherwise the result records whether the type is explicitly allowed.
//!
//! Components are never dropped. Only the explicit `shape` field is
//! validated; a shape inferred during normalization is advisory.

use crate::model::{Component, Shape, ShapeValidation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Allowed and forbidden type fragments for one shape.
#[derive(Debug, Clone, Copy)]
pub struct ShapeRule {
    pub allowed: &'static [&'static str],
    pub forbidden: &'static [&'static str],
    pub reasoning: &'static str,
}

/// Static rule table, matched by substring on the lowercase type.
#[must_use = "returns the rule for the shape"]
pub const fn rule_for(shape: Shape) -> ShapeRule {
    match shape {
        Shape::Circle => ShapeRule {
            allowed: &[
                "instrument",
                "sensor",
                "sensor_temperature",
                "sensor_pressure",
                "sensor_flow",
                "sensor_level",
                "instrument_indicator",
                "instrument_transmitter",
                "instrument_controller",
                "valve_ball",
                "valve_butterfly",
                "analyzer",
                "gauge",
            ],
            forbidden: &[
                "valve_gate",
                "valve_globe",
                "valve_control",
                "valve_check",
                "valve_plug",
                "valve_needle",
            ],
            reasoning: "Circle shapes represent instruments, sensors, or rotary valves (ball/butterfly) per ISA-5.1",
        },
        Shape::Bowtie => ShapeRule {
            allowed: &[
                "valve_control",
                "valve_gate",
                "valve_globe",
                "valve_ball",
                "valve_butterfly",
                "valve_plug",
                "valve",
                "actuator",
            ],
            forbidden: &[
                "instrument",
                "sensor",
                "sensor_temperature",
                "sensor_pressure",
                "sensor_flow",
            ],
            reasoning: "Bowtie shapes represent valve bodies per ISA-5.1",
        },
        Shape::Diamond => ShapeRule {
            allowed: &["logic", "plc", "instrument_logic", "interlock", "valve_control", "sequencer"],
            forbidden: &["sensor", "instrument_indicator", "instrument_transmitter"],
            reasoning: "Diamond shapes represent logic/PLC functions or control valves with logic per ISA-5.1",
        },
        Shape::Triangle => ShapeRule {
            allowed: &["valve_control", "valve_check", "actuator", "valve"],
            forbidden: &["instrument", "sensor", "logic", "plc"],
            reasoning: "Triangle shapes represent control valve bodies or check valves per ISA-5.1",
        },
        Shape::Square => ShapeRule {
            allowed: &[
                "panel_instrument",
                "shared_display",
                "hmi",
                "dcs",
                "scada",
                "equipment",
                "damper",
                "actuator",
            ],
            forbidden: &[],
            reasoning: "Square shapes represent panel instruments or equipment per ISA-5.1",
        },
        Shape::Rectangle => ShapeRule {
            allowed: &[
                "valve_gate",
                "equipment",
                "ahu",
                "pump",
                "heat_exchanger",
                "tank",
                "vessel",
                "orifice_plate",
                "strainer",
                "filter",
            ],
            forbidden: &[],
            reasoning: "Rectangle shapes represent gate valves or equipment outlines per ISA-5.1",
        },
        Shape::Hexagon => ShapeRule {
            allowed: &["computer", "data_logger", "historian", "server", "processor"],
            forbidden: &["valve", "instrument", "sensor"],
            reasoning: "Hexagon shapes represent computer functions per ISA-5.1",
        },
        Shape::Cloud => ShapeRule {
            allowed: &["annotation", "note", "label", "text"],
            forbidden: &["valve", "instrument", "sensor", "equipment"],
            reasoning: "Cloud shapes represent annotations or notes",
        },
        Shape::Line => ShapeRule {
            allowed: &["pipe", "duct", "connection", "signal_line", "process_line"],
            forbidden: &["valve", "instrument", "sensor", "equipment"],
            reasoning: "Line shapes represent connections, not components",
        },
        Shape::ComplexAssembly => ShapeRule {
            allowed: &[
                "equipment",
                "ahu",
                "chiller",
                "cooling_tower",
                "pump_assembly",
                "valve_assembly",
            ],
            forbidden: &[],
            reasoning: "Complex assemblies represent multi-part equipment",
        },
    }
}

static PV_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PV[-\s]?\d+").expect("Invalid PV tag regex"));

static INDICATOR_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}I[-\s]?\d+").expect("Invalid indicator tag regex"));

static RV_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^RV[-\s]?\d+").expect("Invalid RV tag regex"));

const VALVE_TYPES: &[&str] = &[
    "valve",
    "valve_control",
    "valve_gate",
    "valve_globe",
    "valve_check",
    "valve_ball",
    "valve_butterfly",
    "valve_plug",
    "valve_needle",
    "valve_diaphragm",
    "valve_relief",
    "valve_solenoid",
];

const INSTRUMENT_TYPES: &[&str] = &[
    "instrument",
    "sensor",
    "transmitter",
    "indicator",
    "controller",
    "analyzer",
    "gauge",
];

#[must_use = "returns whether the type is a valve"]
pub fn is_valve_type(component_type: &str) -> bool {
    let t = component_type.to_lowercase();
    VALVE_TYPES.iter().any(|v| t.contains(v))
}

#[must_use = "returns whether the type is an instrument"]
pub fn is_instrument_type(component_type: &str) -> bool {
    let t = component_type.to_lowercase();
    INSTRUMENT_TYPES.iter().any(|v| t.contains(v))
}

fn measured_variable_name(letter: Option<char>) -> &'static str {
    match letter {
        Some('P') => "Pressure",
        Some('T') => "Temperature",
        Some('F') => "Flow",
        Some('L') => "Level",
        Some('H') => "Humidity",
        Some('A') => "Analysis",
        _ => "Unknown",
    }
}

/// Tag/shape conflict rules. Returns `(corrected_type, reason)`.
#[must_use = "returns the conflict resolution, if any"]
pub fn resolve_tag_shape_conflict(comp: &Component, shape: Shape) -> Option<(String, String)> {
    let label = comp.label.to_uppercase();
    let ty = comp.component_type.to_lowercase();

    if shape == Shape::Circle && PV_TAG.is_match(&label) && is_valve_type(&ty) {
        return Some((
            "instrument_indicator".to_string(),
            "HVAC Rule: PV tag on circle shape indicates Pressure Indicator/View, not Pressure Valve"
                .to_string(),
        ));
    }

    if shape == Shape::Circle && INDICATOR_TAG.is_match(&label) && is_valve_type(&ty) {
        let variable = measured_variable_name(label.chars().next());
        return Some((
            "instrument_indicator".to_string(),
            format!(
                "ISA Rule: {label} = {variable} Indicator (circles with \"I\" suffix are indicators, never valves)"
            ),
        ));
    }

    if shape == Shape::Circle && RV_TAG.is_match(&label) && ty.contains("relief") {
        return Some((
            "sensor_radiation".to_string(),
            "Shape Rule: RV on circle likely indicates Radiation sensor (relief valves use bowtie/triangle with spring)"
                .to_string(),
        ));
    }

    if shape == Shape::Bowtie && ty.contains("control") {
        let has_actuator = comp
            .meta
            .visual_signature
            .as_deref()
            .is_some_and(|s| s.contains("actuator"))
            || comp
                .meta
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains("actuator"));
        if !has_actuator {
            return Some((
                "valve_gate".to_string(),
                "Shape Rule: Bowtie without actuator is Gate valve (control valves require actuator symbol)"
                    .to_string(),
            ));
        }
    }

    let linear_valve = ty.contains("gate")
        || ty.contains("globe")
        || (ty.contains("control") && !ty.contains("controller"));
    if shape == Shape::Circle && linear_valve {
        let visual = comp.meta.visual_signature.as_deref().unwrap_or_default();
        let (corrected, reason) = if visual.contains("diagonal") {
            ("valve_ball", "Shape Rule: Circle with diagonal line = Ball valve")
        } else if visual.contains("bar") {
            ("valve_butterfly", "Shape Rule: Circle with bar = Butterfly valve")
        } else {
            (
                "instrument_indicator",
                "Shape Rule: Circle without internal actuating element = Instrument (never gate/globe/control valve)",
            )
        };
        return Some((corrected.to_string(), reason.to_string()));
    }

    None
}

/// Correction for a type the shape forbids.
fn forbidden_correction(shape: Shape, component_type: &str, rule: &ShapeRule) -> (String, String) {
    let ty = component_type.to_lowercase();
    if shape == Shape::Circle && is_valve_type(&ty) && !ty.contains("ball") && !ty.contains("butterfly") {
        return (
            "instrument".to_string(),
            format!(
                "Corrected from {component_type} to instrument: Circles represent instruments per ISA-5.1, not valves"
            ),
        );
    }
    let corrected = if matches!(shape, Shape::Bowtie | Shape::Triangle) && is_instrument_type(&ty) {
        "valve_control"
    } else if shape == Shape::Diamond && is_instrument_type(&ty) && !ty.contains("logic") {
        "instrument_logic"
    } else {
        rule.allowed.first().copied().unwrap_or("unknown")
    };
    (
        corrected.to_string(),
        format!("Corrected from {component_type} to {corrected}: Shape-type mismatch per ISA-5.1"),
    )
}

fn raw_shape_name(comp: &Component, shape: Shape) -> String {
    comp.meta
        .extra
        .get("raw_shape")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| shape.as_str().to_string(), str::to_string)
}

/// Validate one component in place. Returns true when its type changed.
pub fn validate_component_shape(comp: &mut Component) -> bool {
    let Some(shape) = comp.shape else {
        comp.meta.shape_validation = Some(ShapeValidation {
            validated: false,
            reasoning: "No shape information available".to_string(),
            ..ShapeValidation::default()
        });
        return false;
    };
    let rule = rule_for(shape);

    if let Some((corrected, reason)) = resolve_tag_shape_conflict(comp, shape) {
        debug!(id = %comp.id, %reason, "Tag/shape conflict resolved");
        apply_correction(comp, shape, corrected, &reason, format!("Tag-Shape Conflict Resolution: {reason}"));
        return true;
    }

    let ty = comp.component_type.to_lowercase();
    if rule.forbidden.iter().any(|f| ty.contains(f)) {
        let (corrected, reason) = forbidden_correction(shape, &comp.component_type, &rule);
        warn!(id = %comp.id, from = %comp.component_type, to = %corrected, %shape, "Shape/type violation corrected");
        apply_correction(comp, shape, corrected, &reason, rule.reasoning.to_string());
        return true;
    }

    comp.meta.shape_validation = Some(ShapeValidation {
        validated: true,
        corrected: false,
        normalized_shape: Some(shape),
        is_allowed: Some(rule.allowed.iter().any(|a| ty.contains(a))),
        reasoning: rule.reasoning.to_string(),
        ..ShapeValidation::default()
    });
    false
}

fn apply_correction(comp: &mut Component, shape: Shape, corrected: String, reason: &str, reasoning: String) {
    comp.meta
        .original_type
        .get_or_insert_with(|| comp.component_type.clone());
    comp.meta.shape_validation = Some(ShapeValidation {
        validated: true,
        corrected: true,
        original_shape: Some(raw_shape_name(comp, shape)),
        normalized_shape: Some(shape),
        correction_reason: Some(reason.to_string()),
        is_allowed: None,
        reasoning,
    });
    comp.component_type = corrected;
}

/// One corrected component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeViolation {
    pub id: String,
    pub original_type: String,
    pub corrected_type: String,
    pub shape: Shape,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeStats {
    pub total: usize,
    pub validated: usize,
    pub corrected: usize,
    pub violations: Vec<ShapeViolation>,
}

/// Validate every component, collecting statistics.
pub fn validate_component_shapes(components: &mut [Component]) -> ShapeStats {
    let mut stats = ShapeStats {
        total: components.len(),
        ..ShapeStats::default()
    };
    for comp in components.iter_mut() {
        let original_type = comp.component_type.clone();
        let changed = validate_component_shape(comp);
        let Some(validation) = &comp.meta.shape_validation else {
            continue;
        };
        if validation.validated {
            stats.validated += 1;
        }
        if changed {
            stats.violations.push(ShapeViolation {
                id: comp.id.clone(),
                original_type,
                corrected_type: comp.component_type.clone(),
                shape: validation.normalized_shape.unwrap_or(Shape::Circle),
                reason: validation.correction_reason.clone().unwrap_or_default(),
            });
        }
    }
    stats.corrected = stats.violations.len();
    info!(
        total = stats.total,
        validated = stats.validated,
        corrected = stats.corrected,
        "Shape validation complete"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn shaped(ty: &str, label: &str, shape: Option<Shape>) -> Component {
        let mut c = Component::new("c1", ty, label, BBox::new(0.1, 0.1, 0.2, 0.2), 0.8);
        c.shape = shape;
        c
    }

    #[test]
    fn test_pv_circle_is_indicator() {
        let mut c = shaped("valve_control", "PV-101", Some(Shape::Circle));
        assert!(validate_component_shape(&mut c));
        assert_eq!(c.component_type, "instrument_indicator");
        assert_eq!(c.meta.original_type.as_deref(), Some("valve_control"));
        let v = c.meta.shape_validation.unwrap();
        assert!(v.validated && v.corrected);
        assert!(v.reasoning.starts_with("Tag-Shape Conflict Resolution"));
    }

    #[test]
    fn test_indicator_tag_reason_names_variable() {
        let mut c = shaped("valve_gate", "TI-7", Some(Shape::Circle));
        validate_component_shape(&mut c);
        let reason = c.meta.shape_validation.unwrap().correction_reason.unwrap();
        assert!(reason.contains("Temperature Indicator"));
    }

    #[test]
    fn test_rv_circle_relief_is_radiation_sensor() {
        let mut c = shaped("valve_relief", "RV-3", Some(Shape::Circle));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "sensor_radiation");
    }

    #[test]
    fn test_bowtie_control_without_actuator() {
        let mut c = shaped("valve_control", "FV-1", Some(Shape::Bowtie));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "valve_gate");

        let mut with_actuator = shaped("valve_control", "FV-1", Some(Shape::Bowtie));
        with_actuator.meta.visual_signature = Some("bowtie_with_actuator".to_string());
        assert!(!validate_component_shape(&mut with_actuator));
        assert_eq!(with_actuator.component_type, "valve_control");
        assert_eq!(with_actuator.meta.shape_validation.unwrap().is_allowed, Some(true));
    }

    #[test]
    fn test_circle_linear_valves_always_corrected() {
        for (ty, sig, expected) in [
            ("valve_gate", None, "instrument_indicator"),
            ("valve_globe", Some("circle_diagonal"), "valve_ball"),
            ("valve_control", Some("circle_bar"), "valve_butterfly"),
        ] {
            let mut c = shaped(ty, "X-1", Some(Shape::Circle));
            c.meta.visual_signature = sig.map(str::to_string);
            assert!(validate_component_shape(&mut c));
            assert_eq!(c.component_type, expected);
        }
    }

    #[test]
    fn test_forbidden_corrections() {
        let mut c = shaped("valve_check", "X-1", Some(Shape::Circle));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "instrument");

        let mut c = shaped("sensor_pressure", "X-1", Some(Shape::Triangle));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "valve_control");

        let mut c = shaped("instrument_indicator", "X-1", Some(Shape::Diamond));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "instrument_logic");

        let mut c = shaped("valve_gate", "X-1", Some(Shape::Hexagon));
        validate_component_shape(&mut c);
        assert_eq!(c.component_type, "computer");
    }

    #[test]
    fn test_no_shape_and_stats() {
        let mut comps = vec![
            shaped("pump", "P-1", None),
            shaped("pump", "P-2", Some(Shape::Rectangle)),
            shaped("valve_gate", "HV-1", Some(Shape::Circle)),
        ];
        let stats = validate_component_shapes(&mut comps);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.validated, 2);
        assert_eq!(stats.corrected, 1);
        assert_eq!(stats.violations[0].original_type, "valve_gate");
        assert_eq!(comps.len(), 3);
        let none = comps[0].meta.shape_validation.as_ref().unwrap();
        assert!(!none.validated);
        assert_eq!(none.reasoning, "No shape information available");
    }
}
