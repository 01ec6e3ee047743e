//! HVAC classification applied to every component at parse time.
//!
//! ## Overview
//!
//! [`enrich_component`] runs four steps in a fixed order:
//!
//! 1. Tag/shape conflict resolution: the drawn geometry overrides a type the
//!    model inferred from the tag alone (a plain circle tagged `PV-1` is a
//!    pressure indicator, not a valve).
//! 2. When no conflict applied, an ISA prefix table maps the tag to a type.
//! 3. Shape-based reasoning replaces generic reasoning text.
//! 4. Subsystem, category and detection quality metadata.
//!
//! The ISA function letters are not set here; the tag decoding pass owns
//! `isa_function` and skips components that already carry one.

use crate::model::{
    Component, ComponentCategory, DetectionQuality, HvacSubsystem, Shape,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Tag prefix → canonical type. The longest matching prefix wins.
const ISA_PREFIX_TYPES: &[(&str, &str)] = &[
    ("TT", "sensor_temperature"),
    ("TI", "sensor_temperature"),
    ("TE", "sensor_temperature"),
    ("TIC", "instrument_controller"),
    ("PT", "sensor_pressure"),
    ("PI", "sensor_pressure"),
    ("PE", "sensor_pressure"),
    ("PIC", "instrument_controller"),
    ("FT", "sensor_flow"),
    ("FI", "sensor_flow"),
    ("FE", "sensor_flow"),
    ("FIC", "instrument_controller"),
    ("LT", "sensor_level"),
    ("LI", "sensor_level"),
    ("LE", "sensor_level"),
    ("LIC", "instrument_controller"),
    ("FV", "valve_control"),
    ("TV", "valve_control"),
    ("PV", "valve_control"),
    ("LV", "valve_control"),
    ("HV", "valve_control"),
    ("CV", "valve_control"),
    ("SOV", "valve_solenoid"),
    ("BV", "valve_ball"),
    ("AHU", "air_handler"),
    ("FCU", "air_handler"),
    ("VAV", "air_handler"),
    ("PUMP", "pump"),
    ("CHILLER", "chiller"),
    ("CT", "cooling_tower"),
];

const GENERIC_REASONING: &str = "Identified based on standard ISA-5.1 symbology.";

static INDICATOR_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}I(-?\d+)?$").expect("Invalid indicator tag regex"));

static AIRSIDE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(VAV|AHU|FCU|RTU|MAU|DOAS|ERV|HRV)").expect("Invalid airside tag regex")
});

static CHILLED_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CHW|CHWS|CHWR|CHILLED").expect("Invalid chilled water regex"));

static HEATING_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"HW|HWS|HWR|HEAT|BOILER").expect("Invalid heating water regex"));

static CONDENSER_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CNDW|CW|CONDENSER").expect("Invalid condenser water regex"));

static REFRIGERATION_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"REF|REFRIG|EVAP|COMP").expect("Invalid refrigeration regex"));

/// Types that are controls regardless of tag.
const CONTROL_TYPES: &[&str] = &[
    "sensor_temperature",
    "sensor_pressure",
    "sensor_flow",
    "sensor_level",
    "instrument_controller",
    "instrument_indicator",
    "valve_control",
    "damper",
];

const REFRIGERATION_TYPES: &[&str] = &["compressor", "condenser", "evaporator", "expansion_valve"];

/// A type override decided from tag and geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCorrection {
    pub corrected_type: String,
    pub reasoning: String,
}

/// Tag text used for classification: `meta.tag`, else the label.
fn tag_of(comp: &Component) -> &str {
    comp.meta.tag.as_deref().unwrap_or(&comp.label)
}

/// Resolve conflicts between a tag-derived type and the drawn shape.
///
/// Returns `None` when the model's type is consistent with the geometry.
#[must_use = "returns the type correction, if any"]
pub fn resolve_type_conflict(
    tag: &str,
    shape: Option<Shape>,
    visual_signature: Option<&str>,
    model_type: &str,
) -> Option<TypeCorrection> {
    let tag = tag.to_uppercase();
    let sig = visual_signature.unwrap_or_default().to_lowercase();
    let ty = model_type.to_lowercase();
    let correction = |corrected: &str, reasoning: String| {
        Some(TypeCorrection {
            corrected_type: corrected.to_string(),
            reasoning,
        })
    };

    if shape == Some(Shape::Circle) {
        let ball = sig.contains("diagonal") || ty.contains("ball");
        let butterfly = sig.contains("bar") || ty.contains("butterfly");
        if !ball && !butterfly && ty.contains("valve") {
            let corrected = match tag.chars().next() {
                Some('P') => "sensor_pressure",
                Some('T') => "sensor_temperature",
                Some('F') => "sensor_flow",
                Some('L') => "sensor_level",
                _ => "instrument_indicator",
            };
            return correction(
                corrected,
                format!(
                    "Visual evidence (Circle shape) overrides tag inference. Reclassified from \
                     {model_type} to {corrected}. Circular symbols without an internal actuating \
                     line are instruments, not valves."
                ),
            );
        }

        let empty_circle =
            sig == "circle_empty" || (!sig.contains("diagonal") && !sig.contains("bar"));
        if tag.starts_with("PV") && empty_circle && ty.contains("valve") {
            return correction(
                "instrument_indicator",
                "Shape-based correction: a plain circle tagged PV is a pressure indicator, \
                 not a pressure valve."
                    .to_string(),
            );
        }

        if INDICATOR_TAG.is_match(&tag) && ty.contains("valve") {
            return correction(
                "instrument_indicator",
                format!(
                    "Tag ending with 'I' ({tag}) indicates an indicator instrument on a circular \
                     symbol. Reclassified from {model_type} to instrument_indicator."
                ),
            );
        }
    }

    if shape == Some(Shape::Bowtie) {
        match sig.as_str() {
            "bowtie_with_actuator" if ty.contains("gate") || ty.contains("globe") => {
                return correction(
                    "valve_control",
                    format!(
                        "Visual evidence (actuator on bowtie body) indicates automated control. \
                         Reclassified from {model_type} to valve_control."
                    ),
                );
            }
            "bowtie_empty" if ty.contains("control") => {
                return correction(
                    "valve_gate",
                    format!(
                        "Visual evidence (empty bowtie without actuator) indicates a manual \
                         isolation valve. Reclassified from {model_type} to valve_gate."
                    ),
                );
            }
            "bowtie_solid_center" if !ty.contains("globe") => {
                return correction(
                    "valve_globe",
                    format!(
                        "Visual evidence (bowtie with solid center) indicates globe valve \
                         geometry. Reclassified from {model_type} to valve_globe."
                    ),
                );
            }
            _ => {}
        }
    }

    None
}

/// Map a tag to a type through the ISA prefix table and equipment keywords.
#[must_use = "returns the type implied by the tag"]
pub fn type_from_tag_prefix(tag: &str) -> Option<&'static str> {
    let tag = tag.trim().to_uppercase();
    let by_prefix = ISA_PREFIX_TYPES
        .iter()
        .filter(|(prefix, _)| {
            tag.strip_prefix(prefix)
                .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_alphabetic()))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, ty)| *ty);

    if tag.contains("CHILLER") {
        Some("chiller")
    } else if tag.contains("PUMP") {
        Some("pump")
    } else if tag.contains("AHU") {
        Some("air_handler")
    } else {
        by_prefix
    }
}

/// Reasoning text derived from the drawn shape and the final type.
#[must_use = "returns the generated reasoning"]
pub fn shape_reasoning(shape: Shape, component_type: &str) -> String {
    let base = match shape {
        Shape::Circle => "Detected circular shape, indicating an instrument or sensor per ISA-5.1",
        Shape::Bowtie => "Detected bowtie (two triangles) shape, indicating a valve body per ISA-5.1",
        Shape::Diamond => {
            "Detected diamond shape, indicating logic/PLC function or control element per ISA-5.1"
        }
        Shape::Triangle => {
            "Detected triangular shape, indicating a control valve or check valve per ISA-5.1"
        }
        Shape::Square => {
            "Detected square shape, indicating a panel instrument or equipment per ISA-5.1"
        }
        Shape::Rectangle => {
            "Detected rectangular shape, indicating equipment or gate valve per ISA-5.1"
        }
        Shape::Hexagon => "Detected hexagonal shape, indicating computer function per ISA-5.1",
        Shape::Cloud | Shape::Line | Shape::ComplexAssembly => {
            return format!(
                "Classified as {component_type} based on symbol geometry and ISA-5.1 standards."
            )
        }
    };

    let ty = component_type.to_lowercase();
    let suffix = if ty.contains("valve") {
        match shape {
            Shape::Circle if ty.contains("ball") || ty.contains("butterfly") => {
                ". Ball and butterfly valves use circular bodies with internal actuating elements."
            }
            Shape::Bowtie | Shape::Triangle => ". Valve body identified with appropriate actuator symbol.",
            _ => "",
        }
    } else if ty.contains("sensor") || ty.contains("transmitter") || ty.contains("indicator") {
        if shape == Shape::Circle {
            ". Circular symbols are standard for field-mounted instrumentation."
        } else {
            ""
        }
    } else if ty.contains("controller") {
        ". Controller identified with appropriate ISA function code."
    } else {
        ""
    };
    format!("{base}{suffix}")
}

fn is_generic_reasoning(text: &str) -> bool {
    if text.contains("Visual evidence") || text.contains("Shape-based correction") {
        return false;
    }
    let lower = text.to_lowercase();
    text == GENERIC_REASONING
        || lower.contains("diamond shape")
        || lower.contains("diamond-shaped")
}

#[must_use = "returns the HVAC subsystem"]
pub fn determine_subsystem(tag: &str, component_type: &str) -> HvacSubsystem {
    let tag = tag.to_uppercase();
    let ty = component_type.to_lowercase();

    if AIRSIDE_TAG.is_match(&tag) {
        HvacSubsystem::AirHandling
    } else if CHILLED_TAG.is_match(&tag) || ty == "chiller" || ty == "cooling_tower" {
        HvacSubsystem::ChilledWater
    } else if HEATING_TAG.is_match(&tag) && !tag.contains("CHW") {
        HvacSubsystem::HeatingWater
    } else if CONDENSER_TAG.is_match(&tag) {
        HvacSubsystem::CondenserWater
    } else if REFRIGERATION_TAG.is_match(&tag) || REFRIGERATION_TYPES.contains(&ty.as_str()) {
        HvacSubsystem::Refrigeration
    } else if CONTROL_TYPES.contains(&ty.as_str()) {
        HvacSubsystem::Controls
    } else {
        HvacSubsystem::Other
    }
}

#[must_use = "returns the component category"]
pub fn determine_category(subsystem: HvacSubsystem, component_type: &str) -> ComponentCategory {
    let ty = component_type.to_lowercase();
    match subsystem {
        HvacSubsystem::ChilledWater | HvacSubsystem::CondenserWater | HvacSubsystem::HeatingWater => {
            ComponentCategory::Hydronic
        }
        HvacSubsystem::AirHandling => ComponentCategory::Airside,
        HvacSubsystem::Refrigeration => ComponentCategory::Refrigeration,
        HvacSubsystem::Controls => ComponentCategory::Controls,
        HvacSubsystem::Other => {
            if ["sensor", "controller", "valve", "damper"]
                .iter()
                .any(|k| ty.contains(k))
            {
                ComponentCategory::Controls
            } else if ["pump", "chiller", "fan", "handler"]
                .iter()
                .any(|k| ty.contains(k))
            {
                ComponentCategory::Equipment
            } else {
                ComponentCategory::Other
            }
        }
    }
}

/// Apply HVAC classification to one freshly parsed component.
pub fn enrich_component(comp: &mut Component) {
    let tag = tag_of(comp).to_string();
    let conflict = resolve_type_conflict(
        &tag,
        comp.shape,
        comp.meta.visual_signature.as_deref(),
        &comp.component_type,
    );

    match conflict {
        Some(fix) => {
            comp.meta.original_type.get_or_insert_with(|| comp.component_type.clone());
            comp.component_type = fix.corrected_type;
            comp.meta.reasoning = Some(fix.reasoning);
        }
        None => {
            if let Some(ty) = type_from_tag_prefix(&tag) {
                comp.component_type = ty.to_string();
            }
            match (comp.meta.reasoning.as_deref(), comp.shape) {
                (Some(existing), shape) if is_generic_reasoning(existing) => {
                    comp.meta.reasoning = Some(shape.map_or_else(
                        || {
                            format!(
                                "Classified as {} based on ISA-5.1 symbol recognition.",
                                comp.component_type
                            )
                        },
                        |s| shape_reasoning(s, &comp.component_type),
                    ));
                }
                (None, Some(shape)) => {
                    comp.meta.reasoning = Some(shape_reasoning(shape, &comp.component_type));
                }
                _ => {}
            }
        }
    }

    let subsystem = comp
        .meta
        .hvac_subsystem
        .unwrap_or_else(|| determine_subsystem(&tag, &comp.component_type));
    comp.meta.hvac_subsystem = Some(subsystem);
    comp.meta.component_category = Some(determine_category(subsystem, &comp.component_type));
    comp.meta.detection_quality = Some(DetectionQuality::from_confidence(comp.confidence));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn comp(ty: &str, label: &str, shape: Option<Shape>) -> Component {
        let mut c = Component::new("c1", ty, label, BBox::new(0.1, 0.1, 0.2, 0.2), 0.92);
        c.shape = shape;
        c
    }

    #[test]
    fn test_circle_valve_becomes_sensor_by_tag_letter() {
        let fix = resolve_type_conflict("TV-101", Some(Shape::Circle), None, "valve_gate").unwrap();
        assert_eq!(fix.corrected_type, "sensor_temperature");
        assert!(fix.reasoning.starts_with("Visual evidence"));
        let fix = resolve_type_conflict("XV-1", Some(Shape::Circle), None, "valve_globe").unwrap();
        assert_eq!(fix.corrected_type, "instrument_indicator");
    }

    #[test]
    fn test_circle_ball_valve_is_allowed() {
        assert!(resolve_type_conflict("BV-1", Some(Shape::Circle), Some("circle_diagonal"), "valve_gate").is_none());
        assert!(resolve_type_conflict("BV-1", Some(Shape::Circle), None, "valve_ball").is_none());
    }

    #[test]
    fn test_bowtie_signatures() {
        let fix = resolve_type_conflict("HV-1", Some(Shape::Bowtie), Some("bowtie_with_actuator"), "valve_gate").unwrap();
        assert_eq!(fix.corrected_type, "valve_control");
        let fix = resolve_type_conflict("FV-1", Some(Shape::Bowtie), Some("bowtie_empty"), "valve_control").unwrap();
        assert_eq!(fix.corrected_type, "valve_gate");
        let fix = resolve_type_conflict("V-1", Some(Shape::Bowtie), Some("bowtie_solid_center"), "valve_gate").unwrap();
        assert_eq!(fix.corrected_type, "valve_globe");
        assert!(resolve_type_conflict("V-1", Some(Shape::Bowtie), Some("bowtie_solid_center"), "valve_globe").is_none());
    }

    #[test]
    fn test_prefix_table_longest_match() {
        assert_eq!(type_from_tag_prefix("TIC-101"), Some("instrument_controller"));
        assert_eq!(type_from_tag_prefix("TT-101"), Some("sensor_temperature"));
        assert_eq!(type_from_tag_prefix("sov-3"), Some("valve_solenoid"));
        assert_eq!(type_from_tag_prefix("AHU-1"), Some("air_handler"));
        assert_eq!(type_from_tag_prefix("CHWP-PUMP-2"), Some("pump"));
        assert_eq!(type_from_tag_prefix("PIPE"), None);
        assert_eq!(type_from_tag_prefix("unknown"), None);
    }

    #[test]
    fn test_enrich_applies_prefix_without_conflict() {
        let mut c = comp("unknown", "FIC-201", None);
        enrich_component(&mut c);
        assert_eq!(c.component_type, "instrument_controller");
        assert_eq!(c.meta.hvac_subsystem, Some(HvacSubsystem::Controls));
        assert_eq!(c.meta.component_category, Some(ComponentCategory::Controls));
        assert_eq!(c.meta.detection_quality, Some(DetectionQuality::Excellent));
        assert!(c.meta.isa_function.is_none());
    }

    #[test]
    fn test_enrich_conflict_skips_prefix_table() {
        // PV prefix maps to valve_control, but the circle wins
        let mut c = comp("valve_control", "PV-7", Some(Shape::Circle));
        enrich_component(&mut c);
        assert_eq!(c.component_type, "sensor_pressure");
        assert_eq!(c.meta.original_type.as_deref(), Some("valve_control"));
        assert!(c.meta.reasoning.as_deref().unwrap().contains("Circle shape"));
    }

    #[test]
    fn test_generic_reasoning_replaced() {
        let mut c = comp("instrument_controller", "controller", Some(Shape::Circle));
        c.meta.reasoning = Some(GENERIC_REASONING.to_string());
        enrich_component(&mut c);
        let reasoning = c.meta.reasoning.unwrap();
        assert!(reasoning.starts_with("Detected circular shape"));
        assert!(reasoning.ends_with("appropriate ISA function code."));

        let mut kept = comp("pump", "P-1", None);
        kept.meta.reasoning = Some("Impeller housing visible".to_string());
        enrich_component(&mut kept);
        assert_eq!(kept.meta.reasoning.as_deref(), Some("Impeller housing visible"));
    }

    #[test]
    fn test_subsystems() {
        assert_eq!(determine_subsystem("VAV-2-01", "vav_box"), HvacSubsystem::AirHandling);
        assert_eq!(determine_subsystem("CHWS-1", "pipe"), HvacSubsystem::ChilledWater);
        assert_eq!(determine_subsystem("HWR-3", "pipe"), HvacSubsystem::HeatingWater);
        assert_eq!(determine_subsystem("CW-1", "pipe"), HvacSubsystem::CondenserWater);
        assert_eq!(determine_subsystem("X", "compressor"), HvacSubsystem::Refrigeration);
        assert_eq!(determine_subsystem("X", "damper"), HvacSubsystem::Controls);
        assert_eq!(determine_subsystem("X", "duct"), HvacSubsystem::Other);
    }

    #[test]
    fn test_categories() {
        assert_eq!(determine_category(HvacSubsystem::HeatingWater, "pump"), ComponentCategory::Hydronic);
        assert_eq!(determine_category(HvacSubsystem::Other, "fan_exhaust"), ComponentCategory::Equipment);
        assert_eq!(determine_category(HvacSubsystem::Other, "valve_gate"), ComponentCategory::Controls);
        assert_eq!(determine_category(HvacSubsystem::Other, "duct"), ComponentCategory::Other);
    }
}
