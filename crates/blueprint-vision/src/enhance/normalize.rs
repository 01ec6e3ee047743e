//! Type and connection vocabulary normalization.
//!
//! Component types that already look canonical (`^[a-z_]+$`) pass through.
//! Anything else is looked up exactly, then by substring in table order, and
//! left unchanged when nothing matches. Connection types fall back to
//! `unknown` instead, since the connection vocabulary is closed.

use crate::model::{Component, Connection, ConnectionType, Shape};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Loose component phrasing → canonical type. Order matters for the
/// substring fallback.
const COMPONENT_TYPE_MAP: &[(&str, &str)] = &[
    ("control valve", "valve_control"),
    ("gate valve", "valve_gate"),
    ("globe valve", "valve_globe"),
    ("ball valve", "valve_ball"),
    ("butterfly valve", "valve_butterfly"),
    ("check valve", "valve_check"),
    ("relief valve", "valve_relief"),
    ("solenoid valve", "valve_solenoid"),
    ("needle valve", "valve_needle"),
    ("plug valve", "valve_plug"),
    ("temperature sensor", "sensor_temperature"),
    ("pressure sensor", "sensor_pressure"),
    ("flow sensor", "sensor_flow"),
    ("level sensor", "sensor_level"),
    ("temperature indicator", "instrument_indicator"),
    ("pressure indicator", "instrument_indicator"),
    ("temperature transmitter", "instrument_transmitter"),
    ("pressure transmitter", "instrument_transmitter"),
    ("flow transmitter", "instrument_transmitter"),
    ("pid controller", "instrument_controller"),
    ("logic controller", "instrument_logic"),
    ("controller", "instrument_controller"),
    ("air handling unit", "ahu"),
    ("air handler", "ahu"),
    ("fan coil unit", "fan_coil_unit"),
    ("fan coil", "fan_coil_unit"),
    ("vav box", "vav"),
    ("variable air volume", "vav"),
    ("heat exchanger", "heat_exchanger"),
    ("cooling tower", "cooling_tower"),
    ("annotation", "text_label"),
    ("label", "text_label"),
    ("text", "text_label"),
];

/// Loose connection phrasing → canonical type.
const CONNECTION_TYPE_MAP: &[(&str, ConnectionType)] = &[
    ("process line", ConnectionType::Process),
    ("process_line", ConnectionType::Process),
    ("process flow", ConnectionType::ProcessFlow),
    ("processflow", ConnectionType::ProcessFlow),
    ("piping", ConnectionType::Process),
    ("pipe", ConnectionType::Process),
    ("water", ConnectionType::Process),
    ("steam", ConnectionType::Process),
    ("refrigerant", ConnectionType::Process),
    ("chilled water", ConnectionType::Supply),
    ("chilled_water", ConnectionType::Supply),
    ("condenser water", ConnectionType::Return),
    ("condenser_water", ConnectionType::Return),
    ("electrical signal", ConnectionType::ElectricSignal),
    ("electrical", ConnectionType::Electric),
    ("electric line", ConnectionType::Electric),
    ("power", ConnectionType::Electric),
    ("wiring", ConnectionType::Electric),
    ("cable", ConnectionType::Electric),
    ("compressed air", ConnectionType::Pneumatic),
    ("pneumatic signal", ConnectionType::PneumaticSignal),
    ("pneumatic line", ConnectionType::Pneumatic),
    ("control line", ConnectionType::ControlSignal),
    ("control", ConnectionType::ControlSignal),
    ("instrument signal", ConnectionType::Signal),
    ("instrument", ConnectionType::Signal),
    ("4-20ma", ConnectionType::ElectricSignal),
    ("analog", ConnectionType::ElectricSignal),
    ("digital", ConnectionType::ElectricSignal),
    ("hydraulic line", ConnectionType::Hydraulic),
    ("hydraulic signal", ConnectionType::Hydraulic),
    ("oil", ConnectionType::Hydraulic),
    ("supply air", ConnectionType::Supply),
    ("supply_air", ConnectionType::Supply),
    ("return air", ConnectionType::Return),
    ("return_air", ConnectionType::Return),
    ("exhaust", ConnectionType::Return),
    ("air", ConnectionType::Pneumatic),
];

/// Tag pattern → canonical type, most specific first.
static TAG_TYPE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^\d*[TPFL]IC", "instrument_controller"),
        (r"^\d*LIT", "instrument_transmitter"),
        (r"^\d*TT", "sensor_temperature"),
        (r"^\d*PT", "sensor_pressure"),
        (r"^\d*FT", "sensor_flow"),
        (r"^\d*LT", "sensor_level"),
        (r"^\d*LG", "instrument_gauge"),
        (r"^\d*[TPFL]I", "instrument_indicator"),
        (r"^\d*CV", "valve_control"),
        (r"^\d*[FPT]V", "valve_control"),
        (r"^\d*[A-Z]{0,2}V-", "valve_gate"),
    ]
    .into_iter()
    .map(|(p, ty)| (Regex::new(p).expect("Invalid tag type regex"), ty))
    .collect()
});

static CANONICAL_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_]+$").expect("Invalid canonical type regex"));

static TAG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s_.]+").expect("Invalid tag separator regex"));

const INSTRUMENT_TAG_PREFIXES: &[&str] = &[
    "TIC", "PIC", "FIC", "LIC", "LIT", "TI", "TT", "PI", "PT", "FI", "FT", "LI", "LT", "LG",
];

/// Map a loose component type to the canonical vocabulary.
#[must_use = "returns the normalized type"]
pub fn normalize_component_type(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return "unknown".to_string();
    }
    if let Some((_, ty)) = COMPONENT_TYPE_MAP.iter().find(|(k, _)| *k == lower) {
        return (*ty).to_string();
    }
    COMPONENT_TYPE_MAP
        .iter()
        .find(|(k, _)| lower.contains(k))
        .map_or_else(|| raw.to_string(), |(_, ty)| (*ty).to_string())
}

/// Map a loose connection type to the closed connection vocabulary.
#[must_use = "returns the normalized connection type"]
pub fn normalize_connection_type(raw: &str) -> ConnectionType {
    let lower = raw.trim().to_lowercase();
    if let Ok(valid) = lower.parse::<ConnectionType>() {
        return valid;
    }
    if let Some((_, ty)) = CONNECTION_TYPE_MAP.iter().find(|(k, _)| *k == lower) {
        return *ty;
    }
    CONNECTION_TYPE_MAP
        .iter()
        .find(|(k, _)| lower.contains(k))
        .map_or_else(
            || {
                warn!(raw, "Unknown connection type, defaulting to unknown");
                ConnectionType::Unknown
            },
            |(_, ty)| *ty,
        )
}

/// Infer a component type from an ISA-style tag such as `1LIT-12422A`.
#[must_use = "returns the type implied by the tag"]
pub fn infer_type_from_tag(tag: &str) -> Option<&'static str> {
    let tag = TAG_SEPARATORS.replace_all(tag.trim(), "-").to_uppercase();
    if tag.is_empty() {
        return None;
    }
    TAG_TYPE_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&tag))
        .map(|(_, ty)| *ty)
}

/// Guess a missing shape from reasoning text, tag prefix and type keywords.
#[must_use = "returns the inferred shape"]
pub fn infer_shape(comp: &Component) -> Option<Shape> {
    let reasoning = comp.meta.reasoning.as_deref().unwrap_or_default().to_lowercase();
    if reasoning.contains("circle") || reasoning.contains("circular") {
        return Some(Shape::Circle);
    }
    if reasoning.contains("bowtie") || reasoning.contains("bow-tie") {
        return Some(Shape::Bowtie);
    }
    if reasoning.contains("diamond") {
        return Some(Shape::Diamond);
    }

    let label = comp.label.trim().to_uppercase();
    let unprefixed = label.trim_start_matches(|c: char| c.is_ascii_digit());
    if INSTRUMENT_TAG_PREFIXES.iter().any(|p| unprefixed.starts_with(p)) {
        return Some(Shape::Circle);
    }

    let ty = comp.component_type.to_lowercase();
    if ["sensor", "indicator", "transmitter", "gauge", "instrument"]
        .iter()
        .any(|k| ty.contains(k))
    {
        Some(Shape::Circle)
    } else if ty.contains("valve") {
        Some(Shape::Bowtie)
    } else {
        None
    }
}

/// Normalize component types in place and record inferred shapes.
pub fn normalize_components(components: &mut [Component]) {
    for comp in components.iter_mut() {
        if !CANONICAL_TYPE.is_match(&comp.component_type) {
            let normalized = normalize_component_type(&comp.component_type);
            if normalized != comp.component_type {
                debug!(id = %comp.id, from = %comp.component_type, to = %normalized, "Normalized component type");
            }
            comp.component_type = normalized;
        }
        if comp.shape.is_none() && comp.meta.inferred_shape.is_none() {
            comp.meta.inferred_shape = infer_shape(comp);
        }
    }
}

/// Normalize connection types in place.
pub fn normalize_connections(connections: &mut [Connection]) {
    for conn in connections.iter_mut() {
        if conn.connection_type.parse::<ConnectionType>().is_err() {
            conn.connection_type = normalize_connection_type(&conn.connection_type)
                .as_str()
                .to_string();
        }
    }
}
