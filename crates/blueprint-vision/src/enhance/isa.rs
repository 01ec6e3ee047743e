//! ISA-5.1 instrument tag decoding.
//!
//! ## Overview
//!
//! An ISA tag such as `PDIT-101A` is read positionally:
//! - position 0: measured/initiating variable (`P` = Pressure)
//! - position 1: an optional modifier, only when it is one of `D F Q S K M J`
//! - remaining letters: functions (`I` = Indicator, `T` = Transmitter)
//! - then an optional loop number and a one-letter suffix
//!
//! [`decode_tag`] layers several strategies from most to least specific and
//! never fails. An unreadable label decodes to a null function with zero
//! confidence.

use crate::model::Component;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PATTERN_CONFIDENCE: f64 = 0.95;
const POSITIONAL_MIN_CONFIDENCE: f64 = 0.6;
const PARTIAL_CONFIDENCE: f64 = 0.7;

/// First-letter (measured variable) names.
#[must_use = "returns the measured variable name"]
pub const fn measured_variable_name(letter: char) -> Option<&'static str> {
    Some(match letter {
        'A' => "Analysis",
        'B' => "Burner/Combustion",
        'C' => "Conductivity",
        'D' => "Density",
        'E' => "Voltage",
        'F' => "Flow",
        'G' => "Gauging/Position",
        'H' => "Hand (Manual)",
        'I' => "Current",
        'J' => "Power",
        'K' => "Time/Schedule",
        'L' => "Level",
        'M' => "Moisture/Humidity",
        'N' | 'O' => "User Choice",
        'P' => "Pressure",
        'Q' => "Quantity",
        'R' => "Radiation",
        'S' => "Speed/Frequency",
        'T' => "Temperature",
        'U' => "Multivariable",
        'V' => "Vibration",
        'W' => "Weight/Force",
        'X' => "Unclassified",
        'Y' => "Event/State",
        'Z' => "Position/Dimension",
        _ => return None,
    })
}

/// Second-position modifier names.
const fn modifier_name(letter: char) -> Option<&'static str> {
    Some(match letter {
        'D' => "Differential",
        'F' => "Ratio/Fraction",
        'Q' => "Integrate/Totalize",
        'S' => "Safety",
        'K' => "Time Rate of Change",
        'M' => "Momentary/Peak",
        'J' => "Scan",
        _ => return None,
    })
}

/// Succeeding-letter function names.
const fn function_name(letter: char) -> Option<&'static str> {
    Some(match letter {
        'A' => "Alarm",
        'C' => "Controller",
        'E' => "Element/Sensor",
        'G' => "Glass/Gauge",
        'H' => "High",
        'I' => "Indicator",
        'K' => "Control Station",
        'L' => "Low",
        'M' => "Middle/Intermediate",
        'O' => "Orifice",
        'P' => "Point (Test)",
        'R' => "Recorder",
        'S' => "Switch",
        'T' => "Transmitter",
        'U' => "Multifunction",
        'V' => "Valve/Damper",
        'W' => "Well",
        'Y' => "Relay/Compute",
        'Z' => "Actuator/Driver",
        _ => return None,
    })
}

/// Letters accepted in any succeeding position by [`validate_isa_tag`].
const SUCCEEDING_LETTERS: &str = "ACDEFGHIJKLMNOPQRSTUVWXYZ";

static TAG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[_\s]+").expect("Invalid tag separator regex"));

static TAG_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{1,6})-?(\d{1,6})?([A-Z])?$").expect("Invalid ISA tag token regex")
});

static TAG_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}[A-Z0-9-]*$").expect("Invalid tag charset regex"));

/// Known multi-letter patterns: (regex, description). Group 1 is the
/// function letters, group 2 the loop number.
static KNOWN_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^([TPFL]IC)-?(\d+)", "Indicating Controller"),
        (r"^([TPFL]CV)-?(\d+)", "Control Valve"),
        (r"^([TPFL]ALL?)-?(\d+)", "Alarm Low/Low"),
        (r"^([TPFL]AH)-?(\d+)", "Alarm High"),
        (r"^([TPFL]T)-?(\d+)", "Transmitter"),
        (r"^([TPFL]I)-?(\d+)", "Indicator"),
        (r"^([TPFL]V)-?(\d+)", "Valve"),
        (r"^([TPFL]S)-?(\d+)", "Switch"),
        (r"^([TPFL]E)-?(\d+)", "Element/Sensor"),
        (r"^([TPFL]Y)-?(\d+)", "Relay/Compute"),
        (r"^(BV)-?(\d+)", "Ball Valve"),
        (r"^(SDV)-?(\d+)", "Solenoid Valve"),
        (r"^(SVC)-?(\d*)", "Signal Converter"),
        (r"^(HT)-?(\d+)", "Humidity Transmitter"),
        (r"^(ST)-?(\d+)", "Speed Transmitter"),
    ]
    .into_iter()
    .map(|(p, d)| (Regex::new(p).expect("Invalid ISA pattern regex"), d))
    .collect()
});

/// Component type → (function, variable, modifier, confidence).
const TYPE_TABLE: &[(&str, &str, &str, &str, f64)] = &[
    ("sensor_temperature", "TT", "Temperature", "Transmit", 0.85),
    ("sensor_pressure", "PT", "Pressure", "Transmit", 0.85),
    ("sensor_flow", "FT", "Flow", "Transmit", 0.85),
    ("sensor_level", "LT", "Level", "Transmit", 0.85),
    ("valve_control", "CV", "Control", "Valve", 0.80),
    ("valve_ball", "BV", "Ball", "Valve", 0.90),
    ("valve_solenoid", "SDV", "Solenoid", "Valve", 0.90),
    ("instrument_controller", "IC", "Indicating", "Control", 0.75),
    ("instrument_indicator", "I", "Indicate", "Display", 0.75),
    ("instrument_relay", "Y", "Relay", "Compute", 0.70),
];

/// Positional parse of a cleaned tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTag {
    pub cleaned: String,
    pub letters: Option<String>,
    pub measured_variable: Option<char>,
    pub measured_variable_name: Option<String>,
    pub modifier: Option<char>,
    pub modifier_name: Option<String>,
    pub functions: Vec<(char, String)>,
    pub loop_number: Option<String>,
    pub suffix: Option<char>,
    pub description: String,
    pub confidence: f64,
}

/// Result of [`decode_tag`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagDecoding {
    pub isa_function: Option<String>,
    pub measured_variable: Option<String>,
    pub modifier: Option<String>,
    pub loop_number: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

/// Trim, uppercase and turn runs of `_`/whitespace into `-`.
#[must_use = "returns the cleaned tag"]
pub fn clean_tag(raw: &str) -> String {
    TAG_SEPARATORS
        .replace_all(raw.trim(), "-")
        .to_uppercase()
}

/// Parse a tag with strict positional ISA-5.1 rules.
#[must_use = "returns the parsed tag"]
pub fn parse_isa_tag(raw: &str) -> ParsedTag {
    let cleaned = clean_tag(raw);
    let Some(caps) = TAG_TOKENS.captures(&cleaned) else {
        return ParsedTag {
            cleaned,
            letters: None,
            measured_variable: None,
            measured_variable_name: None,
            modifier: None,
            modifier_name: None,
            functions: Vec::new(),
            loop_number: None,
            suffix: None,
            description: "Invalid ISA tag format".to_string(),
            confidence: 0.0,
        };
    };

    let letters: Vec<char> = caps[1].chars().collect();
    let loop_number = caps.get(2).map(|m| m.as_str().to_string());
    let suffix = caps.get(3).and_then(|m| m.as_str().chars().next());
    let first = letters[0];

    let Some(variable_name) = measured_variable_name(first) else {
        return ParsedTag {
            letters: Some(caps[1].to_string()),
            measured_variable: Some(first),
            measured_variable_name: None,
            modifier: None,
            modifier_name: None,
            functions: Vec::new(),
            loop_number,
            suffix,
            description: format!("Unknown variable: {first}"),
            confidence: 0.3,
            cleaned,
        };
    };

    let (modifier, function_start) = match letters.get(1).copied() {
        Some(second) if modifier_name(second).is_some() => (Some(second), 2),
        _ => (None, 1),
    };

    let functions: Vec<(char, String)> = letters[function_start..]
        .iter()
        .filter_map(|&l| function_name(l).map(|n| (l, n.to_string())))
        .collect();

    let mut description = variable_name.to_string();
    if let Some(name) = modifier.and_then(modifier_name) {
        description.push(' ');
        description.push_str(name);
    }
    for (_, name) in &functions {
        description.push(' ');
        description.push_str(name);
    }

    let mut confidence: f64 = 1.0;
    if letters.len() > 1 && functions.is_empty() {
        confidence -= 0.2;
    }

    ParsedTag {
        letters: Some(caps[1].to_string()),
        measured_variable: Some(first),
        measured_variable_name: Some(variable_name.to_string()),
        modifier,
        modifier_name: modifier.and_then(modifier_name).map(str::to_string),
        functions,
        loop_number,
        suffix,
        description,
        confidence: confidence.clamp(0.0, 1.0),
        cleaned,
    }
}

fn from_known_pattern(cleaned: &str) -> Option<TagDecoding> {
    KNOWN_PATTERNS.iter().find_map(|(re, description)| {
        let caps = re.captures(cleaned)?;
        let letters = caps[1].to_string();
        let mut chars = letters.chars();
        let first = chars.next()?;
        Some(TagDecoding {
            measured_variable: measured_variable_name(first).map(str::to_string),
            modifier: chars
                .next()
                .and_then(modifier_name)
                .map(str::to_string),
            loop_number: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty()),
            confidence: PATTERN_CONFIDENCE,
            reasoning: format!("Matched standard ISA tag pattern: {description} ({cleaned})"),
            isa_function: Some(letters),
        })
    })
}

fn from_component_type(component_type: &str) -> Option<TagDecoding> {
    TYPE_TABLE
        .iter()
        .find(|(ty, ..)| *ty == component_type)
        .map(|(ty, function, variable, modifier, confidence)| TagDecoding {
            isa_function: Some((*function).to_string()),
            measured_variable: Some((*variable).to_string()),
            modifier: Some((*modifier).to_string()),
            loop_number: None,
            confidence: *confidence,
            reasoning: format!("Inferred from component type: {ty}"),
        })
}

fn from_description(description: &str, cleaned: &str) -> Option<TagDecoding> {
    let desc = description.to_lowercase();
    let decoded = |function: String, variable: &str, modifier: &str, confidence: f64| TagDecoding {
        isa_function: Some(function),
        measured_variable: Some(variable.to_string()),
        modifier: Some(modifier.to_string()),
        loop_number: None,
        confidence,
        reasoning: format!("Extracted from description: \"{description}\""),
    };

    if desc.contains("temperature transmitter") {
        Some(decoded("TT".into(), "Temperature", "Transmit", 0.80))
    } else if desc.contains("pressure transmitter") {
        Some(decoded("PT".into(), "Pressure", "Transmit", 0.80))
    } else if desc.contains("pressure indicator") {
        Some(decoded("PI".into(), "Pressure", "Indicate", 0.80))
    } else if desc.contains("flow control valve") {
        Some(decoded("FCV".into(), "Flow", "Control Valve", 0.85))
    } else if desc.contains("ball valve") {
        Some(decoded("BV".into(), "Ball", "Valve", 0.85))
    } else if desc.contains("solenoid") && desc.contains("valve") {
        Some(decoded("SDV".into(), "Solenoid", "Valve", 0.85))
    } else if desc.contains("alarm") && desc.contains("low") {
        let first = cleaned.chars().next().filter(char::is_ascii_uppercase).unwrap_or('P');
        Some(decoded(
            format!("{first}AL"),
            measured_variable_name(first).unwrap_or("Unknown"),
            "Alarm Low",
            0.75,
        ))
    } else {
        None
    }
}

fn from_partial(cleaned: &str) -> Option<TagDecoding> {
    if !TAG_CHARSET.is_match(cleaned) {
        return None;
    }
    let mut chars = cleaned.chars();
    let first = chars.next()?;
    let second = chars.next()?;
    let variable = measured_variable_name(first)?;
    let modifier = function_name(second).or_else(|| modifier_name(second))?;
    Some(TagDecoding {
        isa_function: Some(format!("{first}{second}")),
        measured_variable: Some(variable.to_string()),
        modifier: Some(modifier.to_string()),
        loop_number: None,
        confidence: PARTIAL_CONFIDENCE,
        reasoning: format!("Partial ISA pattern match from label: {cleaned}"),
    })
}

/// Decode the ISA function of a component from its label, type and
/// description. Never fails.
#[must_use = "returns the tag decoding"]
pub fn decode_tag(label: &str, component_type: &str, description: Option<&str>) -> TagDecoding {
    let cleaned = clean_tag(label);

    if let Some(decoded) = from_known_pattern(&cleaned) {
        return decoded;
    }

    let parsed = parse_isa_tag(&cleaned);
    if parsed.confidence > POSITIONAL_MIN_CONFIDENCE {
        return TagDecoding {
            isa_function: parsed.letters,
            measured_variable: parsed.measured_variable_name,
            modifier: parsed.modifier_name,
            loop_number: parsed.loop_number,
            confidence: parsed.confidence,
            reasoning: format!("Positional ISA-5.1 parse: {}", parsed.description),
        };
    }

    if let Some(decoded) = from_component_type(component_type) {
        return decoded;
    }
    if let Some(decoded) = description.and_then(|d| from_description(d, &cleaned)) {
        return decoded;
    }
    if let Some(decoded) = from_partial(&cleaned) {
        return decoded;
    }

    TagDecoding {
        reasoning: format!("No ISA pattern detected for: {cleaned} (type: {component_type})"),
        ..TagDecoding::default()
    }
}

/// Outcome of [`validate_isa_tag`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Check a tag's letter positions against the ISA-5.1 tables.
#[must_use = "returns the validation outcome"]
pub fn validate_isa_tag(tag: &str) -> TagValidation {
    let mut errors = Vec::new();
    let mut suggestions = Vec::new();
    let chars: Vec<char> = tag.trim().to_uppercase().chars().collect();

    if chars.len() < 2 {
        errors.push("Tag too short (minimum 2 characters)".to_string());
        return TagValidation {
            valid: false,
            errors,
            suggestions,
        };
    }

    if measured_variable_name(chars[0]).is_none() {
        errors.push(format!("Invalid measured variable: {}", chars[0]));
        suggestions.push("Use standard ISA first letters: T, P, F, L, etc.".to_string());
    }

    for &letter in chars.iter().take(4).skip(1) {
        if letter == '-' || letter.is_ascii_digit() {
            break;
        }
        if !SUCCEEDING_LETTERS.contains(letter) {
            errors.push(format!("Invalid modifier: {letter}"));
            suggestions.push(format!(
                "Valid modifiers: {}",
                SUCCEEDING_LETTERS
                    .chars()
                    .map(String::from)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
    }

    TagValidation {
        valid: errors.is_empty(),
        errors,
        suggestions,
    }
}

/// Decode tags for every component that lacks an ISA function.
///
/// Returns the number of components that carry a function afterwards.
pub fn decode_component_tags(components: &mut [Component]) -> usize {
    for comp in components.iter_mut() {
        if comp.meta.isa_function.is_some() {
            continue;
        }
        let label = comp.meta.tag.as_deref().unwrap_or(&comp.label);
        let decoded = decode_tag(label, &comp.component_type, comp.meta.description.as_deref());
        debug!(
            id = %comp.id,
            function = ?decoded.isa_function,
            confidence = decoded.confidence,
            "Decoded ISA tag"
        );
        comp.meta.isa_function = decoded.isa_function;
        comp.meta.isa_measured_variable = decoded.measured_variable;
        comp.meta.isa_modifier = decoded.modifier;
        comp.meta.isa_loop_number = decoded.loop_number;
        comp.meta.isa_confidence = Some(decoded.confidence);
        comp.meta.isa_reasoning = Some(decoded.reasoning);
    }
    components
        .iter()
        .filter(|c| c.meta.isa_function.is_some())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use rstest::rstest;

    #[test]
    fn test_controller_tag() {
        let d = decode_tag("TIC-101", "unknown", None);
        assert_eq!(d.isa_function.as_deref(), Some("TIC"));
        assert_eq!(d.loop_number.as_deref(), Some("101"));
        assert_eq!(d.measured_variable.as_deref(), Some("Temperature"));
        assert!(d.reasoning.contains("Controller"));
        assert!((d.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_decodes_to_nothing() {
        let d = decode_tag("garbage!!", "unknown", None);
        assert!(d.isa_function.is_none());
        assert!(d.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_positional_parse_with_modifier() {
        let p = parse_isa_tag("pdit 101a");
        assert_eq!(p.cleaned, "PDIT-101A");
        assert_eq!(p.measured_variable, Some('P'));
        assert_eq!(p.modifier, Some('D'));
        assert_eq!(p.functions.len(), 2);
        assert_eq!(p.loop_number.as_deref(), Some("101"));
        assert_eq!(p.suffix, Some('A'));
        assert_eq!(p.description, "Pressure Differential Indicator Transmitter");
        assert!((p.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_positional_parse_penalizes_unknown_functions() {
        // 'B' is not a function letter
        let p = parse_isa_tag("XB");
        assert!(p.functions.is_empty());
        assert!((p.confidence - 0.8).abs() < 1e-9);
    }

    #[rstest]
    #[case("TT-101", "sensor_temperature", Some("TT"))]
    #[case("BV-301221", "valve_ball", Some("BV"))]
    #[case("unlabeled", "sensor_flow", Some("FT"))]
    #[case("unlabeled", "valve_gate", None)]
    fn test_decode_layers(#[case] label: &str, #[case] ty: &str, #[case] expected: Option<&str>) {
        assert_eq!(decode_tag(label, ty, None).isa_function.as_deref(), expected);
    }

    #[test]
    fn test_description_and_partial_layers() {
        let d = decode_tag("unlabeled", "valve_gate", Some("Flow control valve on CHW return"));
        assert_eq!(d.isa_function.as_deref(), Some("FCV"));

        // Too long for the token grammar, but tag-shaped
        let d = decode_tag("TIX-1234567", "unknown", None);
        assert_eq!(d.isa_function.as_deref(), Some("TI"));
        assert!((d.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_validate_isa_tag() {
        assert!(validate_isa_tag("TIC-101").valid);
        let short = validate_isa_tag("T");
        assert!(!short.valid);
        let bad = validate_isa_tag("1B-2");
        assert!(!bad.valid);
        assert!(bad.errors.iter().any(|e| e.contains("measured variable")));
        let bad_modifier = validate_isa_tag("TBX");
        assert_eq!(bad_modifier.errors, vec!["Invalid modifier: B".to_string()]);
    }

    #[test]
    fn test_pass_skips_existing_functions() {
        let mut comps = vec![
            Component::new("a", "unknown", "FIC-202", BBox::default(), 0.9),
            Component::new("b", "unknown", "garbage!!", BBox::default(), 0.9),
            Component::new("c", "unknown", "TT-1", BBox::default(), 0.9),
        ];
        comps[2].meta.isa_function = Some("XX".to_string());
        let detected = decode_component_tags(&mut comps);
        assert_eq!(detected, 2);
        assert_eq!(comps[0].meta.isa_function.as_deref(), Some("FIC"));
        assert_eq!(comps[1].meta.isa_confidence, Some(0.0));
        assert_eq!(comps[2].meta.isa_function.as_deref(), Some("XX"));
        assert!(comps[2].meta.isa_confidence.is_none());
    }
}
