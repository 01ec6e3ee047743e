//! Defensive parsing of detection replies.
//!
//! ## Overview
//!
//! Model replies are frequently not valid JSON: markdown fences, trailing
//! commas, `NaN`, runaway float precision, comments, prose around the
//! object. [`parse_detection_response`] never fails. It degrades through
//! three stages:
//!
//! 1. **Sanitize and parse** - strip fences, truncate long floats, then
//!    retry with trailing commas, non-finite literals and comments removed,
//!    and finally on the outermost `{...}` slice.
//! 2. **Pattern extraction** - pull flat component objects out of the raw
//!    text with regexes.
//! 3. **Placeholder** - a single low-confidence `unknown` component so the
//!    caller can see that something was detected but not understood.
//!
//! `metadata.parse_error` is set whenever stage 1 failed.

use crate::enhance::hvac;
use crate::geometry::{normalize_backend_bbox, BBox, NormalizeOptions};
use crate::model::{
    snap_rotation, AnalysisResult, Component, ComponentMeta, Connection, ConnectionMeta, Shape,
    TransformRecord,
};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::borrow::Cow;
use tracing::{debug, warn};

static LONG_FLOAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\.\d{10,}").expect("Invalid long float regex"));

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("Invalid trailing comma regex"));

static NON_FINITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([:\[,]\s*)-?(?:NaN|Infinity)\b").expect("Invalid non-finite literal regex")
});

/// Flat JSON objects (no nested braces) that carry a `type` key.
static FLAT_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{[^{}]*"type"\s*:\s*"[^"]*"[^{}]*\}"#).expect("Invalid flat object regex")
});

static FIELD_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(id|type|label|tag)"\s*:\s*"([^"]*)""#).expect("Invalid string field regex")
});

static FIELD_CONFIDENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""confidence"\s*:\s*(-?[\d.]+)"#).expect("Invalid confidence field regex")
});

static FIELD_BBOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""bbox(?:_2d)?"\s*:\s*\[([^\]]*)\]"#).expect("Invalid bbox field regex")
});

const PLACEHOLDER_CONFIDENCE: f64 = 0.1;
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Remove a surrounding markdown code fence, if present.
#[must_use = "returns the unfenced text"]
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the opening line
    let body = rest.find('\n').map_or("", |i| &rest[i + 1..]);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Truncate floats with ten or more decimals to four.
fn truncate_long_floats(text: &str) -> Cow<'_, str> {
    LONG_FLOAT.replace_all(text, |caps: &regex::Captures<'_>| {
        caps[0]
            .parse::<f64>()
            .map_or_else(|_| caps[0].to_string(), |v| format!("{v:.4}"))
    })
}

/// Remove `//` and `/* */` comments outside string literals.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn sanitize(text: &str) -> String {
    let text = strip_comments(text);
    let text = TRAILING_COMMA.replace_all(&text, "$1");
    NON_FINITE.replace_all(&text, "${1}null").into_owned()
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse JSON with progressively more aggressive cleanup.
///
/// # Errors
///
/// Returns the first parse error if every attempt fails.
pub fn parse_json_lenient(text: &str) -> Result<Value, String> {
    let cleaned = truncate_long_floats(strip_code_fences(text)).into_owned();
    let first_error = match serde_json::from_str::<Value>(&cleaned) {
        Ok(v) => return Ok(v),
        Err(e) => e.to_string(),
    };

    let sanitized = sanitize(&cleaned);
    if let Ok(v) = serde_json::from_str::<Value>(&sanitized) {
        debug!("Parsed detection reply after sanitizing");
        return Ok(v);
    }

    if let Some(slice) = outermost_object(&sanitized) {
        if let Ok(v) = serde_json::from_str::<Value>(slice) {
            debug!("Parsed detection reply from embedded object");
            return Ok(v);
        }
    }

    Err(first_error)
}

/// Parse a detection reply into an [`AnalysisResult`]. Never fails.
#[must_use = "returns the parsed detection"]
pub fn parse_detection_response(text: &str) -> AnalysisResult {
    match parse_json_lenient(text) {
        Ok(value) => result_from_value(&value),
        Err(error) => {
            warn!(
                error = %error,
                snippet = %text.chars().take(200).collect::<String>(),
                "Failed to parse detection reply"
            );
            let mut result = extract_by_pattern(text);
            if result.components.is_empty() {
                result = placeholder_result(&error);
            } else {
                debug!(components = result.components.len(), "Recovered components by pattern");
            }
            result.metadata.parse_error = Some(error);
            result.refresh_totals();
            result
        }
    }
}

/// Convert an already-parsed reply object.
#[must_use = "returns the converted detection"]
pub fn result_from_value(value: &Value) -> AnalysisResult {
    let components: Vec<Component> = value
        .get("components")
        .and_then(Value::as_array)
        .or_else(|| value.get("entities").and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .filter(|v| v.is_object())
                .enumerate()
                .map(|(i, v)| component_from_value(v, i))
                .collect()
        })
        .unwrap_or_default();

    let connections: Vec<Connection> = value
        .get("connections")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|v| v.is_object())
                .enumerate()
                .map(|(i, v)| connection_from_value(v, i))
                .collect()
        })
        .unwrap_or_default();

    let mut result = AnalysisResult::new(dedupe_ids(components), connections);
    result.metadata.process_log = value
        .get("summary")
        .or_else(|| value.get("process_log"))
        .and_then(Value::as_str)
        .map(str::to_string);
    result
}

/// Make component ids unique within one reply by suffixing repeats.
fn dedupe_ids(mut components: Vec<Component>) -> Vec<Component> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for comp in &mut components {
        if !seen.insert(comp.id.clone()) {
            let mut n = 2;
            while seen.contains(&format!("{}-{n}", comp.id)) {
                n += 1;
            }
            comp.id = format!("{}-{n}", comp.id);
            seen.insert(comp.id.clone());
        }
    }
    components
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_array(v: &Value) -> Option<Vec<f64>> {
    v.as_array().map(|items| {
        items
            .iter()
            .map(|x| x.as_f64().unwrap_or(f64::NAN))
            .collect()
    })
}

fn component_from_value(v: &Value, index: usize) -> Component {
    let raw_bbox = v
        .get("bbox")
        .and_then(number_array)
        .or_else(|| v.get("bbox_2d").and_then(number_array));
    let opts = NormalizeOptions::default();
    let mut bbox = match &raw_bbox {
        Some(raw) if raw.len() == 4 => normalize_backend_bbox(raw, &opts),
        _ => BBox::default(),
    };
    let polygon = v.get("polygon").and_then(number_array);
    if let Some(bounds) = polygon.as_deref().and_then(BBox::from_polygon) {
        bbox = normalize_backend_bbox(&bounds.to_array(), &opts);
    }

    let mut meta = match v.get("meta") {
        Some(m) if m.is_object() => serde_json::from_value::<ComponentMeta>(m.clone())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Component meta has unexpected shape");
                ComponentMeta::default()
            }),
        _ => ComponentMeta {
            description: string_field(v, "description")
                .or_else(|| string_field(v, "functional_desc")),
            reasoning: string_field(v, "reasoning"),
            ..ComponentMeta::default()
        },
    };
    if meta.visual_signature.is_none() {
        meta.visual_signature = string_field(v, "visual_signature");
    }
    if meta.tag.is_none() {
        meta.tag = string_field(v, "tag");
    }
    if polygon.is_some() {
        meta.polygon = polygon;
    }

    let raw_shape = string_field(v, "shape").or_else(|| {
        meta.extra
            .get("shape")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let shape = raw_shape.as_deref().and_then(|s| s.parse::<Shape>().ok());
    if let (Some(raw), None) = (&raw_shape, shape) {
        meta.extra
            .insert("raw_shape".to_string(), Value::String(raw.clone()));
    }

    let mut record = TransformRecord::now("normalize_bbox", raw_bbox);
    record.detail = Some(format!("normalized to {:?}", bbox.to_array()));
    meta.transform_history.push(record);

    let label = string_field(v, "label")
        .or_else(|| string_field(v, "tag"))
        .unwrap_or_else(|| "unknown".to_string());

    let mut component = Component {
        id: string_field(v, "id").unwrap_or_else(|| format!("comp-{}", index + 1)),
        component_type: string_field(v, "type").unwrap_or_else(|| "unknown".to_string()),
        label,
        bbox,
        confidence: v
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .map_or(DEFAULT_CONFIDENCE, |c| c.clamp(0.0, 1.0)),
        rotation: v.get("rotation").and_then(Value::as_f64).map_or(0, snap_rotation),
        shape,
        meta,
    };
    hvac::enrich_component(&mut component);
    component
}

fn connection_from_value(v: &Value, index: usize) -> Connection {
    let mut meta = v
        .get("meta")
        .filter(|m| m.is_object())
        .and_then(|m| serde_json::from_value::<ConnectionMeta>(m.clone()).ok())
        .unwrap_or_default();
    if meta.line_style.is_none() {
        meta.line_style = string_field(v, "line_style").or_else(|| string_field(v, "style"));
    }
    Connection {
        id: string_field(v, "id").unwrap_or_else(|| format!("conn-{}", index + 1)),
        from_id: string_field(v, "from_id").unwrap_or_default(),
        to_id: string_field(v, "to_id").unwrap_or_default(),
        connection_type: string_field(v, "type").unwrap_or_else(|| "unknown".to_string()),
        confidence: v
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .map_or(DEFAULT_CONFIDENCE, |c| c.clamp(0.0, 1.0)),
        inferred: v.get("inferred").and_then(Value::as_bool).unwrap_or(false),
        meta,
    }
}

/// Stage 2: recover flat component objects from unparseable text.
fn extract_by_pattern(text: &str) -> AnalysisResult {
    let mut components = Vec::new();
    for (i, m) in FLAT_OBJECT.find_iter(text).enumerate() {
        let fragment = sanitize(m.as_str());
        let value = serde_json::from_str::<Value>(&fragment)
            .unwrap_or_else(|_| fields_by_pattern(m.as_str()));
        if value.get("from_id").is_some() {
            continue;
        }
        if value.get("bbox").is_none() && value.get("label").is_none() {
            continue;
        }
        components.push(component_from_value(&value, i));
    }
    AnalysisResult::new(dedupe_ids(components), Vec::new())
}

fn fields_by_pattern(fragment: &str) -> Value {
    let mut obj = serde_json::Map::new();
    for caps in FIELD_STRING.captures_iter(fragment) {
        obj.entry(caps[1].to_string())
            .or_insert_with(|| Value::String(caps[2].to_string()));
    }
    if let Some(caps) = FIELD_CONFIDENCE.captures(fragment) {
        if let Some(n) = caps[1].parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            obj.insert("confidence".to_string(), Value::Number(n));
        }
    }
    if let Some(caps) = FIELD_BBOX.captures(fragment) {
        let values: Vec<Value> = caps[1]
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .filter_map(serde_json::Number::from_f64)
            .map(Value::Number)
            .collect();
        obj.insert("bbox".to_string(), Value::Array(values));
    }
    Value::Object(obj)
}

/// Stage 3: one placeholder so the failure is visible downstream.
fn placeholder_result(error: &str) -> AnalysisResult {
    let mut placeholder = Component::new(
        "unparsed-1",
        "unknown",
        "unparsed",
        BBox::default(),
        PLACEHOLDER_CONFIDENCE,
    );
    placeholder.meta.parse_error = Some(error.to_string());
    AnalysisResult::new(vec![placeholder], Vec::new())
}

/// True if the result is the stage-3 placeholder.
#[must_use = "returns whether the result is a parse placeholder"]
pub fn is_placeholder(result: &AnalysisResult) -> bool {
    result.components.len() == 1 && result.components[0].meta.parse_error.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_truncates_runaway_floats() {
        let out = truncate_long_floats("[0.123456789012345, 0.5]");
        assert_eq!(out, "[0.1235, 0.5]");
    }

    #[test]
    fn test_sanitize_trailing_commas_and_nan() {
        let v = parse_json_lenient(r#"{"a": [1, 2,], "b": NaN, "c": -Infinity,}"#).unwrap();
        assert_eq!(v["a"], serde_json::json!([1, 2]));
        assert!(v["b"].is_null());
        assert!(v["c"].is_null());
    }

    #[test]
    fn test_comments_outside_strings_only() {
        let v = parse_json_lenient("{\n// note\n\"label\": \"PN//AIR\", /* x */ \"n\": 1}").unwrap();
        assert_eq!(v["label"], "PN//AIR");
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn test_embedded_object_in_prose() {
        let v = parse_json_lenient("Here is the result: {\"components\": []} hope this helps").unwrap();
        assert!(v["components"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_component_defaults() {
        let result = parse_detection_response(r#"{"components": [{"bbox": [100, 100, 200, 200]}], "connections": [{"from_id": "a", "to_id": "b"}]}"#);
        let c = &result.components[0];
        assert_eq!(c.id, "comp-1");
        assert_eq!(c.component_type, "unknown");
        assert_eq!(c.label, "unknown");
        assert!((c.confidence - 0.5).abs() < 1e-9);
        assert_eq!(c.bbox, BBox::new(0.1, 0.1, 0.2, 0.2));
        assert_eq!(c.meta.transform_history[0].stage, "normalize_bbox");
        assert_eq!(result.connections[0].id, "conn-1");
        assert_eq!(result.connections[0].connection_type, "unknown");
        assert!(result.metadata.parse_error.is_none());
    }

    #[test]
    fn test_entities_bbox_2d_and_tag_label() {
        let result = parse_detection_response(
            r#"{"entities": [{"id": "e1", "type": "pump", "tag": "P-101", "bbox_2d": [0.1, 0.2, 0.3, 0.4], "rotation": 92}]}"#,
        );
        let c = &result.components[0];
        assert_eq!(c.label, "P-101");
        assert_eq!(c.bbox, BBox::new(0.1, 0.2, 0.3, 0.4));
        assert_eq!(c.rotation, 90);
    }

    #[test]
    fn test_polygon_gives_tight_bbox() {
        let result = parse_detection_response(
            r#"{"components": [{"id": "a", "type": "tank", "label": "T-1", "bbox": [0, 0, 1, 1], "polygon": [0.2, 0.3, 0.4, 0.3, 0.3, 0.6]}]}"#,
        );
        assert_eq!(result.components[0].bbox, BBox::new(0.2, 0.3, 0.4, 0.6));
    }

    #[test]
    fn test_unknown_shape_kept_raw() {
        let result = parse_detection_response(
            r#"{"components": [{"id": "a", "type": "x", "label": "x", "bbox": [0,0,0.1,0.1], "shape": "oval"}]}"#,
        );
        let c = &result.components[0];
        assert!(c.shape.is_none());
        assert_eq!(c.meta.extra["raw_shape"], "oval");
    }

    #[test]
    fn test_duplicate_ids_are_suffixed() {
        let result = parse_detection_response(
            r#"{"components": [{"id": "a", "bbox": [0,0,0.1,0.1]}, {"id": "a", "bbox": [0.5,0.5,0.6,0.6]}]}"#,
        );
        assert_eq!(result.components[0].id, "a");
        assert_eq!(result.components[1].id, "a-2");
    }

    #[test]
    fn test_pattern_extraction_fallback() {
        let text = r#"components: {"id": "v1", "type": "valve_gate", "label": "HV-1", "bbox": [0.1, 0.1, 0.2, 0.2], "confidence": 0.8} and then {"id": "v2", "type": "pump", "label": "P-2" "bbox": [0.3, 0.3, 0.4, 0.4]} ... truncated"#;
        let result = parse_detection_response(text);
        assert!(result.metadata.parse_error.is_some());
        assert_eq!(result.components.len(), 2);
        assert_eq!(result.components[0].id, "v1");
        assert_eq!(result.components[1].label, "P-2");
        assert_eq!(result.components[1].bbox, BBox::new(0.3, 0.3, 0.4, 0.4));
    }

    #[test]
    fn test_placeholder_on_garbage() {
        let result = parse_detection_response("I could not analyze this image.");
        assert!(is_placeholder(&result));
        let c = &result.components[0];
        assert_eq!(c.component_type, "unknown");
        assert!((c.confidence - 0.1).abs() < 1e-9);
        assert!(result.metadata.parse_error.is_some());
        assert_eq!(result.metadata.total_components, 1);
    }

    #[test]
    fn test_process_log_from_summary() {
        let result = parse_detection_response(r#"{"components": [], "connections": [], "summary": "One AHU"}"#);
        assert_eq!(result.metadata.process_log.as_deref(), Some("One AHU"));
        assert!(result.components.is_empty());
    }
}
