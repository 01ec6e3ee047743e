//! Document classification and drawing-type routing.
//!
//! Neither entry point returns an error: service failures and malformed
//! replies degrade to [`DocumentType::Unknown`] with zero confidence (or to
//! [`BlueprintType::Hvac`]) and a logged warning.

use crate::cache::ResultCache;
use crate::inference::prompts::{
    classification_schema, BLUEPRINT_TYPE_PROMPT, CLASSIFY_PROMPT, CLASSIFY_SYSTEM_INSTRUCTION,
};
use crate::inference::{GenerateOptions, VisionClient};
use crate::model::DrawingImage;
use crate::parse::strip_code_fences;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Characters of the payload included in the classification cache key.
const CACHE_KEY_PREFIX_LEN: usize = 100;

const CLASSIFY_TEMPERATURE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Blueprint,
    Schematic,
    SpecSheet,
    Schedule,
    Unknown,
}

impl DocumentType {
    #[inline]
    #[must_use = "returns the wire name"]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Blueprint => "BLUEPRINT",
            Self::Schematic => "SCHEMATIC",
            Self::SpecSheet => "SPEC_SHEET",
            Self::Schedule => "SCHEDULE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// True for document types the visual detection pipeline handles.
    #[inline]
    #[must_use = "returns whether the document is a drawing"]
    pub const fn is_drawing(&self) -> bool {
        matches!(self, Self::Blueprint | Self::Schematic)
    }

    /// Parse one of the four classifiable types. `UNKNOWN` is never accepted
    /// from the model.
    fn from_reply(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BLUEPRINT" => Some(Self::Blueprint),
            "SCHEMATIC" => Some(Self::Schematic),
            "SPEC_SHEET" => Some(Self::SpecSheet),
            "SCHEDULE" => Some(Self::Schedule),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub document_type: DocumentType,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl Classification {
    fn unknown(reasoning: impl Into<String>) -> Self {
        Self {
            document_type: DocumentType::Unknown,
            confidence: 0.0,
            reasoning: reasoning.into(),
        }
    }

    /// True for the degraded `UNKNOWN`/0 result, which is never cached.
    #[inline]
    #[must_use = "returns whether this is the fallback classification"]
    pub fn is_fallback(&self) -> bool {
        self.document_type == DocumentType::Unknown && self.confidence == 0.0
    }
}

/// Drawing family, used to pick detection prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlueprintType {
    Pid,
    #[default]
    Hvac,
}

impl fmt::Display for BlueprintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid => write!(f, "PID"),
            Self::Hvac => write!(f, "HVAC"),
        }
    }
}

fn cache_key(image: &DrawingImage, name: &str) -> String {
    format!("classify:{name}:{}", image.head(CACHE_KEY_PREFIX_LEN))
}

/// Classify a document image.
///
/// Cached results are returned without a service call. The `UNKNOWN`/0
/// fallback is not cached so a transient failure does not stick.
pub async fn classify_document(
    client: &dyn VisionClient,
    cache: &ResultCache,
    image: &DrawingImage,
    name: &str,
) -> Classification {
    let key = cache_key(image, name);
    if let Some(cached) = cache.get_as::<Classification>(&key) {
        debug!(name, "Classification cache hit");
        return cached;
    }

    let options = GenerateOptions::default()
        .with_system_instruction(CLASSIFY_SYSTEM_INSTRUCTION)
        .with_schema(classification_schema())
        .with_temperature(CLASSIFY_TEMPERATURE);

    let result = match client.generate_vision(image, CLASSIFY_PROMPT, &options).await {
        Ok(text) => parse_classification_response(&text),
        Err(e) => {
            warn!(name, error = %e, "Classification call failed");
            Classification::unknown(format!("Classification failed: {e}"))
        }
    };

    if !result.is_fallback() {
        if let Err(e) = cache.set_as(&key, &result, None) {
            warn!(name, error = %e, "Failed to cache classification");
        }
    }
    result
}

/// Remove a cached classification so the next call re-queries the service.
pub fn clear_classification_cache(cache: &ResultCache, image: &DrawingImage, name: &str) -> bool {
    cache.delete(&cache_key(image, name))
}

/// Parse and validate a classification reply.
#[must_use = "returns the parsed classification"]
pub fn parse_classification_response(text: &str) -> Classification {
    let text = text.trim();
    if text.is_empty() {
        return Classification::unknown("Empty response");
    }

    let value: serde_json::Value = match serde_json::from_str(strip_code_fences(text)) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Failed to parse classification response");
            return Classification::unknown("Failed to parse model response");
        }
    };

    let (Some(raw_type), Some(confidence)) = (
        value.get("type").and_then(serde_json::Value::as_str),
        value.get("confidence").and_then(serde_json::Value::as_f64),
    ) else {
        return Classification::unknown("Invalid classification response format");
    };

    let Some(document_type) = DocumentType::from_reply(raw_type) else {
        warn!(raw_type, "Invalid document type, defaulting to UNKNOWN");
        return Classification::unknown("Invalid document type returned from model");
    };

    Classification {
        document_type,
        confidence: confidence.clamp(0.0, 1.0),
        reasoning: value
            .get("reasoning")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Decide whether a drawing is a P&ID or an HVAC drawing.
///
/// Any failure falls back to [`BlueprintType::Hvac`].
pub async fn detect_blueprint_type(client: &dyn VisionClient, image: &DrawingImage) -> BlueprintType {
    let options = GenerateOptions::default().with_temperature(CLASSIFY_TEMPERATURE);
    match client.generate_vision(image, BLUEPRINT_TYPE_PROMPT, &options).await {
        Ok(text) => {
            let upper = text.to_uppercase();
            if upper.contains("PID") || upper.contains("P&ID") || upper.contains("INSTRUMENT") {
                BlueprintType::Pid
            } else {
                BlueprintType::Hvac
            }
        }
        Err(e) => {
            warn!(error = %e, "Blueprint type detection failed, defaulting to HVAC");
            BlueprintType::Hvac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VisionError};
    use async_trait::async_trait;

    /// Replies with a fixed string, or fails when `None`.
    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl VisionClient for Fixed {
        async fn generate_vision(&self, _: &DrawingImage, _: &str, _: &GenerateOptions) -> Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| VisionError::Inference("offline".to_string()))
        }
    }

    fn image() -> DrawingImage {
        DrawingImage::from_base64("QUJD", "image/png")
    }

    #[test]
    fn test_detect_blueprint_type() {
        let pid = tokio_test::block_on(detect_blueprint_type(&Fixed(Some("This is a P&ID")), &image()));
        assert_eq!(pid, BlueprintType::Pid);

        let hvac = tokio_test::block_on(detect_blueprint_type(&Fixed(Some("HVAC ductwork")), &image()));
        assert_eq!(hvac, BlueprintType::Hvac);

        let failed = tokio_test::block_on(detect_blueprint_type(&Fixed(None), &image()));
        assert_eq!(failed, BlueprintType::Hvac);
    }

    #[test]
    fn test_classify_caches_only_real_answers() {
        let cache = ResultCache::default();
        let reply = r#"{"type": "SCHEMATIC", "confidence": 0.8}"#;
        let c = tokio_test::block_on(classify_document(&Fixed(Some(reply)), &cache, &image(), "a.png"));
        assert_eq!(c.document_type, DocumentType::Schematic);
        assert_eq!(cache.stats().entries, 1);

        // Served from cache even though the service is now down
        let again = tokio_test::block_on(classify_document(&Fixed(None), &cache, &image(), "a.png"));
        assert_eq!(again.document_type, DocumentType::Schematic);

        assert!(clear_classification_cache(&cache, &image(), "a.png"));
        let offline = tokio_test::block_on(classify_document(&Fixed(None), &cache, &image(), "a.png"));
        assert!(offline.is_fallback());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_parse_valid_response() {
        let c = parse_classification_response(
            r#"{"type": "BLUEPRINT", "confidence": 0.92, "reasoning": "floor plan"}"#,
        );
        assert_eq!(c.document_type, DocumentType::Blueprint);
        assert!((c.confidence - 0.92).abs() < 1e-9);
        assert_eq!(c.reasoning, "floor plan");
    }

    #[test]
    fn test_parse_fenced_response() {
        let c = parse_classification_response("```json\n{\"type\": \"SCHEDULE\", \"confidence\": 0.7}\n```");
        assert_eq!(c.document_type, DocumentType::Schedule);
        assert!(c.reasoning.is_empty());
    }

    #[test]
    fn test_parse_failures_degrade_to_unknown() {
        let empty = parse_classification_response("   ");
        assert!(empty.is_fallback());
        assert_eq!(empty.reasoning, "Empty response");

        assert!(parse_classification_response("not json").is_fallback());
        assert!(parse_classification_response(r#"{"type": "BLUEPRINT"}"#).is_fallback());
        let invalid = parse_classification_response(r#"{"type": "PHOTO", "confidence": 0.9}"#);
        assert!(invalid.is_fallback());
        assert!(invalid.reasoning.contains("Invalid document type"));
    }

    #[test]
    fn test_model_cannot_claim_unknown() {
        assert!(parse_classification_response(r#"{"type": "UNKNOWN", "confidence": 0.8}"#).is_fallback());
    }

    #[test]
    fn test_only_drawings_route_to_detection() {
        assert!(DocumentType::Blueprint.is_drawing());
        assert!(DocumentType::Schematic.is_drawing());
        assert!(!DocumentType::SpecSheet.is_drawing());
        assert!(!DocumentType::Schedule.is_drawing());
        assert!(!DocumentType::Unknown.is_drawing());
    }

    #[test]
    fn test_serde_wire_names() {
        let c = Classification {
            document_type: DocumentType::SpecSheet,
            confidence: 0.5,
            reasoning: String::new(),
        };
        assert_eq!(serde_json::to_value(&c).unwrap()["type"], "SPEC_SHEET");
        assert_eq!(serde_json::to_value(BlueprintType::Pid).unwrap(), "PID");
    }
}
