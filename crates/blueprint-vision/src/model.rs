//! Data model for detection results.
//!
//! - [`Component`] - A detected symbol with canonical bbox and typed metadata
//! - [`Connection`] - A typed edge between two components
//! - [`ControlLoop`] - A derived sensor/controller/actuator loop
//! - [`AnalysisResult`] - The full inventory returned by the pipeline
//! - [`DrawingImage`] - Base64 image payload passed to the inference service
//!
//! Component and connection `type` fields are kept as canonical snake_case
//! strings because the inference service may emit vocabulary outside the
//! closed enums; the normalization pass maps them into the canonical set.

use crate::classifier::BlueprintType;
use crate::enhance::quality::QualityMetrics;
use crate::enhance::EnhancementStats;
use crate::error::{Result, VisionError};
use crate::geometry::BBox;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geometric primitive drawn for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Circle,
    Square,
    Diamond,
    Bowtie,
    Triangle,
    Rectangle,
    Hexagon,
    Cloud,
    Line,
    ComplexAssembly,
}

impl Shape {
    pub const ALL: [Self; 10] = [
        Self::Circle,
        Self::Square,
        Self::Diamond,
        Self::Bowtie,
        Self::Triangle,
        Self::Rectangle,
        Self::Hexagon,
        Self::Cloud,
        Self::Line,
        Self::ComplexAssembly,
    ];

    #[inline]
    #[must_use = "returns the canonical shape name"]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Square => "square",
            Self::Diamond => "diamond",
            Self::Bowtie => "bowtie",
            Self::Triangle => "triangle",
            Self::Rectangle => "rectangle",
            Self::Hexagon => "hexagon",
            Self::Cloud => "cloud",
            Self::Line => "line",
            Self::ComplexAssembly => "complex_assembly",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Shape {
    type Err = String;

    /// Accepts canonical names plus the common spellings models produce.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "circle" | "circular" | "round" => Ok(Self::Circle),
            "square" | "sq" | "box" => Ok(Self::Square),
            "diamond" | "diamand" | "rhombus" => Ok(Self::Diamond),
            "bowtie" | "bow-tie" | "bow tie" => Ok(Self::Bowtie),
            "triangle" | "triangular" => Ok(Self::Triangle),
            "rectangle" | "rect" | "rectangular" => Ok(Self::Rectangle),
            "hexagon" | "hex" | "hexagonal" => Ok(Self::Hexagon),
            "cloud" => Ok(Self::Cloud),
            "line" => Ok(Self::Line),
            "complex_assembly" | "complex assembly" => Ok(Self::ComplexAssembly),
            _ => Err(format!("unknown shape '{s}'")),
        }
    }
}

/// Coarse family of a canonical component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Instrument,
    Valve,
    Equipment,
    Annotation,
    Piping,
    Unknown,
}

impl ComponentKind {
    /// Classify a canonical snake_case type string.
    #[must_use = "returns the component family"]
    pub fn of(component_type: &str) -> Self {
        let t = component_type.to_lowercase();
        match t.as_str() {
            "text" | "label" | "text_label" | "annotation" | "tag" | "note" => {
                return Self::Annotation
            }
            _ => {}
        }
        if t.contains("valve") || t.contains("damper") || t.contains("actuator") {
            Self::Valve
        } else if t.starts_with("sensor")
            || t.starts_with("instrument")
            || ["transmitter", "controller", "indicator", "gauge", "analyzer"]
                .iter()
                .any(|k| t.contains(k))
        {
            Self::Instrument
        } else if ["pipe", "duct", "line", "connection"]
            .iter()
            .any(|k| t.contains(k))
        {
            Self::Piping
        } else if [
            "pump", "ahu", "air_handler", "chiller", "tank", "vessel", "exchanger", "tower",
            "fan", "vav", "boiler", "compressor", "equipment", "filter", "strainer",
        ]
        .iter()
        .any(|k| t.contains(k))
        {
            Self::Equipment
        } else {
            Self::Unknown
        }
    }
}

/// One step in a component's coordinate provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    /// Stage name, e.g. `normalize_bbox` or `local_to_global`
    pub stage: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Coordinates before the transform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TransformRecord {
    #[must_use = "creates a provenance record"]
    pub fn now(stage: impl Into<String>, original: Option<Vec<f64>>) -> Self {
        Self {
            stage: stage.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            original,
            detail: None,
        }
    }
}

/// Outcome of shape/type consistency enforcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeValidation {
    pub validated: bool,
    pub corrected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_shape: Option<Shape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_allowed: Option<bool>,
    #[serde(default)]
    pub reasoning: String,
}

/// HVAC subsystem a component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacSubsystem {
    AirHandling,
    ChilledWater,
    HeatingWater,
    CondenserWater,
    Refrigeration,
    Controls,
    Other,
}

/// Coarse HVAC equipment category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    Hydronic,
    Airside,
    Refrigeration,
    Controls,
    Equipment,
    Other,
}

/// Confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl DetectionQuality {
    /// Bucket a confidence: >= 0.9 excellent, >= 0.7 good, >= 0.5 fair.
    #[inline]
    #[must_use = "returns the quality bucket"]
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            Self::Excellent
        } else if confidence >= 0.7 {
            Self::Good
        } else if confidence >= 0.5 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Typed component metadata. Unknown keys round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transform_history: Vec<TransformRecord>,

    // Tile merge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from_count: Option<usize>,

    // Label association
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from_orphaned_label: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned_label_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_score: Option<f64>,

    // Shape enforcement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape_validation: Option<ShapeValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_shape: Option<Shape>,

    // ISA decoding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_measured_variable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_modifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_loop_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isa_reasoning: Option<String>,

    // HVAC classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hvac_subsystem: Option<HvacSubsystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_category: Option<ComponentCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_quality: Option<DetectionQuality>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A detected drawing symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub label: String,
    pub bbox: BBox,
    pub confidence: f64,
    #[serde(default)]
    pub rotation: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    #[serde(default)]
    pub meta: ComponentMeta,
}

impl Component {
    #[must_use = "creates a component"]
    pub fn new(
        id: impl Into<String>,
        component_type: impl Into<String>,
        label: impl Into<String>,
        bbox: BBox,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            label: label.into(),
            bbox,
            confidence,
            rotation: 0,
            shape: None,
            meta: ComponentMeta::default(),
        }
    }

    #[inline]
    #[must_use = "returns the component family"]
    pub fn kind(&self) -> ComponentKind {
        ComponentKind::of(&self.component_type)
    }

    /// Explicit shape, else the shape inferred during normalization.
    #[inline]
    #[must_use = "returns the effective shape"]
    pub fn effective_shape(&self) -> Option<Shape> {
        self.shape.or(self.meta.inferred_shape)
    }
}

/// Snap a rotation in degrees to the nearest quadrant.
#[must_use = "returns the snapped rotation"]
pub fn snap_rotation(degrees: f64) -> u16 {
    if !degrees.is_finite() {
        return 0;
    }
    let normalized = degrees.round().rem_euclid(360.0);
    // Truncation is safe: value is in [0, 360]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let quadrant = ((normalized / 90.0).round() as u16) % 4;
    quadrant * 90
}

/// Canonical connection vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Supply,
    Return,
    Electric,
    Pneumatic,
    Signal,
    Process,
    ControlSignal,
    ElectricSignal,
    ProcessFlow,
    Hydraulic,
    PneumaticSignal,
    Measurement,
    Data,
    Unknown,
}

impl ConnectionType {
    pub const ALL: [Self; 14] = [
        Self::Supply,
        Self::Return,
        Self::Electric,
        Self::Pneumatic,
        Self::Signal,
        Self::Process,
        Self::ControlSignal,
        Self::ElectricSignal,
        Self::ProcessFlow,
        Self::Hydraulic,
        Self::PneumaticSignal,
        Self::Measurement,
        Self::Data,
        Self::Unknown,
    ];

    #[inline]
    #[must_use = "returns the canonical connection type name"]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Supply => "supply",
            Self::Return => "return",
            Self::Electric => "electric",
            Self::Pneumatic => "pneumatic",
            Self::Signal => "signal",
            Self::Process => "process",
            Self::ControlSignal => "control_signal",
            Self::ElectricSignal => "electric_signal",
            Self::ProcessFlow => "process_flow",
            Self::Hydraulic => "hydraulic",
            Self::PneumaticSignal => "pneumatic_signal",
            Self::Measurement => "measurement",
            Self::Data => "data",
            Self::Unknown => "unknown",
        }
    }

    /// True for the signal-carrying types.
    #[inline]
    #[must_use = "returns whether the type carries a signal"]
    pub fn is_signal(&self) -> bool {
        self.as_str().contains("signal")
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| format!("unknown connection type '{s}'"))
    }
}

/// Typed connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferred_type: Option<ConnectionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_component_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_component_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_style: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A typed edge between two components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default = "default_connection_confidence")]
    pub confidence: f64,
    /// True for edges created by inference passes rather than detection
    #[serde(default)]
    pub inferred: bool,
    #[serde(default)]
    pub meta: ConnectionMeta,
}

const fn default_connection_confidence() -> f64 {
    0.5
}

impl Connection {
    #[must_use = "creates a connection"]
    pub fn new(
        id: impl Into<String>,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        connection_type: ConnectionType,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            connection_type: connection_type.as_str().to_string(),
            confidence,
            inferred: false,
            meta: ConnectionMeta::default(),
        }
    }
}

/// A sensor → controller → final element loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLoop {
    pub id: String,
    pub name: String,
    pub loop_type: String,
    /// Numeric token shared by the loop's tags, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    pub components: Vec<String>,
    pub connections: Vec<String>,
    pub strategy: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// A reported, not enforced, connection problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub connection_id: String,
    pub issue: String,
    pub severity: IssueSeverity,
}

/// Run-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisMetadata {
    pub total_components: usize,
    pub total_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blueprint_type: Option<BlueprintType>,
    pub tiled: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_tiles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement: Option<EnhancementStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub control_loops: Vec<ControlLoop>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
}

/// Component and connection inventory for one drawing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub components: Vec<Component>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub metadata: AnalysisMetadata,
}

impl AnalysisResult {
    #[must_use = "creates an analysis result"]
    pub fn new(components: Vec<Component>, connections: Vec<Connection>) -> Self {
        let mut result = Self {
            components,
            connections,
            metadata: AnalysisMetadata::default(),
        };
        result.refresh_totals();
        result
    }

    /// Structurally valid empty result carrying an error message.
    #[must_use = "creates an error result"]
    pub fn failed(error: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.metadata.error = Some(error.into());
        result
    }

    pub fn refresh_totals(&mut self) {
        self.metadata.total_components = self.components.len();
        self.metadata.total_connections = self.connections.len();
    }
}

/// Base64 image payload with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawingImage {
    data: String,
    mime_type: String,
}

impl DrawingImage {
    /// Wrap raw image bytes, sniffing the MIME type from the header.
    #[must_use = "creates an image payload"]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mime_type = match image::guess_format(bytes) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            _ => "image/png",
        };
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.to_string(),
        }
    }

    #[must_use = "creates an image payload"]
    pub fn from_base64(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URL. Bare base64 is accepted as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error if the data URL header is malformed.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let Some(rest) = url.strip_prefix("data:") else {
            return Ok(Self::from_base64(url.trim(), "image/png"));
        };
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| VisionError::InvalidInput("data URL without payload".to_string()))?;
        let mime_type = header.strip_suffix(";base64").ok_or_else(|| {
            VisionError::InvalidInput(format!("data URL is not base64 encoded: {header}"))
        })?;
        Ok(Self::from_base64(payload, mime_type))
    }

    #[inline]
    #[must_use = "returns the base64 payload"]
    pub fn base64(&self) -> &str {
        &self.data
    }

    #[inline]
    #[must_use = "returns the MIME type"]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Length of the base64 payload in characters.
    #[inline]
    #[must_use = "returns the payload length"]
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }

    #[must_use = "returns the data URL"]
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    /// Last `n` characters of the payload, used as a cheap content signature.
    #[must_use = "returns the payload tail"]
    pub fn tail(&self, n: usize) -> &str {
        let start = self.data.len().saturating_sub(n);
        // base64 is ASCII so any byte offset is a char boundary
        &self.data[start..]
    }

    /// First `n` characters of the payload.
    #[must_use = "returns the payload head"]
    pub fn head(&self, n: usize) -> &str {
        &self.data[..n.min(self.data.len())]
    }

    /// Decode the payload into raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_fuzzy_names() {
        assert_eq!("Bow-Tie".parse::<Shape>().unwrap(), Shape::Bowtie);
        assert_eq!("rhombus".parse::<Shape>().unwrap(), Shape::Diamond);
        assert_eq!("round".parse::<Shape>().unwrap(), Shape::Circle);
        assert!("oval".parse::<Shape>().is_err());
    }

    #[test]
    fn test_component_kind() {
        assert_eq!(ComponentKind::of("valve_gate"), ComponentKind::Valve);
        assert_eq!(ComponentKind::of("sensor_temperature"), ComponentKind::Instrument);
        assert_eq!(ComponentKind::of("instrument_controller"), ComponentKind::Instrument);
        assert_eq!(ComponentKind::of("text_label"), ComponentKind::Annotation);
        assert_eq!(ComponentKind::of("pump"), ComponentKind::Equipment);
        assert_eq!(ComponentKind::of("pipe"), ComponentKind::Piping);
        assert_eq!(ComponentKind::of("mystery"), ComponentKind::Unknown);
    }

    #[test]
    fn test_snap_rotation() {
        assert_eq!(snap_rotation(0.0), 0);
        assert_eq!(snap_rotation(88.0), 90);
        assert_eq!(snap_rotation(-90.0), 270);
        assert_eq!(snap_rotation(359.0), 0);
        assert_eq!(snap_rotation(f64::NAN), 0);
    }

    #[test]
    fn test_connection_type_roundtrip_names() {
        for t in ConnectionType::ALL {
            assert_eq!(t.as_str().parse::<ConnectionType>().unwrap(), t);
        }
        assert!(ConnectionType::ControlSignal.is_signal());
        assert!(!ConnectionType::Supply.is_signal());
    }

    #[test]
    fn test_meta_preserves_unknown_keys() {
        let json = r#"{"tag": "TT-101", "line_weight": "heavy"}"#;
        let meta: ComponentMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.tag.as_deref(), Some("TT-101"));
        assert_eq!(meta.extra["line_weight"], "heavy");
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["line_weight"], "heavy");
    }

    #[test]
    fn test_data_url_parsing() {
        let img = DrawingImage::from_data_url("data:image/jpeg;base64,QUJD").unwrap();
        assert_eq!(img.mime_type(), "image/jpeg");
        assert_eq!(img.decode().unwrap(), b"ABC");
        assert_eq!(img.data_url(), "data:image/jpeg;base64,QUJD");
        assert!(DrawingImage::from_data_url("data:image/png,plain").is_err());
        assert_eq!(img.tail(2), "JD");
        assert_eq!(img.head(100), "QUJD");
    }
}
