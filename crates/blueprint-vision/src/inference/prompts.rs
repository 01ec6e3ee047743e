//! Prompt text and response schemas.
//!
//! Only the structured contract matters to the pipeline: the reply must be
//! JSON carrying `components` and `connections` (or `type`/`confidence` for
//! classification). Prompt wording can be tuned freely.

use crate::classifier::BlueprintType;
use serde_json::{json, Value};

pub const CLASSIFY_SYSTEM_INSTRUCTION: &str = "You are a document triage expert for \
engineering drawings. Decide which kind of document an image is and how sure you are.";

pub const CLASSIFY_PROMPT: &str = "Classify this document as one of BLUEPRINT, SCHEMATIC, \
SPEC_SHEET or SCHEDULE. Return JSON with `type`, `confidence` (0-1) and a one-sentence \
`reasoning`.";

pub const BLUEPRINT_TYPE_PROMPT: &str = "Is this drawing a P&ID (piping and instrumentation \
diagram with ISA instrument bubbles) or an HVAC drawing (ducts, air handlers, VAV boxes)? \
Answer with exactly one word: PID or HVAC.";

const HVAC_DETECT_SYSTEM_INSTRUCTION: &str = "You are an HVAC drawing analyst. Read every \
visible tag first, then anchor each tag to its symbol. Use the tag text as the component \
label; never answer `unknown` for a legible tag. Trace supply (solid) and return (dashed) \
lines between components. All coordinates are normalized 0-1 as [xmin, ymin, xmax, ymax].";

const HVAC_DETECT_PROMPT: &str = "Detect all components (ducts, AHUs, VAV boxes, dampers, \
diffusers, sensors, controllers) and the connections between them. Include a short \
`process_log` summarizing the system.";

const PID_DETECT_SYSTEM_INSTRUCTION: &str = "You are a P&ID analyst fluent in ISA-5.1. \
Instrument bubbles are circles, control valves are bowties with actuators, logic is a \
diamond. Report the symbol shape for every component. Read tags such as TT-101 or FIC-202 \
exactly. All coordinates are normalized 0-1 as [xmin, ymin, xmax, ymax].";

const PID_DETECT_PROMPT: &str = "Detect all instruments, valves, equipment and lines, plus \
every process and signal connection. Include a short `process_log` summarizing the loops \
you found.";

const REFINE_SYSTEM_INSTRUCTION: &str = "You are reviewing a component inventory that was \
assembled from overlapping tiles of one drawing. Fix misclassified types and labels, remove \
obvious duplicates, add missed connections. Keep component ids when a component is kept.";

/// System instruction and user prompt for a detection call.
#[must_use = "returns the detection prompts"]
pub fn detection_prompts(blueprint_type: BlueprintType) -> (&'static str, &'static str) {
    match blueprint_type {
        BlueprintType::Pid => (PID_DETECT_SYSTEM_INSTRUCTION, PID_DETECT_PROMPT),
        BlueprintType::Hvac => (HVAC_DETECT_SYSTEM_INSTRUCTION, HVAC_DETECT_PROMPT),
    }
}

#[must_use = "returns the refinement system instruction"]
pub const fn refine_system_instruction() -> &'static str {
    REFINE_SYSTEM_INSTRUCTION
}

/// Refinement prompt embedding the merged inventory.
#[must_use = "returns the refinement prompt"]
pub fn refinement_prompt(merged_json: &str, blueprint_type: BlueprintType) -> String {
    format!(
        "Drawing type: {blueprint_type}.\nCurrent inventory (JSON):\n{merged_json}\n\n\
         Return the corrected inventory in the same schema."
    )
}

#[must_use = "returns the classification schema"]
pub fn classification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "type": {
                "type": "string",
                "enum": ["BLUEPRINT", "SCHEMATIC", "SPEC_SHEET", "SCHEDULE"]
            },
            "confidence": { "type": "number" },
            "reasoning": { "type": "string" }
        },
        "required": ["type", "confidence"]
    })
}

#[must_use = "returns the detection schema"]
pub fn detection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "components": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "type": { "type": "string" },
                        "label": { "type": "string" },
                        "bbox": { "type": "array", "items": { "type": "number" }, "minItems": 4, "maxItems": 4 },
                        "confidence": { "type": "number" },
                        "rotation": { "type": "number" },
                        "shape": { "type": "string" },
                        "meta": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "string" },
                                "reasoning": { "type": "string" },
                                "visual_signature": { "type": "string" }
                            }
                        }
                    },
                    "required": ["id", "type", "label", "bbox", "confidence"]
                }
            },
            "connections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "from_id": { "type": "string" },
                        "to_id": { "type": "string" },
                        "type": { "type": "string" },
                        "confidence": { "type": "number" }
                    },
                    "required": ["from_id", "to_id", "type"]
                }
            },
            "process_log": { "type": "string" }
        },
        "required": ["components", "connections"]
    })
}
