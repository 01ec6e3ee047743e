//! Uniform detection calls against the inference service.
//!
//! Both the whole-sheet and the per-tile paths send the same prompts and
//! schema for the drawing type and parse the reply with
//! [`parse_detection_response`]. Transport failures surface as errors so the
//! batch layer can retry them.

use crate::classifier::BlueprintType;
use crate::error::{Result, VisionError};
use crate::geometry::BBox;
use crate::inference::prompts::{detection_prompts, detection_schema};
use crate::inference::{GenerateOptions, VisionClient};
use crate::model::{AnalysisResult, DrawingImage};
use crate::parse::{is_placeholder, parse_detection_response};
use crate::tiling::{Tile, TilePosition};
use tracing::{debug, info};

const DETECTION_TEMPERATURE: f64 = 0.2;

/// Detection output for one tile, still in tile-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TileAnalysis {
    pub position: TilePosition,
    /// Normalized placement of the tile on the sheet
    pub tile_bbox: BBox,
    pub result: AnalysisResult,
}

fn detection_options(blueprint_type: BlueprintType) -> (GenerateOptions, &'static str) {
    let (system, prompt) = detection_prompts(blueprint_type);
    let options = GenerateOptions::default()
        .with_system_instruction(system)
        .with_schema(detection_schema())
        .with_temperature(DETECTION_TEMPERATURE);
    (options, prompt)
}

async fn detect(client: &dyn VisionClient, image: &DrawingImage, blueprint_type: BlueprintType) -> Result<AnalysisResult> {
    let (options, prompt) = detection_options(blueprint_type);
    let text = client.generate_vision(image, prompt, &options).await?;
    debug!(client = client.name(), chars = text.len(), "Received detection reply");
    let mut result = parse_detection_response(&text);
    result.metadata.blueprint_type = Some(blueprint_type);
    Ok(result)
}

/// Analyze the whole sheet in one call.
///
/// An unparseable reply is returned as the parser's placeholder result
/// with `metadata.parse_error` set.
///
/// # Errors
///
/// Returns an error if the inference call fails.
pub async fn analyze_standard(
    client: &dyn VisionClient,
    image: &DrawingImage,
    blueprint_type: BlueprintType,
) -> Result<AnalysisResult> {
    let result = detect(client, image, blueprint_type).await?;
    info!(
        components = result.components.len(),
        connections = result.connections.len(),
        "Standard analysis complete"
    );
    Ok(result)
}

/// Analyze one tile.
///
/// # Errors
///
/// Returns an error if the inference call fails, or
/// [`VisionError::Parse`] if nothing could be recovered from the reply, so
/// the tile is retried rather than merged as a placeholder.
pub async fn analyze_tile(client: &dyn VisionClient, tile: &Tile, blueprint_type: BlueprintType) -> Result<TileAnalysis> {
    let result = detect(client, &tile.image, blueprint_type).await?;
    if is_placeholder(&result) {
        return Err(VisionError::Parse(format!(
            "tile {}: {}",
            tile.position,
            result.metadata.parse_error.as_deref().unwrap_or("unparseable reply")
        )));
    }
    debug!(
        position = %tile.position,
        components = result.components.len(),
        connections = result.connections.len(),
        "Tile analysis complete"
    );
    Ok(TileAnalysis {
        position: tile.position,
        tile_bbox: tile.bbox,
        result,
    })
}
