use anyhow::Result;
use serde_json::{json, Map, Value};
use vertex_imagen_contracts::params::ImagenParams;
use vertex_imagen_contracts::ToolError;

use crate::auth::CLOUD_PLATFORM_SCOPE;
use crate::reference::ReferenceImageResolver;
use crate::{GenerationPlan, ResponseContent, Tool};

pub const IMAGEN_TOOL_NAME: &str = "imagen";
pub const IMAGEN_DEFAULT_LOCATION: &str = "us-central1";

pub const PROBE_MODEL: &str = "imagen-3.0-generate-002";
pub const PROBE_PROMPT: &str = "A beautiful sunset over a calm ocean";
pub const PROBE_SAFETY_FILTER_LEVEL: &str = "block_low_and_above";

/// Text-to-image generation with the Imagen `predict` API.
#[derive(Debug, Clone, Default)]
pub struct ImagenTool;

impl ImagenTool {
    pub fn new() -> Self {
        Self
    }

    /// The single cheap request used to prove a set of credentials works.
    pub fn probe_plan() -> GenerationPlan {
        let params = ImagenParams {
            prompt: PROBE_PROMPT.to_string(),
            model: PROBE_MODEL.to_string(),
            aspect_ratio: "1:1".to_string(),
            number_of_images: 1,
            safety_filter_level: PROBE_SAFETY_FILTER_LEVEL.to_string(),
        };
        Self::plan_for(&params)
    }

    fn plan_for(params: &ImagenParams) -> GenerationPlan {
        let payload = json!({
            "instances": [{
                "prompt": params.prompt,
            }],
            "parameters": {
                "sampleCount": params.number_of_images,
                "aspectRatio": params.aspect_ratio.trim(),
                "safetySetting": params.safety_filter_level.to_ascii_lowercase(),
            },
        });
        GenerationPlan {
            prompt: params.prompt.clone(),
            model: params.model.trim().trim_start_matches("models/").to_string(),
            method: "predict",
            payload,
        }
    }
}

impl Tool for ImagenTool {
    fn name(&self) -> &str {
        IMAGEN_TOOL_NAME
    }

    fn provider_label(&self) -> &str {
        "Imagen"
    }

    fn default_location(&self) -> &str {
        IMAGEN_DEFAULT_LOCATION
    }

    fn scopes(&self) -> &[&'static str] {
        &[CLOUD_PLATFORM_SCOPE]
    }

    fn prepare(
        &self,
        parameters: &Map<String, Value>,
        _images: &ReferenceImageResolver,
    ) -> Result<GenerationPlan, ToolError> {
        let params = ImagenParams::from_map(parameters)?;
        Ok(Self::plan_for(&params))
    }

    fn extract_units(&self, response: &Value) -> Result<Vec<ResponseContent>> {
        Ok(extract_predictions(response))
    }
}

fn extract_predictions(response: &Value) -> Vec<ResponseContent> {
    let predictions = response
        .get("predictions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut units = Vec::new();
    for row in predictions {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(encoded) = obj
            .get("bytesBase64Encoded")
            .or_else(|| obj.get("bytes_base64_encoded"))
            .and_then(Value::as_str)
        {
            units.push(ResponseContent::Image {
                data: encoded.to_string(),
                mime_type: obj
                    .get("mimeType")
                    .or_else(|| obj.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
            continue;
        }
        if let Some(reason) = obj.get("raiFilteredReason").and_then(Value::as_str) {
            units.push(ResponseContent::Filtered(reason.to_string()));
        }
    }
    units
}
