use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use vertex_imagen_contracts::params::NanoBananaParams;
use vertex_imagen_contracts::ToolError;

use crate::auth::{CLOUD_PLATFORM_SCOPE, GENERATIVE_LANGUAGE_SCOPE};
use crate::reference::{ReferenceImageResolver, ResolvedImage};
use crate::{GenerationPlan, ResponseContent, Tool};

pub const NANOBANANA_TOOL_NAME: &str = "nanobanana";
pub const NANOBANANA_DEFAULT_LOCATION: &str = "global";

/// Image generation and editing with Gemini image models (`generateContent`).
#[derive(Debug, Clone, Default)]
pub struct NanoBananaTool;

impl NanoBananaTool {
    pub fn new() -> Self {
        Self
    }

    fn build_payload(
        params: &NanoBananaParams,
        reference: Option<&ResolvedImage>,
    ) -> Value {
        let mut parts = vec![json!({ "text": params.prompt })];
        if let Some(image) = reference {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }));
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({ "responseModalities": ["IMAGE", "TEXT"] }),
        );
        if params.use_google_search {
            payload.insert("tools".to_string(), json!([{ "googleSearch": {} }]));
        }
        Value::Object(payload)
    }
}

impl Tool for NanoBananaTool {
    fn name(&self) -> &str {
        NANOBANANA_TOOL_NAME
    }

    fn provider_label(&self) -> &str {
        "Gemini"
    }

    fn default_location(&self) -> &str {
        NANOBANANA_DEFAULT_LOCATION
    }

    fn scopes(&self) -> &[&'static str] {
        &[CLOUD_PLATFORM_SCOPE, GENERATIVE_LANGUAGE_SCOPE]
    }

    fn prepare(
        &self,
        parameters: &Map<String, Value>,
        images: &ReferenceImageResolver,
    ) -> Result<GenerationPlan, ToolError> {
        let params = NanoBananaParams::from_map(parameters)?;
        let reference = match params.image.as_ref() {
            Some(input) => Some(images.resolve(input)?),
            None => None,
        };
        Ok(GenerationPlan {
            prompt: params.prompt.clone(),
            model: params.model.trim().trim_start_matches("models/").to_string(),
            method: "generateContent",
            payload: Self::build_payload(&params, reference.as_ref()),
        })
    }

    fn extract_units(&self, response: &Value) -> Result<Vec<ResponseContent>> {
        extract_parts(response)
    }
}

/// Flattens the first candidate's parts into text and image units.
///
/// Thought parts and blank text are dropped. A part carrying both text and
/// inline data yields two units.
fn extract_parts(response: &Value) -> Result<Vec<ResponseContent>> {
    let Some(candidate) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
    else {
        let reason = response
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str);
        match reason {
            Some(reason) => bail!("prompt was blocked ({reason})"),
            None => return Ok(Vec::new()),
        }
    };

    let parts = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if parts.is_empty() {
        if let Some(reason) = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .filter(|reason| *reason != "STOP")
        {
            bail!("generation stopped without output ({reason})");
        }
    }

    let mut units = Vec::new();
    for part in &parts {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(text) = part
            .get("text")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
        {
            units.push(ResponseContent::Text(text.to_string()));
        }
        let inline = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object);
        if let Some(inline) = inline {
            units.push(ResponseContent::Image {
                data: inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                mime_type: inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    Ok(units)
}
