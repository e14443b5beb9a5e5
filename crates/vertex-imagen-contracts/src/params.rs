use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::errors::ValidationError;

pub const DEFAULT_IMAGEN_MODEL: &str = "imagen-3.0-generate-001";
pub const DEFAULT_NANOBANANA_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";
pub const DEFAULT_SAFETY_FILTER_LEVEL: &str = "block_medium_and_above";
pub const MIN_IMAGES: i64 = 1;
pub const MAX_IMAGES: i64 = 4;

/// Parameters of the Imagen text-to-image tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagenParams {
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    pub number_of_images: u8,
    pub safety_filter_level: String,
}

impl ImagenParams {
    pub fn from_map(params: &Map<String, Value>) -> Result<Self, ValidationError> {
        let prompt = required_prompt(params)?;
        let model = string_or_default(params, "model", DEFAULT_IMAGEN_MODEL)?;
        let aspect_ratio = string_or_default(params, "aspect_ratio", DEFAULT_ASPECT_RATIO)?;
        let safety_filter_level =
            string_or_default(params, "safety_filter_level", DEFAULT_SAFETY_FILTER_LEVEL)?;
        let number_of_images = image_count(params.get("number_of_images"))?;
        Ok(Self {
            prompt,
            model,
            aspect_ratio,
            number_of_images,
            safety_filter_level,
        })
    }
}

/// Parameters of the Nano Banana (Gemini image) generate/edit tool.
#[derive(Debug, Clone, PartialEq)]
pub struct NanoBananaParams {
    pub prompt: String,
    pub model: String,
    pub image: Option<ReferenceImageInput>,
    pub use_google_search: bool,
}

impl NanoBananaParams {
    pub fn from_map(params: &Map<String, Value>) -> Result<Self, ValidationError> {
        let prompt = required_prompt(params)?;
        let model = string_or_default(params, "model", DEFAULT_NANOBANANA_MODEL)?;
        let image = match params.get("image") {
            Some(value) => ReferenceImageInput::from_value(value)?,
            None => None,
        };
        let use_google_search = match params.get("use_google_search") {
            None | Some(Value::Null) => false,
            Some(value) => value_as_bool(value).ok_or(ValidationError::InvalidType {
                name: "use_google_search",
                expected: "a boolean",
            })?,
        };
        Ok(Self {
            prompt,
            model,
            image,
            use_google_search,
        })
    }
}

/// A reference image as handed over by the host.
///
/// Hosts pass either a file object (`blob` and/or `url`), a bare URL, or a
/// data URL. The blob is kept as the raw JSON value; turning it into bytes is
/// the first resolution strategy and is allowed to fail.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImageInput {
    pub blob: Option<Value>,
    pub url: Option<String>,
}

impl ReferenceImageInput {
    pub fn from_value(value: &Value) -> Result<Option<Self>, ValidationError> {
        match value {
            Value::Null => Ok(None),
            Value::String(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                let lowered = trimmed.to_ascii_lowercase();
                if lowered.starts_with("http://") || lowered.starts_with("https://") {
                    return Ok(Some(Self {
                        blob: None,
                        url: Some(trimmed.to_string()),
                    }));
                }
                Ok(Some(Self {
                    blob: Some(Value::String(trimmed.to_string())),
                    url: None,
                }))
            }
            Value::Array(rows) if rows.is_empty() => Ok(None),
            Value::Array(_) => Ok(Some(Self {
                blob: Some(value.clone()),
                url: None,
            })),
            Value::Object(obj) if obj.is_empty() => Ok(None),
            Value::Object(obj) => {
                let url = ["url", "remote_url"].into_iter().find_map(|key| {
                    obj.get(key)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                });
                Ok(Some(Self {
                    blob: obj.get("blob").filter(|value| !value.is_null()).cloned(),
                    url,
                }))
            }
            _ => Err(ValidationError::InvalidType {
                name: "image",
                expected: "a file object, URL or byte payload",
            }),
        }
    }

    /// Interprets the blob as raw bytes: a JSON byte array, a data URL, or
    /// standard base64.
    pub fn blob_bytes(&self) -> Result<Vec<u8>, String> {
        let Some(blob) = self.blob.as_ref() else {
            return Err("no blob attached".to_string());
        };
        match blob {
            Value::Array(rows) => rows
                .iter()
                .map(|row| {
                    row.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(|| format!("blob contains a non-byte value: {row}"))
                })
                .collect(),
            Value::String(text) => {
                let payload = match text.split_once(',') {
                    Some((header, data)) if header.starts_with("data:") => data,
                    _ => text.as_str(),
                };
                BASE64
                    .decode(payload.trim().as_bytes())
                    .map_err(|err| format!("blob is not base64: {err}"))
            }
            other => Err(format!("blob is not bytes: {}", json_type_name(other))),
        }
    }
}

fn required_prompt(params: &Map<String, Value>) -> Result<String, ValidationError> {
    match params.get("prompt") {
        None | Some(Value::Null) => Err(ValidationError::EmptyPrompt),
        Some(Value::String(text)) if text.trim().is_empty() => Err(ValidationError::EmptyPrompt),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(ValidationError::InvalidType {
            name: "prompt",
            expected: "a string",
        }),
    }
}

fn string_or_default(
    params: &Map<String, Value>,
    name: &'static str,
    default: &str,
) -> Result<String, ValidationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(default.to_string()),
        Some(Value::String(text)) => Ok(text.trim().to_string()),
        Some(_) => Err(ValidationError::InvalidType {
            name,
            expected: "a string",
        }),
    }
}

fn image_count(value: Option<&Value>) -> Result<u8, ValidationError> {
    let count = match value {
        None | Some(Value::Null) => return Ok(MIN_IMAGES as u8),
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(MIN_IMAGES as u8),
        Some(raw) => parse_whole_number(raw)
            .ok_or_else(|| ValidationError::ImageCountNotInteger(raw.to_string()))?,
    };
    if !(MIN_IMAGES..=MAX_IMAGES).contains(&count) {
        return Err(ValidationError::ImageCountOutOfRange(count));
    }
    Ok(count as u8)
}

fn parse_whole_number(value: &Value) -> Option<i64> {
    let as_whole = |number: f64| {
        (number.is_finite() && number.fract() == 0.0 && number.abs() < i64::MAX as f64)
            .then_some(number as i64)
    };
    match value {
        Value::Number(raw) => raw.as_i64().or_else(|| raw.as_f64().and_then(as_whole)),
        Value::String(raw) => {
            let trimmed = raw.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(as_whole))
        }
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(raw) => Some(*raw),
        Value::Number(raw) => raw.as_i64().map(|value| value != 0),
        Value::String(raw) => {
            let lowered = raw.trim().to_ascii_lowercase();
            if matches!(lowered.as_str(), "1" | "true" | "yes" | "on") {
                Some(true)
            } else if matches!(lowered.as_str(), "" | "0" | "false" | "no" | "off") {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
