use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const GENERATED_IMAGE_MIME: &str = "image/png";
pub const GENERATED_IMAGE_USAGE: &str = "generated_image";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub mime_type: String,
    pub filename: String,
    pub alt: String,
    pub usage: String,
}

/// One item of a tool's output sequence.
///
/// Blobs serialize their bytes as standard base64 so the message can travel
/// over a JSON channel unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolMessage {
    Text {
        text: String,
    },
    Blob {
        #[serde(serialize_with = "encode_blob", deserialize_with = "decode_blob")]
        blob: Vec<u8>,
        meta: BlobMeta,
    },
}

impl ToolMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// A generated image; `index` is zero-based and rendered one-based in the
    /// filename.
    pub fn generated_image(blob: Vec<u8>, tool: &str, index: usize, prompt: &str) -> Self {
        Self::Blob {
            blob,
            meta: BlobMeta {
                mime_type: GENERATED_IMAGE_MIME.to_string(),
                filename: generated_filename(tool, index),
                alt: prompt.to_string(),
                usage: GENERATED_IMAGE_USAGE.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Blob { .. } => "blob",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            Self::Blob { .. } => None,
        }
    }

    pub fn as_blob(&self) -> Option<(&[u8], &BlobMeta)> {
        match self {
            Self::Text { .. } => None,
            Self::Blob { blob, meta } => Some((blob.as_slice(), meta)),
        }
    }
}

pub fn generated_filename(tool: &str, index: usize) -> String {
    format!("{tool}_generated_{}.png", index + 1)
}

fn encode_blob<S: Serializer>(blob: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(blob))
}

fn decode_blob<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
