use std::fs;
use std::io::{Cursor, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;

/// Turns base64 image payloads from the API into PNG bytes for blob messages.
///
/// The bytes are staged through a named temporary file that is removed when
/// it goes out of scope, on success and on every error path.
#[derive(Debug, Clone, Default)]
pub struct BlobMaterializer {
    scratch_dir: Option<PathBuf>,
}

impl BlobMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: Some(scratch_dir.into()),
        }
    }

    pub fn materialize(&self, encoded: &str) -> Result<Vec<u8>> {
        let bytes = BASE64
            .decode(encoded.trim().as_bytes())
            .context("image payload is not valid base64")?;
        let png = as_png(bytes)?;
        self.stage(&png)
    }

    fn stage(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vertex-imagen-").suffix(".png");
        let mut staged = match self.scratch_dir.as_ref() {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("failed to create temporary image file")?;
        staged
            .write_all(bytes)
            .and_then(|_| staged.flush())
            .context("failed to write temporary image file")?;
        let read_back = fs::read(staged.path())
            .with_context(|| format!("failed reading {}", staged.path().display()))?;
        Ok(read_back)
    }
}

/// PNG input passes through untouched; other decodable formats are re-encoded.
fn as_png(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        anyhow::bail!("image payload is empty");
    }
    let format = image::guess_format(&bytes).context("unrecognized image format")?;
    let decoded =
        image::load_from_memory_with_format(&bytes, format).context("image could not be decoded")?;
    if format == ImageFormat::Png {
        return Ok(bytes);
    }
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to re-encode image as png")?;
    Ok(out.into_inner())
}
