use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use reqwest::blocking::Client as HttpClient;
use vertex_imagen_contracts::params::ReferenceImageInput;
use vertex_imagen_contracts::ToolError;

use crate::config::EngineConfig;
use crate::vertex::error_chain_text;

static HTTPS_ORIGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[^/]+").expect("origin pattern compiles"));

/// One way of turning a reference image input into decodable image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// Use the bytes the host attached to the file object.
    InlineBytes,
    /// Fetch the file URL with its `https://host` origin swapped for an
    /// in-network origin, for hosts sitting behind an identity-aware proxy.
    InternalRewrite { origin: String },
    /// Fetch the file URL as given.
    DirectUrl,
}

impl ResolveStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InlineBytes => "inline bytes",
            Self::InternalRewrite { .. } => "internal url",
            Self::DirectUrl => "url",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub source: &'static str,
}

/// Tries each strategy in order and keeps the first image that decodes.
pub struct ReferenceImageResolver {
    http: HttpClient,
    strategies: Vec<ResolveStrategy>,
    fetch_timeout: Duration,
}

impl ReferenceImageResolver {
    pub fn new(http: HttpClient, config: &EngineConfig) -> Self {
        let mut strategies = vec![ResolveStrategy::InlineBytes];
        if let Some(origin) = config.internal_image_host.as_ref() {
            strategies.push(ResolveStrategy::InternalRewrite {
                origin: origin.clone(),
            });
        }
        strategies.push(ResolveStrategy::DirectUrl);
        Self::with_strategies(http, strategies, config.image_fetch_timeout)
    }

    pub fn with_strategies(
        http: HttpClient,
        strategies: Vec<ResolveStrategy>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            http,
            strategies,
            fetch_timeout,
        }
    }

    pub fn strategies(&self) -> &[ResolveStrategy] {
        &self.strategies
    }

    pub fn resolve(&self, input: &ReferenceImageInput) -> Result<ResolvedImage, ToolError> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match self.attempt(strategy, input) {
                Ok(image) => {
                    tracing::debug!(
                        source = image.source,
                        bytes = image.bytes.len(),
                        mime_type = %image.mime_type,
                        "reference image resolved"
                    );
                    return Ok(image);
                }
                Err(err) => {
                    let reason = error_chain_text(&err, 256);
                    tracing::debug!(strategy = strategy.label(), %reason, "reference image strategy failed");
                    failures.push(format!("{}: {}", strategy.label(), reason));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no resolution strategy configured".to_string());
        }
        Err(ToolError::ImageResolution(failures.join("; ")))
    }

    fn attempt(&self, strategy: &ResolveStrategy, input: &ReferenceImageInput) -> Result<ResolvedImage> {
        match strategy {
            ResolveStrategy::InlineBytes => {
                let bytes = input.blob_bytes().map_err(|reason| anyhow!(reason))?;
                decoded_image(bytes, strategy.label())
            }
            ResolveStrategy::InternalRewrite { origin } => {
                let url = required_url(input)?;
                let rewritten = self.rewrite_origin(url, origin);
                if rewritten == url {
                    bail!("url has no https origin to rewrite");
                }
                self.fetch(&rewritten, strategy.label())
            }
            ResolveStrategy::DirectUrl => {
                let url = required_url(input)?;
                self.fetch(url, strategy.label())
            }
        }
    }

    fn rewrite_origin(&self, url: &str, origin: &str) -> String {
        HTTPS_ORIGIN
            .replace_all(url, regex::NoExpand(origin))
            .into_owned()
    }

    fn fetch(&self, url: &str, source: &'static str) -> Result<ResolvedImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .with_context(|| format!("request failed ({url})"))?
            .error_for_status()
            .with_context(|| format!("download rejected ({url})"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("download interrupted ({url})"))?;
        decoded_image(bytes.to_vec(), source)
    }
}

fn required_url(input: &ReferenceImageInput) -> Result<&str> {
    input
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("cannot retrieve image from file object: no url"))
}

fn decoded_image(bytes: Vec<u8>, source: &'static str) -> Result<ResolvedImage> {
    if bytes.is_empty() {
        bail!("image payload is empty");
    }
    let format = image::guess_format(&bytes).context("unrecognized image format")?;
    image::load_from_memory_with_format(&bytes, format).context("image could not be decoded")?;
    Ok(ResolvedImage {
        mime_type: format.to_mime_type().to_string(),
        bytes,
        source,
    })
}
