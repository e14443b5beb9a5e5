use std::env;
use std::time::Duration;

use vertex_imagen_contracts::credentials::DEFAULT_CREDENTIAL_KEY_FIELD;

pub const DEFAULT_INTERNAL_IMAGE_HOST: &str = "http://nginx";

/// Engine settings shared by every tool and the credential validator.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Replaces `https://{location}-aiplatform.googleapis.com` when set.
    pub api_base: Option<String>,
    pub credential_key_field: String,
    pub request_timeout: Duration,
    pub image_fetch_timeout: Duration,
    /// Origin substituted into reference-image URLs for the in-cluster fetch.
    /// `None` disables that strategy.
    pub internal_image_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            credential_key_field: DEFAULT_CREDENTIAL_KEY_FIELD.to_string(),
            request_timeout: Duration::from_secs(120),
            image_fetch_timeout: Duration::from_secs(10),
            internal_image_host: Some(DEFAULT_INTERNAL_IMAGE_HOST.to_string()),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let internal_image_host = match lookup("VERTEX_INTERNAL_IMAGE_HOST") {
            Some(raw) => Some(raw.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
            None => defaults.internal_image_host,
        };

        Self {
            api_base: non_empty("VERTEX_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string()),
            credential_key_field: non_empty("VERTEX_CREDENTIAL_KEY_FIELD")
                .unwrap_or(defaults.credential_key_field),
            request_timeout: seconds_setting(
                non_empty("VERTEX_REQUEST_TIMEOUT"),
                defaults.request_timeout.as_secs_f64(),
                15.0,
                600.0,
            ),
            image_fetch_timeout: seconds_setting(
                non_empty("VERTEX_IMAGE_FETCH_TIMEOUT"),
                defaults.image_fetch_timeout.as_secs_f64(),
                1.0,
                120.0,
            ),
            internal_image_host,
        }
    }
}

fn seconds_setting(raw: Option<String>, default: f64, min: f64, max: f64) -> Duration {
    let parsed = raw
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite());
    Duration::from_secs_f64(parsed.unwrap_or(default).clamp(min, max))
}
