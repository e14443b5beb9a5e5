use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::CredentialError;

pub const DEFAULT_CREDENTIAL_KEY_FIELD: &str = "vertex_service_account_key";
pub const LEGACY_CREDENTIAL_KEY_FIELD: &str = "service_account_key";

/// Credentials as saved by the host for one plugin installation.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub project_id: String,
    pub location: String,
    /// Base64-encoded service-account JSON.
    pub service_account_key: String,
}

impl CredentialBundle {
    /// Reads the bundle from the host credential map.
    ///
    /// The key is looked up under `key_field` first, then under the two field
    /// names the plugin manifests have used historically. Blank values count
    /// as missing.
    pub fn from_map(
        credentials: &Map<String, Value>,
        key_field: &str,
        default_location: &str,
    ) -> Result<Self, CredentialError> {
        let project_id = non_empty_field(credentials, "project_id");
        let service_account_key = [
            key_field,
            DEFAULT_CREDENTIAL_KEY_FIELD,
            LEGACY_CREDENTIAL_KEY_FIELD,
        ]
        .into_iter()
        .find_map(|field| non_empty_field(credentials, field));

        let (Some(project_id), Some(service_account_key)) = (project_id, service_account_key)
        else {
            return Err(CredentialError::Missing);
        };
        let location = non_empty_field(credentials, "location")
            .unwrap_or_else(|| default_location.to_string());

        Ok(Self {
            project_id,
            location,
            service_account_key,
        })
    }

    pub fn service_account(&self) -> Result<ServiceAccountInfo, CredentialError> {
        decode_service_account_key(&self.service_account_key)
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("service_account_key", &"<redacted>")
            .finish()
    }
}

/// The fields of a Google service-account JSON key used for the token exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountInfo {
    #[serde(rename = "type", default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl fmt::Debug for ServiceAccountInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountInfo")
            .field("account_type", &self.account_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Decodes a base64 service-account key into its JSON document.
///
/// Whitespace inside the encoded text is ignored, since keys pasted into a
/// settings form are frequently line-wrapped.
pub fn decode_service_account_key(encoded: &str) -> Result<ServiceAccountInfo, CredentialError> {
    let compact = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect::<String>();
    let raw = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| CredentialError::InvalidBase64(err.to_string()))?;
    let info: ServiceAccountInfo = serde_json::from_slice(&raw)
        .map_err(|err| CredentialError::InvalidJson(err.to_string()))?;
    if info.client_email.trim().is_empty() {
        return Err(CredentialError::InvalidJson(
            "client_email is empty".to_string(),
        ));
    }
    if info.private_key.trim().is_empty() {
        return Err(CredentialError::InvalidJson(
            "private_key is empty".to_string(),
        ));
    }
    Ok(info)
}

fn non_empty_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
