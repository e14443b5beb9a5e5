//! Service-account access tokens via the OAuth 2.0 JWT bearer grant.

use std::time::Duration;

use anyhow::{Context, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use vertex_imagen_contracts::{CredentialError, ServiceAccountInfo};

use crate::vertex::response_json_or_error;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const GENERATIVE_LANGUAGE_SCOPE: &str = "https://www.googleapis.com/auth/generative-language";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_S: i64 = 3600;

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// A parsed service account able to mint access tokens for a fixed scope set.
///
/// Building one validates the private key, so a malformed key is reported as a
/// key-format problem before any network traffic.
pub struct ServiceAccountSigner {
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    scopes: Vec<String>,
    key: EncodingKey,
}

impl ServiceAccountSigner {
    pub fn new(info: &ServiceAccountInfo, scopes: &[&str]) -> Result<Self, CredentialError> {
        let key = EncodingKey::from_rsa_pem(info.private_key.as_bytes())
            .map_err(|err| CredentialError::InvalidPrivateKey(err.to_string()))?;
        let token_uri = info
            .token_uri
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TOKEN_URI)
            .to_string();
        Ok(Self {
            client_email: info.client_email.clone(),
            key_id: info.private_key_id.clone(),
            token_uri,
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            key,
        })
    }

    fn scope_string(&self) -> String {
        if self.scopes.is_empty() {
            CLOUD_PLATFORM_SCOPE.to_string()
        } else {
            self.scopes.join(" ")
        }
    }

    /// Signs the RS256 assertion exchanged at the token endpoint.
    pub fn assertion(&self, now_unix: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        header.kid = self.key_id.clone();
        let claims = Claims {
            iss: &self.client_email,
            scope: self.scope_string(),
            aud: &self.token_uri,
            iat: now_unix,
            exp: now_unix + ASSERTION_LIFETIME_S,
        };
        encode(&header, &claims, &self.key).context("failed to sign service account assertion")
    }

    pub fn fetch_access_token(&self, http: &HttpClient, timeout: Duration) -> Result<String> {
        let assertion = self.assertion(chrono::Utc::now().timestamp())?;
        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ];
        let response = http
            .post(&self.token_uri)
            .timeout(timeout)
            .form(&form)
            .send()
            .with_context(|| format!("token request failed ({})", self.token_uri))?;
        let payload = response_json_or_error("Token endpoint", response)?;
        let token: TokenResponse = serde_json::from_value(payload)
            .context("token endpoint returned an unexpected payload")?;
        tracing::debug!(
            client_email = %self.client_email,
            expires_in = token.expires_in.unwrap_or_default(),
            "service account token issued"
        );
        Ok(token.access_token)
    }
}
