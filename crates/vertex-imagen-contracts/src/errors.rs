use thiserror::Error;

/// Problems with the credential bundle or the service-account key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Missing required credentials: project_id and service_account_key are required")]
    Missing,
    #[error("Invalid service account key format: key is not valid base64 ({0})")]
    InvalidBase64(String),
    #[error("Invalid service account key format: decoded key is not a valid service account JSON document ({0})")]
    InvalidJson(String),
    #[error("Invalid service account key format: private key could not be loaded ({0})")]
    InvalidPrivateKey(String),
    #[error("Service account authentication failed: {0}")]
    Auth(String),
}

/// Parameter problems detected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Prompt is required to generate images")]
    EmptyPrompt,
    #[error("Number of images must be between 1 and 4")]
    ImageCountOutOfRange(i64),
    #[error("Number of images must be a whole number, got {0}")]
    ImageCountNotInteger(String),
    #[error("Parameter '{name}' must be {expected}")]
    InvalidType {
        name: &'static str,
        expected: &'static str,
    },
}

/// Everything a tool invocation or a credential check can fail with.
///
/// The `Display` text of each variant is exactly what the host sees in the
/// text message emitted for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Error loading image: {0}")]
    ImageResolution(String),
    #[error("Error generating images: {0}")]
    RemoteGeneration(String),
    #[error("Error processing image {index}: {message}")]
    ItemProcessing { index: usize, message: String },
    #[error("{0}")]
    CredentialValidation(String),
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ToolError {
    /// Short machine-readable label used in logs and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "credential",
            Self::Validation(_) => "validation",
            Self::ImageResolution(_) => "image_resolution",
            Self::RemoteGeneration(_) => "remote_generation",
            Self::ItemProcessing { .. } => "item_processing",
            Self::CredentialValidation(_) => "credential_validation",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Unexpected(_) => "unexpected",
        }
    }
}
