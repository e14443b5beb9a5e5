use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};
use vertex_imagen_contracts::{CredentialBundle, CredentialError, ToolError};

use crate::auth::ServiceAccountSigner;
use crate::config::EngineConfig;
use crate::imagen::{ImagenTool, IMAGEN_DEFAULT_LOCATION, IMAGEN_TOOL_NAME};
use crate::invocation::ToolInvocation;
use crate::materialize::BlobMaterializer;
use crate::reference::ReferenceImageResolver;
use crate::vertex::{error_chain_text, VertexSession};
use crate::{default_tool_registry, Tool, ToolRegistry};

/// Entry point for the host: checks saved credentials and hands out tool
/// invocations.
pub struct VertexImagenProvider {
    config: EngineConfig,
    http: HttpClient,
    registry: ToolRegistry,
    resolver: ReferenceImageResolver,
    materializer: BlobMaterializer,
}

impl VertexImagenProvider {
    pub fn new(config: EngineConfig) -> Self {
        let http = HttpClient::new();
        let resolver = ReferenceImageResolver::new(http.clone(), &config);
        Self {
            config,
            http,
            registry: default_tool_registry(),
            resolver,
            materializer: BlobMaterializer::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    pub fn with_materializer(mut self, materializer: BlobMaterializer) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn tools(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn tool(&self, name: &str) -> Option<&dyn Tool> {
        self.registry.get(name)
    }

    /// Proves the credentials work by running one single-image Imagen request.
    ///
    /// This costs one real generation. Every failure, including a missing
    /// field or a malformed key, is reported as a credential validation error
    /// carrying the underlying message.
    pub fn validate_credentials(&self, credentials: &Map<String, Value>) -> Result<(), ToolError> {
        match self.probe(credentials) {
            Ok(()) => {
                tracing::info!("credentials validated");
                Ok(())
            }
            Err(message) => {
                tracing::warn!(error = %message, "credentials rejected");
                Err(ToolError::CredentialValidation(message))
            }
        }
    }

    fn probe(&self, credentials: &Map<String, Value>) -> Result<(), String> {
        let bundle = CredentialBundle::from_map(
            credentials,
            &self.config.credential_key_field,
            IMAGEN_DEFAULT_LOCATION,
        )
        .map_err(|err| err.to_string())?;
        let account = bundle.service_account().map_err(|err| err.to_string())?;
        let tool = self
            .registry
            .get(IMAGEN_TOOL_NAME)
            .ok_or_else(|| ToolError::UnknownTool(IMAGEN_TOOL_NAME.to_string()).to_string())?;
        let signer =
            ServiceAccountSigner::new(&account, tool.scopes()).map_err(|err| err.to_string())?;
        let session = VertexSession::new(
            self.http.clone(),
            &bundle,
            signer,
            self.config.api_base.as_deref(),
            self.config.request_timeout,
        );
        let token = session
            .access_token()
            .map_err(|err| CredentialError::Auth(error_chain_text(&err, 512)).to_string())?;
        let plan = ImagenTool::probe_plan();
        session
            .call_model(tool.provider_label(), &token, &plan.model, plan.method, &plan.payload)
            .map(|_| ())
            .map_err(|err| error_chain_text(&err, 512))
    }

    /// Binds a tool to one call's credentials and parameters.
    ///
    /// The only error is an unknown tool name; everything else is reported as
    /// a message when the returned invocation is iterated.
    pub fn invoke(
        &self,
        tool_name: &str,
        credentials: Map<String, Value>,
        parameters: Map<String, Value>,
    ) -> Result<ToolInvocation<'_>, ToolError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.trim().to_string()))?;
        Ok(ToolInvocation::new(
            tool,
            &self.config,
            self.http.clone(),
            &self.resolver,
            &self.materializer,
            credentials,
            parameters,
        ))
    }
}
