pub mod auth;
pub mod config;
pub mod imagen;
pub mod invocation;
pub mod materialize;
pub mod nanobanana;
pub mod provider;
pub mod reference;
pub mod vertex;

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use vertex_imagen_contracts::ToolError;

pub use config::EngineConfig;
pub use imagen::ImagenTool;
pub use invocation::{MessageIter, ToolInvocation};
pub use nanobanana::NanoBananaTool;
pub use provider::VertexImagenProvider;
pub use reference::{ReferenceImageResolver, ResolveStrategy};

/// A fully validated request, ready to be sent to one model method.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPlan {
    pub prompt: String,
    pub model: String,
    pub method: &'static str,
    pub payload: Value,
}

/// One piece of a model response, in response order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseContent {
    Text(String),
    /// Base64 image data as returned by the API.
    Image {
        data: String,
        mime_type: Option<String>,
    },
    /// An entry the service withheld, with its stated reason.
    Filtered(String),
}

/// A generation tool exposed to the host.
///
/// Tools only describe requests and read responses; authentication, the HTTP
/// call and message emission are shared by [`ToolInvocation`].
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Label used in error texts, e.g. `Imagen request failed (429)`.
    fn provider_label(&self) -> &str;
    /// Location used when the credentials do not name one.
    fn default_location(&self) -> &str;
    fn scopes(&self) -> &[&'static str];
    fn prepare(
        &self,
        parameters: &Map<String, Value>,
        images: &ReferenceImageResolver,
    ) -> Result<GenerationPlan, ToolError>;
    fn extract_units(&self, response: &Value) -> Result<Vec<ResponseContent>>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name.trim()).map(|tool| tool.as_ref())
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

pub fn default_tool_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(ImagenTool::new());
    tools.register(NanoBananaTool::new());
    tools
}
