//! The per-call generation flow and the lazy message sequence it produces.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::vec;

use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};
use vertex_imagen_contracts::{CredentialBundle, CredentialError, ToolError, ToolMessage};

use crate::auth::ServiceAccountSigner;
use crate::config::EngineConfig;
use crate::materialize::BlobMaterializer;
use crate::reference::ReferenceImageResolver;
use crate::vertex::{error_chain_text, VertexSession};
use crate::{ResponseContent, Tool};

/// One tool call with its credentials and parameters.
///
/// Nothing happens until the sequence returned by [`ToolInvocation::iter`] is
/// pulled. Every call to `iter` starts the whole flow again from the top, so a
/// host that re-reads the sequence gets a fresh generation.
pub struct ToolInvocation<'a> {
    tool: &'a dyn Tool,
    config: &'a EngineConfig,
    http: HttpClient,
    resolver: &'a ReferenceImageResolver,
    materializer: &'a BlobMaterializer,
    credentials: Map<String, Value>,
    parameters: Map<String, Value>,
}

impl<'a> ToolInvocation<'a> {
    pub(crate) fn new(
        tool: &'a dyn Tool,
        config: &'a EngineConfig,
        http: HttpClient,
        resolver: &'a ReferenceImageResolver,
        materializer: &'a BlobMaterializer,
        credentials: Map<String, Value>,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            tool,
            config,
            http,
            resolver,
            materializer,
            credentials,
            parameters,
        }
    }

    pub fn tool_name(&self) -> &str {
        self.tool.name()
    }

    pub fn iter(&self) -> MessageIter<'_, 'a> {
        MessageIter {
            invocation: self,
            stage: Stage::Start,
        }
    }

    /// Runs the flow to completion.
    pub fn collect_messages(&self) -> Vec<ToolMessage> {
        self.iter().collect()
    }

    /// Everything up to and including the remote call. Any failure here ends
    /// the sequence with a single text item.
    fn start(&self) -> Result<GenerationRun, ToolError> {
        let bundle = CredentialBundle::from_map(
            &self.credentials,
            &self.config.credential_key_field,
            self.tool.default_location(),
        )?;
        let account = bundle.service_account()?;
        let signer = ServiceAccountSigner::new(&account, self.tool.scopes())?;
        let session = VertexSession::new(
            self.http.clone(),
            &bundle,
            signer,
            self.config.api_base.as_deref(),
            self.config.request_timeout,
        );

        let plan = self.tool.prepare(&self.parameters, self.resolver)?;
        let token = session
            .access_token()
            .map_err(|err| CredentialError::Auth(error_chain_text(&err, 512)))?;

        let provider = self.tool.provider_label();
        tracing::info!(
            tool = self.tool.name(),
            model = %plan.model,
            project_id = session.project_id(),
            location = session.location(),
            "requesting generation"
        );
        let response = session
            .call_model(provider, &token, &plan.model, plan.method, &plan.payload)
            .map_err(|err| ToolError::RemoteGeneration(error_chain_text(&err, 512)))?;
        let mut units = self
            .tool
            .extract_units(&response)
            .map_err(|err| ToolError::RemoteGeneration(error_chain_text(&err, 512)))?;
        units.retain(|unit| !matches!(unit, ResponseContent::Text(text) if text.trim().is_empty()));
        if units.is_empty() {
            return Err(ToolError::RemoteGeneration("no images returned".to_string()));
        }

        Ok(GenerationRun {
            prompt: plan.prompt,
            units: units.into_iter(),
            image_slots: 0,
            images: 0,
            item_errors: 0,
        })
    }

    fn emit_unit(&self, run: &mut GenerationRun, unit: ResponseContent) -> ToolMessage {
        match unit {
            ResponseContent::Text(text) => ToolMessage::text(text),
            ResponseContent::Filtered(reason) => {
                run.image_slots += 1;
                tracing::warn!(
                    tool = self.tool.name(),
                    image = run.image_slots,
                    %reason,
                    "image withheld by safety filter"
                );
                ToolMessage::text(format!(
                    "Image {} was blocked by the safety filter: {reason}",
                    run.image_slots
                ))
            }
            ResponseContent::Image { data, mime_type } => {
                let position = run.image_slots;
                run.image_slots += 1;
                match self.materializer.materialize(&data) {
                    Ok(bytes) => {
                        run.images += 1;
                        tracing::debug!(
                            tool = self.tool.name(),
                            image = position + 1,
                            bytes = bytes.len(),
                            source_mime = mime_type.as_deref().unwrap_or("unknown"),
                            "image materialized"
                        );
                        ToolMessage::generated_image(
                            bytes,
                            self.tool.name(),
                            position,
                            &run.prompt,
                        )
                    }
                    Err(err) => {
                        run.item_errors += 1;
                        let error = ToolError::ItemProcessing {
                            index: position + 1,
                            message: error_chain_text(&err, 256),
                        };
                        tracing::warn!(
                            tool = self.tool.name(),
                            kind = error.kind(),
                            error = %error,
                            "image skipped"
                        );
                        ToolMessage::text(error.to_string())
                    }
                }
            }
        }
    }
}

impl<'i, 'a> IntoIterator for &'i ToolInvocation<'a> {
    type Item = ToolMessage;
    type IntoIter = MessageIter<'i, 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

struct GenerationRun {
    prompt: String,
    units: vec::IntoIter<ResponseContent>,
    image_slots: usize,
    images: usize,
    item_errors: usize,
}

enum Stage {
    Start,
    Emitting(GenerationRun),
    Done,
}

/// Lazy, finite sequence of output messages for one pass over an invocation.
///
/// The remote call is made on the first `next`; each image is decoded when its
/// item is pulled. A panic anywhere in the flow ends the sequence with an
/// `Unexpected error` text item.
pub struct MessageIter<'i, 'a> {
    invocation: &'i ToolInvocation<'a>,
    stage: Stage,
}

impl MessageIter<'_, '_> {
    fn advance(&mut self) -> Option<ToolMessage> {
        let invocation = self.invocation;
        let mut run = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Start => match invocation.start() {
                Ok(run) => run,
                Err(err) => {
                    tracing::warn!(
                        tool = invocation.tool.name(),
                        kind = err.kind(),
                        error = %err,
                        "invocation failed"
                    );
                    return Some(ToolMessage::text(err.to_string()));
                }
            },
            Stage::Emitting(run) => run,
            Stage::Done => return None,
        };
        let Some(unit) = run.units.next() else {
            tracing::info!(
                tool = invocation.tool.name(),
                images = run.images,
                item_errors = run.item_errors,
                "invocation finished"
            );
            return None;
        };
        let message = invocation.emit_unit(&mut run, unit);
        self.stage = Stage::Emitting(run);
        Some(message)
    }
}

impl Iterator for MessageIter<'_, '_> {
    type Item = ToolMessage;

    fn next(&mut self) -> Option<ToolMessage> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.advance())) {
            Ok(message) => message,
            Err(payload) => {
                self.stage = Stage::Done;
                let error = ToolError::Unexpected(panic_message(payload.as_ref()));
                tracing::error!(tool = self.invocation.tool.name(), error = %error, "invocation panicked");
                Some(ToolMessage::text(error.to_string()))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "panic without message".to_string()
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use mockito::{Matcher, Mock, ServerGuard};
    use serde_json::json;

    use super::*;
    use crate::auth::tests::test_service_account;
    use crate::provider::VertexImagenProvider;
    use crate::reference::tests::png_fixture;

    const IMAGEN_PATH: &str =
        "/v1/projects/demo-project/locations/us-central1/publishers/google/models/imagen-3.0-generate-001:predict";
    const GEMINI_PATH: &str =
        "/v1/projects/demo-project/locations/global/publishers/google/models/gemini-2.5-flash-image:generateContent";

    fn map_object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn encoded_key(server: &ServerGuard) -> String {
        let info = test_service_account(&format!("{}/token", server.url()));
        BASE64.encode(serde_json::to_vec(&info).unwrap())
    }

    fn credentials(server: &ServerGuard, location: Option<&str>) -> Map<String, Value> {
        let mut map = map_object(json!({
            "project_id": "demo-project",
            "vertex_service_account_key": encoded_key(server),
        }));
        if let Some(location) = location {
            map.insert("location".to_string(), json!(location));
        }
        map
    }

    fn provider(server: &ServerGuard, scratch: &std::path::Path) -> VertexImagenProvider {
        let config = EngineConfig {
            api_base: Some(server.url()),
            internal_image_host: Some(server.url()),
            ..EngineConfig::default()
        };
        VertexImagenProvider::new(config).with_materializer(BlobMaterializer::in_dir(scratch))
    }

    fn token_mock(server: &mut ServerGuard, hits: usize) -> Mock {
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.test","expires_in":3600}"#)
            .expect(hits)
            .create()
    }

    fn texts(messages: &[ToolMessage]) -> Vec<&str> {
        messages.iter().filter_map(ToolMessage::as_text).collect()
    }

    #[test]
    fn out_of_range_count_fails_without_remote_calls() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let token = token_mock(&mut server, 0);
        let predict = server.mock("POST", IMAGEN_PATH).expect(0).create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        for count in [json!(0), json!(5), json!("12")] {
            let invocation = provider.invoke(
                "imagen",
                credentials(&server, Some("us-central1")),
                map_object(json!({ "prompt": "a red fox", "number_of_images": count })),
            )?;
            let messages = invocation.collect_messages();
            assert_eq!(messages.len(), 1);
            assert_eq!(
                messages[0].as_text(),
                Some("Number of images must be between 1 and 4")
            );
        }
        token.assert();
        predict.assert();
        Ok(())
    }

    #[test]
    fn empty_prompt_fails_without_remote_calls() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let token = token_mock(&mut server, 0);
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "imagen",
            credentials(&server, None),
            map_object(json!({ "prompt": "   " })),
        )?;
        let messages = invocation.collect_messages();
        assert_eq!(texts(&messages), vec!["Prompt is required to generate images"]);
        token.assert();
        Ok(())
    }

    #[test]
    fn malformed_keys_report_a_format_problem() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let token = token_mock(&mut server, 0);
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let not_base64 = "not base64 at all!";
        let not_json = BASE64.encode(b"{ this is not json");
        let mut seen = Vec::new();
        for key in [not_base64.to_string(), not_json] {
            let invocation = provider.invoke(
                "imagen",
                map_object(json!({
                    "project_id": "demo-project",
                    "vertex_service_account_key": key,
                })),
                map_object(json!({ "prompt": "a red fox" })),
            )?;
            let messages = invocation.collect_messages();
            assert_eq!(messages.len(), 1);
            let text = messages[0].as_text().unwrap_or_default().to_string();
            assert!(text.starts_with("Invalid service account key format"), "{text}");
            seen.push(text);
        }
        assert_ne!(seen[0], seen[1]);
        token.assert();
        Ok(())
    }

    #[test]
    fn missing_credentials_emit_single_error() -> anyhow::Result<()> {
        let server = mockito::Server::new();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "nanobanana",
            map_object(json!({ "project_id": "demo-project", "vertex_service_account_key": "" })),
            map_object(json!({ "prompt": "a red fox" })),
        )?;
        assert_eq!(
            texts(&invocation.collect_messages()),
            vec!["Missing required credentials: project_id and service_account_key are required"]
        );
        Ok(())
    }

    #[test]
    fn every_returned_image_becomes_a_png_blob() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = token_mock(&mut server, 1);
        let predictions = (1..=3u8)
            .map(|seed| json!({ "bytesBase64Encoded": BASE64.encode(png_fixture(seed * 40)), "mimeType": "image/png" }))
            .collect::<Vec<Value>>();
        let predict = server
            .mock("POST", IMAGEN_PATH)
            .match_header("authorization", "Bearer ya29.test")
            .match_body(Matcher::PartialJson(json!({
                "instances": [{ "prompt": "three lighthouses" }],
                "parameters": { "sampleCount": 3 },
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "predictions": predictions }).to_string())
            .expect(1)
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "imagen",
            credentials(&server, Some("us-central1")),
            map_object(json!({ "prompt": "three lighthouses", "number_of_images": 3 })),
        )?;
        let messages = invocation.collect_messages();
        predict.assert();
        assert_eq!(messages.len(), 3);
        for (position, message) in messages.iter().enumerate() {
            let (bytes, meta) = message.as_blob().expect("blob message");
            assert_eq!(bytes, png_fixture((position as u8 + 1) * 40).as_slice());
            assert_eq!(meta.mime_type, "image/png");
            assert_eq!(meta.filename, format!("imagen_generated_{}.png", position + 1));
            assert_eq!(meta.alt, "three lighthouses");
        }
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn corrupt_image_reports_its_index_and_keeps_the_rest() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = token_mock(&mut server, 1);
        let body = json!({
            "predictions": [
                { "bytesBase64Encoded": BASE64.encode(png_fixture(1)) },
                { "bytesBase64Encoded": BASE64.encode(b"garbage, not a png") },
                { "raiFilteredReason": "Filtered for safety." },
                { "bytesBase64Encoded": BASE64.encode(png_fixture(4)) },
            ]
        });
        let _predict = server
            .mock("POST", IMAGEN_PATH)
            .with_status(200)
            .with_body(body.to_string())
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "imagen",
            credentials(&server, None),
            map_object(json!({ "prompt": "four cats", "number_of_images": 4 })),
        )?;
        let messages = invocation.collect_messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0].as_blob().map(|(_, meta)| meta.filename.as_str()),
            Some("imagen_generated_1.png")
        );
        let error = messages[1].as_text().unwrap_or_default();
        assert!(error.starts_with("Error processing image 2: "), "{error}");
        assert_eq!(
            messages[2].as_text(),
            Some("Image 3 was blocked by the safety filter: Filtered for safety.")
        );
        assert_eq!(
            messages[3].as_blob().map(|(_, meta)| meta.filename.as_str()),
            Some("imagen_generated_4.png")
        );
        Ok(())
    }

    #[test]
    fn remote_failures_and_empty_results_become_error_text() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = token_mock(&mut server, 2);
        let quota = server
            .mock("POST", IMAGEN_PATH)
            .with_status(429)
            .with_body(r#"{"error":{"message":"Quota exceeded for aiplatform.googleapis.com"}}"#)
            .expect(1)
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());
        let params = map_object(json!({ "prompt": "a red fox" }));

        let invocation = provider.invoke("imagen", credentials(&server, None), params.clone())?;
        let messages = invocation.collect_messages();
        assert_eq!(messages.len(), 1);
        let text = messages[0].as_text().unwrap_or_default();
        assert!(text.starts_with("Error generating images: "));
        assert!(text.contains("Quota exceeded"));
        quota.assert();
        quota.remove();

        let _empty = server
            .mock("POST", IMAGEN_PATH)
            .with_status(200)
            .with_body(r#"{"predictions":[]}"#)
            .create();
        let invocation = provider.invoke("imagen", credentials(&server, None), params)?;
        assert_eq!(
            texts(&invocation.collect_messages()),
            vec!["Error generating images: no images returned"]
        );
        Ok(())
    }

    #[test]
    fn blank_text_only_response_still_yields_an_error_message() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = token_mock(&mut server, 1);
        let _generate = server
            .mock("POST", GEMINI_PATH)
            .with_status(200)
            .with_body(
                r#"{"candidates":[{"content":{"parts":[{"text":"  "}]},"finishReason":"STOP"}]}"#,
            )
            .expect(1)
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "nanobanana",
            credentials(&server, None),
            map_object(json!({ "prompt": "a red fox" })),
        )?;
        assert_eq!(
            texts(&invocation.collect_messages()),
            vec!["Error generating images: no images returned"]
        );
        Ok(())
    }

    #[test]
    fn rejected_token_is_a_credential_error() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#)
            .expect(1)
            .create();
        let predict = server.mock("POST", IMAGEN_PATH).expect(0).create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "imagen",
            credentials(&server, None),
            map_object(json!({ "prompt": "a red fox" })),
        )?;
        let messages = invocation.collect_messages();
        assert_eq!(messages.len(), 1);
        let text = messages[0].as_text().unwrap_or_default();
        assert!(text.starts_with("Service account authentication failed: "), "{text}");
        assert!(text.contains("Invalid JWT Signature."));
        predict.assert();
        Ok(())
    }

    #[test]
    fn edit_resolves_reference_through_internal_host() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _token = token_mock(&mut server, 1);
        let reference = png_fixture(77);
        let fetch = server
            .mock("GET", "/files/tools/ref.png")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(reference.clone())
            .expect(1)
            .create();
        let generate = server
            .mock("POST", GEMINI_PATH)
            .match_body(Matcher::PartialJson(json!({
                "generationConfig": { "responseModalities": ["IMAGE", "TEXT"] },
            })))
            .with_status(200)
            .with_body(
                json!({
                    "candidates": [{
                        "content": { "parts": [
                            { "text": "Sky repainted." },
                            { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(png_fixture(9)) } },
                        ]},
                        "finishReason": "STOP"
                    }]
                })
                .to_string(),
            )
            .expect(1)
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "nanobanana",
            credentials(&server, None),
            map_object(json!({
                "prompt": "make the sky purple",
                "image": {
                    "remote_url": "https://dify.example.invalid/files/tools/ref.png?sign=abc",
                    "mime_type": "image/png",
                },
            })),
        )?;
        let messages = invocation.collect_messages();
        fetch.assert();
        generate.assert();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_text(), Some("Sky repainted."));
        let (bytes, meta) = messages[1].as_blob().expect("blob");
        assert_eq!(bytes, png_fixture(9).as_slice());
        assert_eq!(meta.filename, "nanobanana_generated_1.png");
        Ok(())
    }

    #[test]
    fn unreadable_reference_image_stops_before_generation() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let token = token_mock(&mut server, 0);
        let generate = server.mock("POST", GEMINI_PATH).expect(0).create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());

        let invocation = provider.invoke(
            "nanobanana",
            credentials(&server, None),
            map_object(json!({
                "prompt": "edit",
                "image": { "blob": BASE64.encode(b"not an image") },
            })),
        )?;
        let messages = invocation.collect_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0]
            .as_text()
            .unwrap_or_default()
            .starts_with("Error loading image: "));
        token.assert();
        generate.assert();
        Ok(())
    }

    #[test]
    fn each_pass_reruns_the_flow_lazily() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let token = token_mock(&mut server, 2);
        let predict = server
            .mock("POST", IMAGEN_PATH)
            .with_status(200)
            .with_body(
                json!({ "predictions": [{ "bytesBase64Encoded": BASE64.encode(png_fixture(5)) }] })
                    .to_string(),
            )
            .expect(2)
            .create();
        let scratch = tempfile::tempdir()?;
        let provider = provider(&server, scratch.path());
        let invocation = provider.invoke(
            "imagen",
            credentials(&server, None),
            map_object(json!({ "prompt": "a red fox" })),
        )?;

        let pending = invocation.iter();
        assert!(!predict.matched());
        drop(pending);

        let first = (&invocation).into_iter().collect::<Vec<ToolMessage>>();
        let second = invocation.collect_messages();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        token.assert();
        predict.assert();
        Ok(())
    }

    struct PanickingTool;

    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn provider_label(&self) -> &str {
            "Panicky"
        }
        fn default_location(&self) -> &str {
            "us-central1"
        }
        fn scopes(&self) -> &[&'static str] {
            &[]
        }
        fn prepare(
            &self,
            _parameters: &Map<String, Value>,
            _images: &ReferenceImageResolver,
        ) -> Result<crate::GenerationPlan, ToolError> {
            panic!("tool exploded")
        }
        fn extract_units(&self, _response: &Value) -> anyhow::Result<Vec<ResponseContent>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn panics_end_the_sequence_with_unexpected_error() -> anyhow::Result<()> {
        let server = mockito::Server::new();
        let config = EngineConfig::default();
        let resolver = ReferenceImageResolver::new(HttpClient::new(), &config);
        let materializer = BlobMaterializer::new();
        let invocation = ToolInvocation::new(
            &PanickingTool,
            &config,
            HttpClient::new(),
            &resolver,
            &materializer,
            credentials(&server, None),
            Map::new(),
        );

        let mut messages = invocation.iter();
        assert_eq!(
            messages.next().and_then(|message| message.as_text().map(str::to_string)),
            Some("Unexpected error: tool exploded".to_string())
        );
        assert!(messages.next().is_none());
        Ok(())
    }
}
