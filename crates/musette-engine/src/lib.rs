use std::env;
use std::io::Cursor;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use musette_contracts::generation::{GenerationRequest, Modality, Provider};
use musette_contracts::metrics::OutcomeAggregator;
use musette_contracts::models::ToolSpec;
use musette_contracts::telemetry::TelemetryWriter;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use thiserror::Error;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const IMAGE_EDGE: u32 = 1024;
const UPSCALED_EDGE: u32 = 3000;
const STYLE_PRESET: &str = "photographic";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("parameter '{key}' is not valid for {modality} generation")]
    InvalidParameterKind { key: String, modality: Modality },
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("image decode failed: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, GenerateError>;

/// What a successful generation hands back to the form host.
#[derive(Debug, Clone)]
pub enum GenerationResult {
    Text(String),
    Artwork(ProcessedArtwork),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedPayload {
    Text(String),
    ImageBytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ProcessedArtwork {
    pub original_png: Vec<u8>,
    pub upscaled_png: Vec<u8>,
    pub original_dims: (u32, u32),
    pub upscaled_dims: (u32, u32),
}

/// Serialize the exact request body the tool's provider expects.
///
/// Pure: override keys are validated against the modality before anything is
/// assembled, and no defaults leak across providers.
pub fn build_payload(tool: &ToolSpec, request: &GenerationRequest) -> Result<Value> {
    for key in request.overrides.keys() {
        if !tool.modality.accepts_key(key) {
            return Err(GenerateError::InvalidParameterKind {
                key: key.clone(),
                modality: tool.modality,
            });
        }
    }
    match tool.provider {
        Provider::Anthropic => Ok(anthropic_payload(tool, request)),
        Provider::Meta => Ok(meta_payload(tool, request)),
        Provider::Stability => Ok(stability_payload(tool, request)),
    }
}

fn anthropic_payload(tool: &ToolSpec, request: &GenerationRequest) -> Value {
    let mut payload = map_object(json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": json_number(resolved(tool, request, "max_tokens", 4096.0)),
        "messages": [
            {"role": "user", "content": request.prompt}
        ],
        "temperature": json_number(resolved(tool, request, "temperature", 0.7)),
        "top_p": json_number(resolved(tool, request, "top_p", 0.99)),
    }));
    if let Some(top_k) = resolved_opt(tool, request, "top_k") {
        payload.insert("top_k".to_string(), json_number(top_k));
    }
    Value::Object(payload)
}

fn meta_payload(tool: &ToolSpec, request: &GenerationRequest) -> Value {
    let mut payload = map_object(json!({
        "prompt": llama_chat_prompt(&request.prompt),
        "max_gen_len": json_number(resolved(tool, request, "max_gen_len", 512.0)),
        "temperature": json_number(resolved(tool, request, "temperature", 0.5)),
        "top_p": json_number(resolved(tool, request, "top_p", 0.9)),
    }));
    if tool.modality == Modality::TextAndVision {
        if let Some(image_ref) = request
            .image_ref
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            payload.insert("image".to_string(), Value::String(image_ref.to_string()));
        }
    }
    Value::Object(payload)
}

fn stability_payload(tool: &ToolSpec, request: &GenerationRequest) -> Value {
    json!({
        "text_prompts": [
            {"text": request.prompt, "weight": 1.0}
        ],
        "cfg_scale": json_number(resolved(tool, request, "cfg_scale", 10.0)),
        "steps": json_number(resolved(tool, request, "steps", 50.0)),
        "seed": json_number(resolved(tool, request, "seed", 42.0)),
        "width": IMAGE_EDGE,
        "height": IMAGE_EDGE,
        "style_preset": STYLE_PRESET,
        "samples": 1,
    })
}

/// Single user turn followed by the assistant-turn opener, Llama 3 instruct
/// delimiters.
fn llama_chat_prompt(prompt: &str) -> String {
    format!(
        "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
    )
}

/// Blocking client for the hosted inference endpoints.
///
/// Every invocation carrying a group label lands in the injected
/// [`OutcomeAggregator`], success or failure alike. No retries, no timeout
/// beyond the transport default.
pub struct InferenceGateway {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    outcomes: OutcomeAggregator,
    telemetry: Option<TelemetryWriter>,
}

impl InferenceGateway {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, outcomes: OutcomeAggregator) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            http: HttpClient::new(),
            outcomes,
            telemetry: None,
        }
    }

    pub fn from_env(outcomes: OutcomeAggregator) -> Self {
        let api_base = env::var("BEDROCK_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                let region =
                    non_empty_env("BEDROCK_REGION").unwrap_or_else(|| "us-east-1".to_string());
                format!("https://bedrock-runtime.{region}.amazonaws.com")
            });
        Self::new(api_base, non_empty_env("BEDROCK_API_KEY"), outcomes)
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryWriter) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn outcomes(&self) -> &OutcomeAggregator {
        &self.outcomes
    }

    /// Send a built payload to `endpoint_id` and decode the JSON body.
    pub fn invoke(
        &self,
        endpoint_id: &str,
        payload: &Value,
        group: Option<&str>,
    ) -> Result<Value> {
        if let Some(group) = group {
            self.outcomes.record_attempt(group);
        }
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.request_started(endpoint_id, group);
        }

        let started = Instant::now();
        let outcome = self.send(endpoint_id, payload);
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(group) = group {
            match &outcome {
                Ok(_) => self.outcomes.record_success(group, elapsed),
                Err(_) => self.outcomes.record_failure(group),
            }
        }
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.request_finished(endpoint_id, outcome.is_ok(), elapsed);
        }
        outcome
    }

    /// Builder, gateway, normalizer, and (for image tools) post-processor in
    /// one pass. Local validation failures never reach the network or the
    /// outcome tally.
    pub fn generate(
        &self,
        tool: &ToolSpec,
        request: &GenerationRequest,
        group: Option<&str>,
    ) -> Result<GenerationResult> {
        let payload = build_payload(tool, request)?;
        let body = self.invoke(&tool.endpoint_id, &payload, group)?;
        match normalize_response(tool.provider, &body)? {
            NormalizedPayload::Text(text) => Ok(GenerationResult::Text(text)),
            NormalizedPayload::ImageBytes(bytes) => {
                Ok(GenerationResult::Artwork(process_artwork(&bytes)?))
            }
        }
    }

    fn send(&self, endpoint_id: &str, payload: &Value) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerateError::Gateway("BEDROCK_API_KEY not set".to_string()));
        };
        let endpoint = format!("{}/model/{}/invoke", self.api_base, endpoint_id);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .map_err(|err| GenerateError::Gateway(format!("request failed ({endpoint}): {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerateError::Gateway(format!(
                "invoke failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            )));
        }
        response
            .json()
            .map_err(|err| GenerateError::Gateway(format!("invalid response body: {err}")))
    }
}

/// Pull the generated text or image bytes out of the provider envelope.
pub fn normalize_response(provider: Provider, body: &Value) -> Result<NormalizedPayload> {
    match provider {
        Provider::Anthropic => body
            .get("content")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("text"))
            .and_then(Value::as_str)
            .map(|text| NormalizedPayload::Text(text.to_string()))
            .ok_or_else(|| {
                GenerateError::MalformedResponse(
                    "anthropic response missing content[0].text".to_string(),
                )
            }),
        // Lenient by contract: an absent generation field reads as empty.
        Provider::Meta => Ok(NormalizedPayload::Text(
            body.get("generation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        Provider::Stability => {
            let encoded = body
                .get("artifacts")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("base64"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    GenerateError::MalformedResponse(
                        "stability response missing artifacts[0].base64".to_string(),
                    )
                })?;
            let bytes = BASE64.decode(encoded.as_bytes()).map_err(|err| {
                GenerateError::MalformedResponse(format!("artifact base64 decode failed: {err}"))
            })?;
            Ok(NormalizedPayload::ImageBytes(bytes))
        }
    }
}

/// Decode raw artifact bytes, keep the original, and upscale to 3000x3000
/// with Lanczos resampling; both versions come back PNG-encoded.
pub fn process_artwork(raw: &[u8]) -> Result<ProcessedArtwork> {
    let decoded =
        image::load_from_memory(raw).map_err(|err| GenerateError::Decode(err.to_string()))?;
    let original_dims = (decoded.width(), decoded.height());
    let upscaled = decoded.resize_exact(UPSCALED_EDGE, UPSCALED_EDGE, FilterType::Lanczos3);
    Ok(ProcessedArtwork {
        original_png: encode_png(&decoded)?,
        upscaled_png: encode_png(&upscaled)?,
        original_dims,
        upscaled_dims: (UPSCALED_EDGE, UPSCALED_EDGE),
    })
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| GenerateError::Decode(format!("png encode failed: {err}")))?;
    Ok(buffer.into_inner())
}

fn resolved(tool: &ToolSpec, request: &GenerationRequest, key: &str, fallback: f64) -> f64 {
    resolved_opt(tool, request, key).unwrap_or(fallback)
}

fn resolved_opt(tool: &ToolSpec, request: &GenerationRequest, key: &str) -> Option<f64> {
    request
        .overrides
        .get(key)
        .copied()
        .or_else(|| tool.default_params.get(key).copied())
}

// Integral values go out as JSON integers so the wire shape matches what the
// endpoints document (steps: 50, not 50.0).
fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number((value as i64).into())
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let head: String = value.chars().take(max_chars).collect();
    format!("{head}…")
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use indexmap::IndexMap;
    use musette_contracts::generation::{GenerationRequest, Modality, Provider};
    use musette_contracts::metrics::OutcomeAggregator;
    use musette_contracts::models::{ToolRegistry, ToolSpec};
    use musette_contracts::telemetry::TelemetryWriter;
    use serde_json::{json, Value};

    use super::{
        build_payload, json_number, llama_chat_prompt, normalize_response, process_artwork,
        GenerateError, InferenceGateway, NormalizedPayload, BASE64,
    };

    fn tool(name: &str) -> ToolSpec {
        ToolRegistry::new(None).get(name).cloned().unwrap()
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest::from_prompt(prompt)
    }

    #[test]
    fn anthropic_payload_carries_defaults_and_prompt() {
        let payload = build_payload(&tool("EPK Generator"), &request("tell my story")).unwrap();
        assert_eq!(payload["anthropic_version"], json!("bedrock-2023-05-31"));
        assert_eq!(payload["max_tokens"], json!(4096));
        assert_eq!(payload["temperature"], json!(0.7));
        assert_eq!(payload["top_p"], json!(0.99));
        assert_eq!(payload["messages"][0]["role"], json!("user"));
        assert_eq!(payload["messages"][0]["content"], json!("tell my story"));
        assert!(payload.get("top_k").is_none());
    }

    #[test]
    fn anthropic_payload_honors_overrides_and_optional_top_k() {
        let mut req = request("tell my story");
        req.overrides.insert("temperature".to_string(), 0.2);
        req.overrides.insert("top_k".to_string(), 40.0);
        req.overrides.insert("max_tokens".to_string(), 1024.0);
        let payload = build_payload(&tool("EPK Generator"), &req).unwrap();
        assert_eq!(payload["temperature"], json!(0.2));
        assert_eq!(payload["top_k"], json!(40));
        assert_eq!(payload["max_tokens"], json!(1024));
    }

    #[test]
    fn meta_payload_wraps_prompt_in_instruct_template() {
        let payload = build_payload(&tool("Lyric Draft Assistant"), &request("verse two")).unwrap();
        let wrapped = payload["prompt"].as_str().unwrap();
        assert!(wrapped.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>"));
        assert!(wrapped.contains("verse two"));
        assert!(wrapped.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert_eq!(payload["max_gen_len"], json!(512));
        assert_eq!(payload["temperature"], json!(0.5));
        assert_eq!(payload["top_p"], json!(0.9));
        assert!(payload.get("image").is_none());
    }

    #[test]
    fn meta_vision_payload_includes_image_only_when_supplied() {
        let spec = tool("Artwork Reviewer");

        let bare = build_payload(&spec, &request("rate this cover")).unwrap();
        assert!(bare.get("image").is_none());

        let mut with_image = request("rate this cover");
        with_image.image_ref = Some("https://cdn.example/cover.png".to_string());
        let payload = build_payload(&spec, &with_image).unwrap();
        assert_eq!(payload["image"], json!("https://cdn.example/cover.png"));

        let mut blank = request("rate this cover");
        blank.image_ref = Some("   ".to_string());
        let payload = build_payload(&spec, &blank).unwrap();
        assert!(payload.get("image").is_none());
    }

    #[test]
    fn stability_payload_matches_documented_shape_exactly() {
        let payload = build_payload(&tool("Album Art Creator"), &request("neon skyline")).unwrap();
        assert_eq!(
            payload,
            json!({
                "text_prompts": [{"text": "neon skyline", "weight": 1.0}],
                "cfg_scale": 10,
                "steps": 50,
                "seed": 42,
                "width": 1024,
                "height": 1024,
                "style_preset": "photographic",
                "samples": 1,
            })
        );
    }

    #[test]
    fn out_of_modality_override_is_rejected_before_assembly() {
        let mut req = request("tell my story");
        req.overrides.insert("steps".to_string(), 30.0);
        let err = build_payload(&tool("EPK Generator"), &req).unwrap_err();
        match err {
            GenerateError::InvalidParameterKind { key, modality } => {
                assert_eq!(key, "steps");
                assert_eq!(modality, Modality::Text);
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut req = request("neon skyline");
        req.overrides.insert("temperature".to_string(), 0.4);
        let err = build_payload(&tool("Album Art Creator"), &req).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidParameterKind { .. }));
    }

    #[test]
    fn llama_template_is_a_single_turn() {
        let wrapped = llama_chat_prompt("hello");
        assert_eq!(wrapped.matches("<|eot_id|>").count(), 1);
        assert_eq!(wrapped.matches("user").count(), 1);
    }

    #[test]
    fn json_number_keeps_integers_integral() {
        assert_eq!(json_number(50.0), json!(50));
        assert_eq!(json_number(-3.0), json!(-3));
        assert_eq!(json_number(0.99), json!(0.99));
    }

    #[test]
    fn anthropic_normalizer_extracts_first_content_text() {
        let body = json!({"content": [{"type": "text", "text": "press kit"}]});
        assert_eq!(
            normalize_response(Provider::Anthropic, &body).unwrap(),
            NormalizedPayload::Text("press kit".to_string())
        );

        for malformed in [json!({}), json!({"content": []}), json!({"content": [{}]})] {
            let err = normalize_response(Provider::Anthropic, &malformed).unwrap_err();
            assert!(matches!(err, GenerateError::MalformedResponse(_)));
        }
    }

    #[test]
    fn meta_normalizer_is_lenient_about_missing_generation() {
        let body = json!({"generation": "chorus idea"});
        assert_eq!(
            normalize_response(Provider::Meta, &body).unwrap(),
            NormalizedPayload::Text("chorus idea".to_string())
        );
        assert_eq!(
            normalize_response(Provider::Meta, &json!({})).unwrap(),
            NormalizedPayload::Text(String::new())
        );
    }

    #[test]
    fn stability_normalizer_round_trips_artifact_bytes() {
        let raw: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-a-png";
        let body = json!({"artifacts": [{"base64": BASE64.encode(raw)}]});
        assert_eq!(
            normalize_response(Provider::Stability, &body).unwrap(),
            NormalizedPayload::ImageBytes(raw.to_vec())
        );
    }

    #[test]
    fn stability_normalizer_rejects_missing_or_bad_artifacts() {
        for malformed in [
            json!({}),
            json!({"artifacts": []}),
            json!({"artifacts": [{"base64": ""}]}),
            json!({"artifacts": [{"base64": "!!!not base64!!!"}]}),
        ] {
            let err = normalize_response(Provider::Stability, &malformed).unwrap_err();
            assert!(matches!(err, GenerateError::MalformedResponse(_)));
        }
    }

    #[test]
    fn process_artwork_upscales_to_fixed_dims() {
        let source = RgbImage::from_pixel(1024, 1024, Rgb([180, 40, 90]));
        let mut encoded = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(source)
            .write_to(&mut encoded, image::ImageFormat::Png)
            .unwrap();

        let processed = process_artwork(encoded.get_ref()).unwrap();
        assert_eq!(processed.original_dims, (1024, 1024));
        assert_eq!(processed.upscaled_dims, (3000, 3000));

        let original = image::load_from_memory(&processed.original_png).unwrap();
        assert_eq!((original.width(), original.height()), (1024, 1024));
        let upscaled = image::load_from_memory(&processed.upscaled_png).unwrap();
        assert_eq!((upscaled.width(), upscaled.height()), (3000, 3000));
    }

    #[test]
    fn process_artwork_rejects_garbage_bytes() {
        let err = process_artwork(b"definitely not an image").unwrap_err();
        assert!(matches!(err, GenerateError::Decode(_)));
    }

    #[test]
    fn gateway_failure_is_typed_and_tallied() {
        let outcomes = OutcomeAggregator::new();
        // Port 9 (discard) refuses connections; nothing leaves the host.
        let gateway = InferenceGateway::new(
            "http://127.0.0.1:9",
            Some("test-key".to_string()),
            outcomes.clone(),
        );
        let err = gateway
            .invoke("anthropic.claude-3-sonnet-20240229-v1:0", &json!({}), Some("indie"))
            .unwrap_err();
        assert!(matches!(err, GenerateError::Gateway(_)));

        let snapshot = outcomes.snapshot();
        let metrics = snapshot.get("indie").unwrap();
        assert_eq!(metrics.attempted, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.succeeded, 0);
        assert!(metrics.latencies_seconds.is_empty());
    }

    #[test]
    fn gateway_without_credentials_fails_before_the_wire() {
        let outcomes = OutcomeAggregator::new();
        let gateway = InferenceGateway::new("http://127.0.0.1:9", None, outcomes.clone());
        let err = gateway.invoke("any-endpoint", &json!({}), Some("indie")).unwrap_err();
        match err {
            GenerateError::Gateway(message) => assert!(message.contains("BEDROCK_API_KEY")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(outcomes.success_rate("indie"), 0.0);
    }

    #[test]
    fn gateway_emits_request_lifecycle_telemetry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("telemetry.jsonl");
        let gateway = InferenceGateway::new(
            "http://127.0.0.1:9",
            Some("test-key".to_string()),
            OutcomeAggregator::new(),
        )
        .with_telemetry(TelemetryWriter::new(&path, "session-1"));

        let _ = gateway.invoke("meta.llama3-70b-instruct-v1:0", &json!({}), None);

        let raw = std::fs::read_to_string(&path)?;
        let events: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(events, vec!["request_started", "request_failed"]);
        Ok(())
    }

    #[test]
    fn generate_rejects_bad_overrides_without_touching_the_tally() {
        let outcomes = OutcomeAggregator::new();
        let gateway = InferenceGateway::new(
            "http://127.0.0.1:9",
            Some("test-key".to_string()),
            outcomes.clone(),
        );
        let mut req = request("neon skyline");
        req.overrides.insert("top_p".to_string(), 0.5);
        let err = gateway
            .generate(&tool("Album Art Creator"), &req, Some("indie"))
            .unwrap_err();
        assert!(matches!(err, GenerateError::InvalidParameterKind { .. }));
        assert!(outcomes.group_names().is_empty());
    }

    #[test]
    fn override_map_type_matches_contracts() {
        // overrides is an ordered map; first invalid key is the one reported
        let mut overrides = IndexMap::new();
        overrides.insert("seed".to_string(), 7.0);
        overrides.insert("steps".to_string(), 20.0);
        let req = GenerationRequest {
            prompt: "solo".to_string(),
            image_ref: None,
            overrides,
        };
        let err = build_payload(&tool("Marketing Advisor"), &req).unwrap_err();
        match err {
            GenerateError::InvalidParameterKind { key, .. } => assert_eq!(key, "seed"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
