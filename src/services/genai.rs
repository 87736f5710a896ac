use crate::core::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One element of a multi-part capability request, in order: the text
/// part first, then any inline images.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    InlineImage { data: Vec<u8>, mime_type: String },
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub quality: String,
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub system_instruction: Option<String>,
    /// JSON schema the response must conform to.
    pub response_schema: Option<serde_json::Value>,
    /// Search-augmented generation. The provider rejects calls that
    /// declare both a schema and search tooling.
    pub search_grounding: bool,
    /// Request inline image output instead of text.
    pub image_output: Option<ImageConfig>,
}

impl InvokeOptions {
    pub fn with_schema(schema: serde_json::Value) -> Self {
        Self {
            response_schema: Some(schema),
            ..Self::default()
        }
    }

    pub fn with_search() -> Self {
        Self {
            search_grounding: true,
            ..Self::default()
        }
    }

    pub fn for_images(config: ImageConfig) -> Self {
        Self {
            image_output: Some(config),
            ..Self::default()
        }
    }

    pub fn system(mut self, instruction: &str) -> Self {
        self.system_instruction = Some(instruction.to_string());
        self
    }
}

#[derive(Debug, Default)]
pub struct GenAiResponse {
    pub text: Option<String>,
    /// Decoded inline image parts as (bytes, mime type).
    pub inline_images: Vec<(Vec<u8>, String)>,
}

#[async_trait]
pub trait GenAiClient: Send + Sync + Debug {
    async fn invoke(&self, parts: &[Part], options: &InvokeOptions) -> Result<GenAiResponse>;
}

pub fn create_genai(config: &Config) -> Result<Box<dyn GenAiClient>> {
    match config.genai.provider.as_str() {
        "gemini" => {
            let cfg = config.genai.gemini.as_ref().context("Gemini config missing")?;
            Ok(Box::new(GeminiClient::new(
                &cfg.api_key,
                &cfg.model,
                &cfg.image_model,
            )))
        }
        other => Err(anyhow!("Unknown generation provider: {}", other)),
    }
}

// --- Gemini ---

#[derive(Debug)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    image_model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, image_model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            image_model: image_model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Serialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(rename = "responseModalities", skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
    #[serde(rename = "imageConfig", skip_serializing_if = "Option::is_none")]
    image_config: Option<GeminiImageConfig>,
}

#[derive(Serialize)]
struct GeminiImageConfig {
    #[serde(rename = "imageSize")]
    image_size: String,
}

fn image_size_for_quality(quality: &str) -> String {
    match quality {
        "high" => "2K".to_string(),
        "standard" | "" => "1K".to_string(),
        other => other.to_string(),
    }
}

#[derive(Serialize)]
struct GeminiTool {
    #[serde(rename = "googleSearch")]
    google_search: serde_json::Value,
}

#[derive(Deserialize)]
struct GeminiResponseBody {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiInlineDataResponse>,
}

#[derive(Deserialize)]
struct GeminiInlineDataResponse {
    #[serde(rename = "mimeType", default = "default_image_mime")]
    mime_type: String,
    data: String,
}

fn default_image_mime() -> String {
    "image/png".to_string()
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn build_request(parts: &[Part], options: &InvokeOptions) -> GeminiRequest {
    let wire_parts = parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => GeminiPart {
                text: Some(text.clone()),
                inline_data: None,
            },
            Part::InlineImage { data, mime_type } => GeminiPart {
                text: None,
                inline_data: Some(GeminiInlineData {
                    mime_type: mime_type.clone(),
                    data: BASE64.encode(data),
                }),
            },
        })
        .collect();

    let generation_config = if options.response_schema.is_some() {
        Some(GeminiGenerationConfig {
            response_mime_type: Some("application/json".to_string()),
            response_schema: options.response_schema.clone(),
            response_modalities: None,
            image_config: None,
        })
    } else if let Some(image) = &options.image_output {
        Some(GeminiGenerationConfig {
            response_mime_type: None,
            response_schema: None,
            response_modalities: Some(vec!["TEXT".to_string(), "IMAGE".to_string()]),
            image_config: Some(GeminiImageConfig {
                image_size: image_size_for_quality(&image.quality),
            }),
        })
    } else {
        None
    };

    let tools = options.search_grounding.then(|| {
        vec![GeminiTool {
            google_search: serde_json::json!({}),
        }]
    });

    let system_instruction = options
        .system_instruction
        .as_ref()
        .map(|text| GeminiSystemInstruction {
            parts: vec![GeminiPart {
                text: Some(text.clone()),
                inline_data: None,
            }],
        });

    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user".to_string(),
            parts: wire_parts,
        }],
        system_instruction,
        generation_config,
        tools,
    }
}

#[async_trait]
impl GenAiClient for GeminiClient {
    async fn invoke(&self, parts: &[Part], options: &InvokeOptions) -> Result<GenAiResponse> {
        if options.response_schema.is_some() && options.search_grounding {
            return Err(anyhow!(
                "A response schema and search grounding cannot be combined in one call"
            ));
        }

        let model = if options.image_output.is_some() {
            &self.image_model
        } else {
            &self.model
        };
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            model, self.api_key
        );

        let request_body = build_request(parts, options);

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponseBody = serde_json::from_str(&response_text).map_err(|e| {
            anyhow!(
                "Failed to parse Gemini response: {}. Body: {}",
                e,
                response_text
            )
        })?;

        if let Some(err) = result.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        let Some(first) = result.candidates.and_then(|c| c.into_iter().next()) else {
            return Err(anyhow!(
                "Gemini response format unexpected or empty. Body: {}",
                response_text
            ));
        };

        let mut response = GenAiResponse::default();
        if let Some(content) = first.content {
            let mut text = String::new();
            for part in content.parts {
                if let Some(t) = part.text {
                    text.push_str(&t);
                }
                if let Some(inline) = part.inline_data {
                    let bytes = BASE64
                        .decode(inline.data.as_bytes())
                        .context("Gemini returned undecodable inline image data")?;
                    response.inline_images.push((bytes, inline.mime_type));
                }
            }
            if !text.is_empty() {
                response.text = Some(text);
            }
        }

        if response.text.is_none() && response.inline_images.is_empty() {
            let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_and_search_are_mutually_exclusive() {
        let client = GeminiClient::new("dummy", "model", "image-model");
        let options = InvokeOptions {
            response_schema: Some(serde_json::json!({"type": "array"})),
            search_grounding: true,
            ..Default::default()
        };

        let err = client
            .invoke(&[Part::Text("hi".to_string())], &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[test]
    fn test_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponseBody = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];

        assert!(candidate.content.is_none());
        assert_eq!(candidate.finish_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn test_response_parsing_inline_image() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Here is your image." },
                            { "inlineData": { "mimeType": "image/png", "data": "aGVsbG8=" } }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }
            ]
        }"#;

        let result: GeminiResponseBody = serde_json::from_str(json).unwrap();
        let content = result.candidates.unwrap().remove(0).content.unwrap();
        assert_eq!(content.parts.len(), 2);

        let inline = content.parts[1].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(BASE64.decode(&inline.data).unwrap(), b"hello");
    }

    #[test]
    fn test_request_wire_format() {
        let parts = vec![
            Part::Text("describe".to_string()),
            Part::InlineImage {
                data: b"hello".to_vec(),
                mime_type: "image/jpeg".to_string(),
            },
        ];
        let options =
            InvokeOptions::with_schema(serde_json::json!({"type": "array"})).system("be brief");

        let body = serde_json::to_value(build_request(&parts, &options)).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(
            body["contents"][0]["parts"][1]["inlineData"]["data"],
            "aGVsbG8="
        );
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_request_wire_format_search() {
        let options = InvokeOptions::with_search();
        let body =
            serde_json::to_value(build_request(&[Part::Text("go".to_string())], &options)).unwrap();
        assert!(body.get("generationConfig").is_none());
        assert!(body["tools"][0].get("googleSearch").is_some());
    }

    #[test]
    fn test_request_wire_format_image_output() {
        let options = InvokeOptions::for_images(ImageConfig {
            quality: "standard".to_string(),
        });
        let body =
            serde_json::to_value(build_request(&[Part::Text("draw".to_string())], &options))
                .unwrap();
        let modalities = &body["generationConfig"]["responseModalities"];
        assert_eq!(modalities[0], "TEXT");
        assert_eq!(modalities[1], "IMAGE");
        assert_eq!(body["generationConfig"]["imageConfig"]["imageSize"], "1K");
    }

    #[test]
    fn test_quality_maps_to_image_size() {
        assert_eq!(image_size_for_quality("standard"), "1K");
        assert_eq!(image_size_for_quality("high"), "2K");
        assert_eq!(image_size_for_quality("4K"), "4K");
    }
}
