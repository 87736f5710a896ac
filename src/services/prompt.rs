//! Builds the multi-part request for each stage: one templated text
//! part first, then any inline image parts. Remote image references
//! are resolved to inline bytes best-effort; a failed fetch is logged
//! and the image dropped, never fatal to assembly.

use crate::core::state::{GeneratedIdea, GeneratedImage, Persona, RefinementRequirement};
use crate::services::genai::Part;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;
use std::fmt::Debug;
use url::Url;

#[async_trait]
pub trait ImageFetcher: Send + Sync + Debug {
    /// Fetches a remote image, returning its bytes and mime type.
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)>;
}

#[derive(Debug)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let parsed = Url::parse(url)?;
        let resp = self.client.get(parsed).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Image fetch failed with status {}", resp.status()));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok((bytes, mime))
    }
}

/// Decodes a `data:<mime>;base64,<payload>` URL without touching the
/// network.
pub fn decode_data_url(url: &str) -> Option<(Vec<u8>, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    let bytes = BASE64.decode(payload.as_bytes()).ok()?;
    Some((bytes, mime.to_string()))
}

pub fn to_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Resolves an image reference (data URL or remote URL) to inline
/// bytes. Returns None on failure; callers omit the image.
pub async fn resolve_image(fetcher: &dyn ImageFetcher, url: &str) -> Option<(Vec<u8>, String)> {
    if url.trim().is_empty() {
        return None;
    }
    if let Some(decoded) = decode_data_url(url) {
        return Some(decoded);
    }
    match fetcher.fetch(url).await {
        Ok(resolved) => Some(resolved),
        Err(e) => {
            log::warn!("Skipping unreachable reference image {}: {:#}", url, e);
            None
        }
    }
}

fn persona_preamble(persona: &Persona) -> String {
    let niche = if persona.niche.is_empty() {
        "lifestyle".to_string()
    } else {
        persona.niche.join(", ")
    };
    format!(
        "Persona: {}, a content creator based in {}, {}.\nNiche: {}.\nBio: {}",
        persona.name, persona.location, persona.country, niche, persona.bio
    )
}

fn location_constraint(persona: &Persona) -> String {
    format!(
        "Every idea must be anchored to a concrete, real place in or around {}, {} - name the exact spot in the description.",
        persona.location, persona.country
    )
}

pub const IDEATION_SYSTEM: &str =
    "You are a social media content strategist. Return only valid JSON.";

pub const REFINEMENT_SYSTEM: &str =
    "You are a photo production assistant. Return only valid JSON.";

pub const CAPTION_SYSTEM: &str =
    "You are a social media copywriter. Return only valid JSON.";

pub fn ideation_prompt_manual(persona: &Persona, activity: &str) -> String {
    format!(
        "{}\n\nThe creator wants to post about: {}\n\n\
         Propose exactly 3 distinct content ideas for a single photo post.\n\
         {}\n\
         Return a JSON array of objects with \"title\" and \"description\".",
        persona_preamble(persona),
        activity,
        location_constraint(persona)
    )
}

pub fn ideation_prompt_auto(persona: &Persona) -> String {
    format!(
        "{}\n\nSearch for current events, seasonal happenings and trending spots \
         around {}, {} and propose exactly 3 timely content ideas for a single photo post.\n\
         {}\n\
         Return only a JSON array of objects with \"title\" and \"description\".",
        persona_preamble(persona),
        persona.location,
        persona.country,
        location_constraint(persona)
    )
}

pub fn refinement_prompt(persona: &Persona, idea: &GeneratedIdea) -> String {
    format!(
        "{}\n\nChosen content idea: {}\n{}\n\n\
         Before generating the photo, list 2 to 3 short clarifying questions about \
         staging, wardrobe, framing or mood, each with a sensible suggested default.\n\
         Return a JSON array of objects with \"question\" and \"suggestion\".",
        persona_preamble(persona),
        idea.title,
        idea.description
    )
}

pub fn ideas_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "description": { "type": "string" }
            },
            "required": ["title", "description"]
        }
    })
}

pub fn requirements_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "suggestion": { "type": "string" }
            },
            "required": ["question", "suggestion"]
        }
    })
}

pub fn caption_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "caption": { "type": "string" },
            "hashtags": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["caption", "hashtags"]
    })
}

/// Composite image-generation request: persona attributes, the chosen
/// idea, one `Detail:` clause per requirement in list order, then the
/// persona's reference images and any run-scoped requirement images.
pub async fn image_request(
    fetcher: &dyn ImageFetcher,
    persona: &Persona,
    idea: &GeneratedIdea,
    requirements: &[RefinementRequirement],
) -> Vec<Part> {
    let mut text = format!(
        "Generate a photorealistic social media photo featuring {}.\n{}\n\n\
         Scene: {} - {}\nSetting: {}, {}.\n",
        persona.name,
        persona_preamble(persona),
        idea.title,
        idea.description,
        persona.location,
        persona.country
    );
    for req in requirements {
        text.push_str(&format!("Detail: {}\n", req.effective_answer()));
    }
    text.push_str(
        "Match the appearance of the person in the attached reference images exactly.",
    );

    let mut parts = vec![Part::Text(text)];
    for url in &persona.ref_images {
        if let Some((data, mime_type)) = resolve_image(fetcher, url).await {
            parts.push(Part::InlineImage { data, mime_type });
        }
    }
    for req in requirements {
        if let Some(image) = &req.reference_image {
            parts.push(Part::InlineImage {
                data: image.data.clone(),
                mime_type: image.mime_type.clone(),
            });
        }
    }
    parts
}

/// Edit request: the instruction plus the current image content
/// resolved inline. A missing source image is omitted, not fatal.
pub async fn edit_request(
    fetcher: &dyn ImageFetcher,
    image: &GeneratedImage,
    instruction: &str,
) -> Vec<Part> {
    let text = format!(
        "Edit the attached photo. Apply exactly this change and keep everything else identical:\n{}",
        instruction
    );

    let mut parts = vec![Part::Text(text)];
    if let Some((data, mime_type)) = resolve_image(fetcher, &image.image_url).await {
        parts.push(Part::InlineImage { data, mime_type });
    }
    parts
}

pub fn caption_prompt(persona: &Persona, idea: &GeneratedIdea) -> String {
    format!(
        "{}\n\nWrite an engaging first-person caption for a photo post about:\n{} - {}\n\n\
         Keep the persona's voice, mention the place, and include 5 to 8 relevant hashtags.\n\
         Return a JSON object with \"caption\" and \"hashtags\".",
        persona_preamble(persona),
        idea.title,
        idea.description
    )
}
