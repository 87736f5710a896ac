use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub genai: GenAiConfig,

    /// Remote persona store. When absent (or unreachable) the app runs
    /// on the built-in seed personas, read-only.
    pub store: Option<StoreConfig>,

    /// Object storage for avatar / reference-image uploads.
    pub blob: Option<BlobConfig>,

    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenAiConfig {
    #[serde(default = "default_genai_provider")]
    pub provider: String,
    pub gemini: Option<GeminiConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    #[serde(default = "default_text_model")]
    pub model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BlobConfig {
    pub base_url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_image_count")]
    pub image_count: usize,
    #[serde(default = "default_image_quality")]
    pub image_quality: String,
    /// Upper bound on in-flight capability calls during a fan-out.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            image_count: default_image_count(),
            image_quality: default_image_quality(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_genai_provider() -> String {
    "gemini".to_string()
}
fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_collection() -> String {
    "personas".to_string()
}
fn default_bucket() -> String {
    "persona-assets".to_string()
}
fn default_image_count() -> usize {
    2
}
fn default_image_quality() -> String {
    "standard".to_string()
}
fn default_max_concurrency() -> usize {
    3
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let yaml = r#"
genai:
  gemini:
    api_key: "k"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.genai.provider, "gemini");
        let gemini = config.genai.gemini.unwrap();
        assert_eq!(gemini.model, "gemini-2.5-flash");
        assert_eq!(gemini.image_model, "gemini-2.5-flash-image");
        assert_eq!(config.generation.image_count, 2);
        assert_eq!(config.generation.max_concurrency, 3);
        assert!(config.store.is_none());
        assert!(config.blob.is_none());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");

        let yaml = r#"
genai:
  provider: gemini
  gemini:
    api_key: "k"
store:
  base_url: "https://store.example.com"
  api_key: "s"
generation:
  image_count: 4
"#;
        std::fs::write(&path, yaml).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.generation.image_count, 4);
        let store = config.store.as_ref().unwrap();
        assert_eq!(store.collection, "personas");

        config.save(&path).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.generation.image_count, 4);
    }
}
