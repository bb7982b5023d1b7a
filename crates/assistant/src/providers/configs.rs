use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    #[serde(rename = "openai")]
    OpenAi(OpenAiProviderConfig),
    #[serde(alias = "claude")]
    Anthropic(AnthropicProviderConfig),
    Ollama(OllamaProviderConfig),
}

fn default_temperature() -> Option<f32> {
    Some(DEFAULT_TEMPERATURE)
}

fn default_openai_host() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

// Define specific config structs for each provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default = "default_openai_host")]
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

fn default_anthropic_host() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_anthropic_max_tokens() -> i32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    #[serde(default = "default_anthropic_host")]
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    /// Required by the messages API, so always sent
    #[serde(default = "default_anthropic_max_tokens")]
    pub max_tokens: i32,
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaProviderConfig {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_configs_fill_defaults() {
        let config: ProviderConfig =
            serde_json::from_value(json!({"type": "ollama"})).unwrap();
        match config {
            ProviderConfig::Ollama(ollama) => {
                assert_eq!(ollama.host, "http://localhost:11434");
                assert_eq!(ollama.model, "llama3.2");
                assert_eq!(ollama.temperature, Some(DEFAULT_TEMPERATURE));
            }
            other => panic!("unexpected config {:?}", other),
        }

        let config: ProviderConfig =
            serde_json::from_value(json!({"type": "claude", "api_key": "k"})).unwrap();
        assert!(matches!(config, ProviderConfig::Anthropic(c) if c.max_tokens == 4096));
    }

    #[test]
    fn test_openai_requires_api_key() {
        let result: Result<ProviderConfig, _> = serde_json::from_value(json!({"type": "openai"}));
        assert!(result.is_err());
    }
}
