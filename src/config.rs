use std::collections::HashMap;
use std::env;
use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::rate_limit::RateLimitPolicies;
use crate::sanitize::MAX_INPUT_CHARS;

/// Audit file rotation.  Rotated files are kept forever; pruning them is
/// left to the operator.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub compress: bool,
}

/// Connection settings for the completion service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionConfig {
    #[serde(default = "default_completion_url")]
    pub url: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_completion_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_completion_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_owned()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_owned()
}
fn default_completion_timeout_ms() -> u64 {
    30_000
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            url: default_completion_url(),
            model: default_completion_model(),
            api_key: None,
            timeout_ms: default_completion_timeout_ms(),
        }
    }
}

/// Generation settings loaded from the optional `STORYGEN_CONFIG` JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorConfig {
    /// Ceiling for the estimated size of system + user prompt.
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_min_input_chars")]
    pub min_input_chars: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Literal phrases neutralized in addition to the built-in signatures.
    #[serde(default)]
    pub extra_injection_signatures: Vec<String>,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub rate_limits: RateLimitPolicies,
}

fn default_max_prompt_tokens() -> usize {
    4000
}
fn default_max_output_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.3
}
fn default_min_input_chars() -> usize {
    10
}
fn default_max_input_chars() -> usize {
    MAX_INPUT_CHARS
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: default_max_prompt_tokens(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            min_input_chars: default_min_input_chars(),
            max_input_chars: default_max_input_chars(),
            extra_injection_signatures: Vec::new(),
            completion: CompletionConfig::default(),
            rate_limits: RateLimitPolicies::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be between 0 and 2 (got {})", self.temperature);
        }
        if self.max_input_chars == 0 || self.max_prompt_tokens == 0 || self.max_output_tokens == 0
        {
            bail!("maxInputChars, maxPromptTokens and maxOutputTokens must be positive");
        }
        if self.rate_limits.anonymous.window_secs == 0
            || self.rate_limits.authenticated.window_secs == 0
        {
            bail!("rate limit windows must be at least one second");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub generator: GeneratorConfig,
    /// Bearer token -> user id.
    pub auth_tokens: HashMap<String, String>,
    pub audit_log_file: Option<String>,
    pub rotation: RotationConfig,
    pub max_request_bytes: Option<usize>,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.  Only
    /// safe behind a proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut generator = if let Ok(path) = env::var("STORYGEN_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read STORYGEN_CONFIG '{}': file unreadable", path)
            })?;
            serde_json::from_str::<GeneratorConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse STORYGEN_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            GeneratorConfig::default()
        };

        if let Some(url) = parse_optional_string("LLM_API_URL") {
            generator.completion.url = url;
        }
        if let Some(key) = parse_optional_string("LLM_API_KEY") {
            generator.completion.api_key = Some(key);
        }
        if let Some(model) = parse_optional_string("LLM_MODEL") {
            generator.completion.model = model;
        }
        if let Some(ms) = parse_optional_u64("LLM_TIMEOUT_MS")? {
            generator.completion.timeout_ms = ms;
        }
        if let Some(n) = parse_optional_u64("STORYGEN_MAX_PROMPT_TOKENS")? {
            generator.max_prompt_tokens = n as usize;
        }
        if let Some(n) = parse_optional_u64("STORYGEN_MAX_OUTPUT_TOKENS")? {
            generator.max_output_tokens = u32::try_from(n)
                .map_err(|_| anyhow!("STORYGEN_MAX_OUTPUT_TOKENS is out of range"))?;
        }
        generator.validate().context("invalid generator configuration")?;

        let auth_tokens = match env::var("STORYGEN_AUTH_TOKENS") {
            Ok(raw) => parse_auth_tokens(&raw)?,
            Err(_) => HashMap::new(),
        };

        let audit_log_file = parse_optional_string("AUDIT_LOG_FILE");

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };
        if rotation.max_bytes == Some(0) {
            bail!("LOG_MAX_BYTES must be greater than zero");
        }
        if env::var_os("LOG_ROTATE_KEEP").is_some() {
            tracing::warn!("LOG_ROTATE_KEEP is ignored; rotated audit files are never pruned");
        }

        let max_request_bytes =
            parse_optional_u64("STORYGEN_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let trust_forwarded_headers = parse_bool_env("STORYGEN_TRUST_FORWARDED")?.unwrap_or(false);

        Ok(Self {
            generator,
            auth_tokens,
            audit_log_file,
            rotation,
            max_request_bytes,
            trust_forwarded_headers,
        })
    }
}

fn parse_auth_tokens(raw: &str) -> Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (token, user) = entry
            .split_once(':')
            .map(|(t, u)| (t.trim(), u.trim()))
            .filter(|(t, u)| !t.is_empty() && !u.is_empty())
            .ok_or_else(|| anyhow!("STORYGEN_AUTH_TOKENS entries must look like token:userId"))?;
        tokens.insert(token.to_string(), user.to_string());
    }
    Ok(tokens)
}

fn parse_optional_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
