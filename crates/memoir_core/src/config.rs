use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoirConfig {
    pub llm: LlmConfig,
    pub generation: GenerationConfig,
}

impl MemoirConfig {
    /// Load config from a TOML file, falling back to defaults for missing
    /// fields. After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: MemoirConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if the file doesn't exist, return defaults
    /// with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ANTHROPIC_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("LLM_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                self.llm.max_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(n) = v.parse() {
                self.llm.temperature = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.llm.request_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.llm.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("MEMOIR_SUMMARY_MAX_CHARS") {
            if let Ok(n) = v.parse() {
                self.generation.summary_max_chars = n;
            }
        }
        if let Ok(v) = std::env::var("MEMOIR_ASSUMED_AGE") {
            if let Ok(n) = v.parse() {
                self.generation.assumed_age = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on one text-backend call. A regeneration blocked on the
    /// backend longer than this aborts (incremental path) or falls back
    /// (full path).
    pub request_timeout_secs: u64,
    /// Total HTTP attempts per backend call, including the first.
    pub max_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-4-5-sonnet-20250929".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.7,
            request_timeout_secs: 45,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Memory body text is truncated to this many chars in the generation
    /// context, keeping prompts small and digests stable.
    pub summary_max_chars: usize,
    /// Age assumed for period classification when the birth date is
    /// unknown. Narrative quality degrades, structure does not.
    pub assumed_age: i32,
    pub tone: String,
    pub length: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: 200,
            assumed_age: 30,
            tone: "warm".to_string(),
            length: "standard".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MemoirConfig::default();
        assert_eq!(cfg.generation.summary_max_chars, 200);
        assert_eq!(cfg.generation.assumed_age, 30);
        assert!(cfg.llm.request_timeout_secs > 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: MemoirConfig = toml::from_str(
            r#"
            [generation]
            summary_max_chars = 120
            "#,
        )
        .unwrap();
        assert_eq!(cfg.generation.summary_max_chars, 120);
        assert_eq!(cfg.generation.assumed_age, 30);
        assert_eq!(cfg.llm.max_tokens, 4096);
    }
}
