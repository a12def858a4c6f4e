//! Companion configuration.
//!
//! Precedence (lowest first): built-in defaults, the TOML file named by
//! `COMPANION_CONFIG` (default `config/companion.toml`, optional), then
//! environment variables with prefix `COMPANION` and `__` between sections,
//! e.g. `COMPANION_LLM__API_KEY`. A `.env` file is loaded first.

use crate::error::{CoreError, CoreResult};
use crate::pipeline::PipelineConfig;
use companion_voice::{
    AudioFormat, SegmenterConfig, SttProvider, SttSettings, TtsProvider, TtsSettings, WHISPER_AVAILABLE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/companion.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    /// Capacity of the capture → event loop chunk queue
    pub ingress_capacity: usize,
    /// WebRTC VAD aggressiveness (0-3)
    pub vad_mode: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
            ingress_capacity: 256,
            vad_mode: 3,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            frame_ms: self.frame_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// End the session after this much quiet while listening
    pub silence_timeout_secs: u64,
    /// Turns kept in short-term memory
    pub memory_turns: usize,
    pub stop_phrases: Vec<String>,
    /// Upper bound on the end-of-session reflection call
    pub reflection_timeout_secs: u64,
    /// Finished sessions summarised into the prompt context
    pub recent_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_timeout_secs: 30,
            memory_turns: 8,
            stop_phrases: ["bye", "stop", "goodnight", "you can rest now", "end", "shutdown"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reflection_timeout_secs: 20,
            recent_sessions: 3,
        }
    }
}

impl SessionConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn reflection_timeout(&self) -> Duration {
        Duration::from_secs(self.reflection_timeout_secs)
    }
}

/// Simulated thinking time before a reply: `base + min(cap, chars × per_char) × jitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    pub base_ms: u64,
    pub per_char_ms: u64,
    pub max_scaled_ms: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            base_ms: 400,
            per_char_ms: 20,
            max_scaled_ms: 2500,
            jitter_min: 0.5,
            jitter_max: 1.5,
        }
    }
}

impl DeliberationConfig {
    /// No delay at all; handy for tests.
    pub fn none() -> Self {
        Self {
            base_ms: 0,
            per_char_ms: 0,
            max_scaled_ms: 0,
            jitter_min: 1.0,
            jitter_max: 1.0,
        }
    }

    /// Delay for an input of `chars` characters with a jitter factor already drawn.
    pub fn delay_for(&self, chars: usize, jitter: f64) -> Duration {
        let scaled = (chars as u64)
            .saturating_mul(self.per_char_ms)
            .min(self.max_scaled_ms) as f64;
        let jitter = jitter.clamp(self.jitter_min.min(self.jitter_max), self.jitter_max.max(self.jitter_min));
        Duration::from_millis(self.base_ms + (scaled * jitter).round() as u64)
    }

    pub fn jitter_range(&self) -> (f64, f64) {
        let lo = self.jitter_min.min(self.jitter_max);
        let hi = self.jitter_max.max(self.jitter_min);
        (lo, hi)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    pub api_url: String,
    pub api_key: Option<String>,
    /// Model tiers, best first
    pub models: Vec<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            models: vec![
                "meta-llama/llama-3.3-70b-instruct".to_string(),
                "mistralai/mistral-small-3.1-24b-instruct".to_string(),
                "meta-llama/llama-3.1-8b-instruct".to_string(),
            ],
            timeout_secs: 60,
            max_tokens: 400,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sled database directory
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// CORS origins; empty allows any
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub app_name: String,
    /// Relaxes required settings and uses the in-memory store
    pub debug: bool,
    pub audio: AudioConfig,
    pub segmenter: SegmenterConfig,
    pub session: SessionConfig,
    pub deliberation: DeliberationConfig,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub stt: SttSettings,
    pub tts: TtsSettings,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            app_name: "Companion".to_string(),
            debug: false,
            audio: AudioConfig::default(),
            segmenter: SegmenterConfig::default(),
            session: SessionConfig::default(),
            deliberation: DeliberationConfig::default(),
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            stt: SttSettings::default(),
            tts: TtsSettings::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(|v| v.trim().is_empty()).unwrap_or(true)
}

impl CompanionConfig {
    /// Load `.env`, then defaults → file → environment, then validate.
    pub fn load() -> CoreResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Could not read .env: {}", e);
            }
        }
        let path = std::env::var("COMPANION_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = Self::load_from(Path::new(&path))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults → `path` (if it exists) → `COMPANION_*` environment. Not validated.
    pub fn load_from(path: &Path) -> CoreResult<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if path.exists() {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let built = builder
            .add_source(
                config::Environment::with_prefix("COMPANION")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("llm.models")
                    .with_list_parse_key("session.stop_phrases")
                    .with_list_parse_key("gateway.allowed_origins")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Check required settings. Every problem is reported in one error.
    pub fn validate(&self) -> CoreResult<()> {
        let mut missing = Vec::new();

        if is_blank(&self.llm.api_key) {
            missing.push("llm.api_key");
        }
        if self.llm.models.iter().all(|m| m.trim().is_empty()) {
            missing.push("llm.models");
        }
        if self.tts.provider == TtsProvider::OpenAi && is_blank(&self.tts.api_key) {
            missing.push("tts.api_key");
        }
        match self.stt.provider {
            SttProvider::OpenAi if is_blank(&self.stt.api_key) => missing.push("stt.api_key"),
            SttProvider::Whisper if is_blank(&self.stt.whisper_model_path) => {
                missing.push("stt.whisper_model_path")
            }
            _ => {}
        }
        if !self.debug && is_blank(&self.store.path) {
            missing.push("store.path");
        }

        let mut invalid = Vec::new();
        if self.llm.models.iter().any(|m| m.trim().is_empty())
            && !self.llm.models.iter().all(|m| m.trim().is_empty())
        {
            invalid.push("llm.models must not contain blank entries".to_string());
        }
        if self.stt.provider == SttProvider::Whisper && !WHISPER_AVAILABLE {
            invalid.push("stt.provider = \"whisper\" needs a build with the `whisper` feature".to_string());
        }
        if !matches!(self.audio.frame_ms, 10 | 20 | 30) {
            invalid.push(format!("audio.frame_ms must be 10, 20 or 30 (got {})", self.audio.frame_ms));
        }
        if self.audio.vad_mode > 3 {
            invalid.push(format!("audio.vad_mode must be 0-3 (got {})", self.audio.vad_mode));
        }

        if missing.is_empty() && invalid.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if !missing.is_empty() {
            parts.push(format!("missing required settings: {}", missing.join(", ")));
        }
        parts.extend(invalid);
        Err(CoreError::Config(parts.join("; ")))
    }

    /// Stop phrases normalised for matching.
    pub fn normalized_stop_phrases(&self) -> Vec<String> {
        self.session
            .stop_phrases
            .iter()
            .map(|p| normalize_phrase(p))
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Lowercase, trim, and drop surrounding punctuation ("Bye!" → "bye").
pub fn normalize_phrase(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase()
}
