//! Speech synthesis. Text in, a stream of raw PCM chunks out.

use crate::audio::BYTES_PER_SAMPLE;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Audio produced for one piece of text.
pub type AudioChunkStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

/// Backend that turns text into audio chunks.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesis. An empty stream means there is nothing to play.
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioChunkStream>;
}

/// Re-chunk 16-bit PCM so every chunk holds whole samples.
///
/// Network chunks can split a sample; the odd byte is carried into the next
/// chunk. A dangling byte at the end of the stream is dropped.
pub fn sample_aligned<S>(chunks: S) -> AudioChunkStream
where
    S: Stream<Item = VoiceResult<Vec<u8>>> + Send + 'static,
{
    chunks
        .scan(Vec::<u8>::new(), |carry, chunk| {
            let aligned = chunk.map(|bytes| {
                carry.extend_from_slice(&bytes);
                let whole = carry.len() - carry.len() % BYTES_PER_SAMPLE;
                let rest = carry.split_off(whole);
                std::mem::replace(carry, rest)
            });
            future::ready(Some(aligned))
        })
        .filter(|chunk| future::ready(!matches!(chunk, Ok(bytes) if bytes.is_empty())))
        .boxed()
}

/// Produces no audio. Useful when only the text side is wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentTts;

#[async_trait]
impl SpeechSynthesizer for SilentTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<AudioChunkStream> {
        Ok(stream::empty().boxed())
    }
}

/// OpenAI-compatible `/audio/speech`, streaming raw PCM back as it arrives.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioChunkStream> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(stream::empty().boxed());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        Ok(sample_aligned(res.bytes_stream().map(|chunk| {
            chunk
                .map(|b| b.to_vec())
                .map_err(|e| VoiceError::Tts(e.to_string()))
        })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    OpenAi,
    Silent,
}

/// Synthesis settings (the `tts` configuration section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub provider: TtsProvider,
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            provider: TtsProvider::OpenAi,
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "shimmer".to_string(),
        }
    }
}

pub fn create_tts(settings: &TtsSettings) -> VoiceResult<Box<dyn SpeechSynthesizer>> {
    match settings.provider {
        TtsProvider::OpenAi => {
            let key = settings
                .api_key
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| VoiceError::Config("tts.api_key is required for the openai provider".to_string()))?;
            info!("🔊 TTS: OpenAI-compatible ({}, voice {})", settings.api_url, settings.voice);
            Ok(Box::new(OpenAiTts::new(
                &settings.api_url,
                key,
                &settings.model,
                &settings.voice,
            )?))
        }
        TtsProvider::Silent => Ok(Box::new(SilentTts)),
    }
}
