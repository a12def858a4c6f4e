//! **Speech-to-Text (STT)**: turn a captured speech clip into text.
//!
//! Backends are synchronous; the segmenter's [`Transcriber`](crate::segmenter::Transcriber)
//! runs them on the blocking pool so frame ingestion never waits on inference.

use crate::audio::pcm_bytes_to_i16;
use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Why the segmenter closed a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipEnd {
    /// Trailing silence exceeded the threshold
    Silence,
    /// Accumulated audio reached the maximum utterance length
    MaxDuration,
}

/// The exact frames accumulated for one utterance, concatenated.
#[derive(Debug, Clone)]
pub struct SpeechClip {
    /// 16-bit LE mono PCM
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub frame_count: usize,
    pub started_at: DateTime<Utc>,
    /// Audio length (frames × frame duration)
    pub duration: Duration,
    pub end: ClipEnd,
}

impl SpeechClip {
    pub fn samples(&self) -> Vec<i16> {
        pcm_bytes_to_i16(&self.pcm)
    }

    /// Normalized samples for models that take f32 input.
    pub fn samples_f32(&self) -> Vec<f32> {
        self.samples()
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

/// Backend for converting a speech clip to text.
pub trait SttBackend: Send + Sync {
    /// Transcribe one clip; an empty string means nothing was recognised.
    fn transcribe(&self, clip: &SpeechClip) -> VoiceResult<String>;
}

/// Wrap 16-bit mono PCM in a WAV container for API upload.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = (pcm.len() - pcm.len() % 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(&pcm[..data_len as usize]);
    buf
}

/// Placeholder STT: returns a fixed string. Lets the loop run without a model or API key.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl SttBackend for PlaceholderStt {
    fn transcribe(&self, clip: &SpeechClip) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {} frames, {:.1}s]",
            clip.frame_count,
            clip.duration.as_secs_f32()
        ))
    }
}

/// OpenAI-compatible transcription API (`/audio/transcriptions`, WAV upload).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// Model: whisper-1, gpt-4o-transcribe, ...
    pub model: String,
    language: Option<String>,
    client: reqwest::blocking::Client,
}

impl OpenAiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: None,
            client,
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

impl SttBackend for OpenAiStt {
    fn transcribe(&self, clip: &SpeechClip) -> VoiceResult<String> {
        if clip.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(&clip.pcm, clip.sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT over a ggml model (e.g. ggml-base.en.bin). Expects 16 kHz audio.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
        language: String,
    }

    impl WhisperStt {
        /// Load the model. Slow; call from a blocking context.
        pub fn new(model_path: &str, language: &str) -> VoiceResult<Self> {
            info!("🧠 Loading Whisper model from {}", model_path);
            let context =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                    .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
                language: language.to_string(),
            })
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, clip: &SpeechClip) -> VoiceResult<String> {
            if clip.is_empty() {
                return Ok(String::new());
            }
            if clip.sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    clip.sample_rate
                )));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some(&self.language));

            let samples = clip.samples_f32();
            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(params, &samples)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            Ok(state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string())
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Whether this build can run local Whisper transcription.
pub const WHISPER_AVAILABLE: bool = cfg!(feature = "whisper");

/// Which transcription backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    OpenAi,
    Whisper,
    Placeholder,
}

/// Transcription settings (the `stt` configuration section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub provider: SttProvider,
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    pub whisper_model_path: Option<String>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            provider: SttProvider::OpenAi,
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: "en".to_string(),
            whisper_model_path: None,
        }
    }
}

/// Build the configured backend. Loading a local model blocks; call off the event loop.
pub fn create_stt(settings: &SttSettings) -> VoiceResult<Box<dyn SttBackend>> {
    match settings.provider {
        SttProvider::OpenAi => {
            let key = settings
                .api_key
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| VoiceError::Config("stt.api_key is required for the openai provider".to_string()))?;
            info!("📝 STT: OpenAI-compatible ({}, model {})", settings.api_url, settings.model);
            Ok(Box::new(
                OpenAiStt::new(&settings.api_url, key, &settings.model)?.with_language(&settings.language),
            ))
        }
        #[cfg(feature = "whisper")]
        SttProvider::Whisper => {
            let path = settings
                .whisper_model_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| VoiceError::Config("stt.whisper_model_path is not set".to_string()))?;
            Ok(Box::new(WhisperStt::new(path.trim(), &settings.language)?))
        }
        #[cfg(not(feature = "whisper"))]
        SttProvider::Whisper => Err(VoiceError::Config(
            "whisper provider requires the `whisper` feature".to_string(),
        )),
        SttProvider::Placeholder => Ok(Box::new(PlaceholderStt::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(pcm: Vec<u8>) -> SpeechClip {
        let frame_count = pcm.len() / 960;
        SpeechClip {
            pcm,
            sample_rate: 16000,
            frame_count,
            started_at: Utc::now(),
            duration: Duration::from_millis(30 * frame_count as u64),
            end: ClipEnd::Silence,
        }
    }

    #[test]
    fn placeholder_returns_message() {
        let s = PlaceholderStt::new().transcribe(&clip(vec![0; 960])).unwrap();
        assert!(s.contains("STT placeholder"));
        assert!(s.contains("1 frames"));
    }

    #[test]
    fn placeholder_with_response() {
        let stt = PlaceholderStt::with_response("hello world");
        assert_eq!(stt.transcribe(&clip(vec![])).unwrap(), "hello world");
    }

    #[test]
    fn wav_header_describes_payload() {
        let wav = pcm_to_wav(&[1, 0, 2, 0], 16000);
        assert_eq!(wav.len(), 48);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 4);
        assert_eq!(&wav[44..], &[1, 0, 2, 0]);
    }

    #[test]
    fn openai_provider_requires_key() {
        let settings = SttSettings::default();
        assert!(matches!(create_stt(&settings), Err(VoiceError::Config(_))));
    }

    #[test]
    fn samples_are_normalized() {
        let c = clip(vec![0x00, 0x40]); // 16384
        assert_eq!(c.samples(), vec![16384]);
        assert!((c.samples_f32()[0] - 0.5).abs() < 1e-6);
    }
}
