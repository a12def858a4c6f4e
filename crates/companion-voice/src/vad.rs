//! Voice activity classification.
//!
//! The segmenter only needs a yes/no answer per frame; [`WebRtcVad`] provides it
//! with the WebRTC detector, and tests substitute scripted classifiers.

use crate::audio::{AudioFormat, Frame};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies a single frame as speech or silence.
///
/// Implementations run on the event loop and are not required to be `Send`.
pub trait VoiceActivityDetector {
    fn is_speech(&mut self, frame: &Frame) -> VoiceResult<bool>;

    /// Drop any internal history (called between sessions).
    fn reset(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Configuration for the WebRTC detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { mode: 3 }
    }
}

/// Voice activity detector backed by WebRTC VAD
pub struct WebRtcVad {
    vad: Vad,
    mode: u8,
    sample_rate: u32,
    frame_samples: usize,
}

fn vad_mode(mode: u8) -> VoiceResult<VadMode> {
    match mode {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        other => Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", other))),
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

fn build_vad(mode: u8, sample_rate: u32) -> VoiceResult<Vad> {
    let mode = vad_mode(mode)?;
    let rate = vad_rate(sample_rate)?;
    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(rate);
    Ok(vad)
}

impl WebRtcVad {
    pub fn new(format: AudioFormat, config: VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, frame: {}ms, mode: {})",
            format.sample_rate, format.frame_ms, config.mode
        );

        if !matches!(format.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD requires 10, 20 or 30ms frames, got {}ms",
                format.frame_ms
            )));
        }

        Ok(Self {
            vad: build_vad(config.mode, format.sample_rate)?,
            mode: config.mode,
            sample_rate: format.sample_rate,
            frame_samples: format.frame_samples(),
        })
    }

    /// Expected samples per frame
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn is_speech(&mut self, frame: &Frame) -> VoiceResult<bool> {
        let samples = frame.samples();
        if samples.len() != self.frame_samples {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_samples,
                samples.len()
            )));
        }

        let is_speech = self
            .vad
            .is_voice_segment(&samples)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;

        debug!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });
        Ok(is_speech)
    }

    fn reset(&mut self) -> VoiceResult<()> {
        // no explicit reset in WebRTC VAD; recreate it
        self.vad = build_vad(self.mode, self.sample_rate)?;
        Ok(())
    }
}
