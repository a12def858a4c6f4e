//! PCM framing primitives and (optionally) local microphone capture via CPAL.
//!
//! All audio inside the companion is 16-bit little-endian mono PCM. Ingress of
//! any origin (microphone callback, WebSocket client) hands raw byte chunks to a
//! bounded queue; the frame router on the event loop is the only consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Producer side of the bounded ingress queue.
pub type IngressSender = mpsc::Sender<Vec<u8>>;

/// Consumer side of the bounded ingress queue.
pub type IngressReceiver = mpsc::Receiver<Vec<u8>>;

/// Create the bounded byte-chunk queue between capture and the event loop.
pub fn ingress_channel(capacity: usize) -> (IngressSender, IngressReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Audio format shared by capture, wake detection and VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Frame length in milliseconds (default: 30, WebRTC VAD accepts 10/20/30)
    pub frame_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
        }
    }
}

impl AudioFormat {
    /// Samples per frame (480 at 16kHz / 30ms).
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Bytes per frame (960 at 16kHz / 30ms).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * BYTES_PER_SAMPLE
    }

    /// Wall-clock length of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }

    /// Number of whole frames needed to cover `duration` (at least one).
    pub fn frames_for(&self, duration: Duration) -> usize {
        let frame_ms = self.frame_ms.max(1) as u128;
        (duration.as_millis().div_ceil(frame_ms) as usize).max(1)
    }
}

/// A fixed-length block of 16-bit mono PCM. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode into signed samples.
    pub fn samples(&self) -> Vec<i16> {
        pcm_bytes_to_i16(&self.bytes)
    }
}

/// Decode little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert normalized f32 samples (-1.0..1.0) to little-endian 16-bit PCM.
pub fn f32_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(feature = "local-audio")]
mod capture {
    use super::{f32_to_pcm_bytes, AudioFormat, IngressSender};
    use crate::error::{VoiceError, VoiceResult};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig};
    use tokio::sync::mpsc::error::TrySendError;
    use tracing::{info, warn};

    /// Handle that keeps a capture running until dropped.
    pub type CaptureStream = Stream;

    /// Microphone capture using CPAL.
    ///
    /// The device callback runs on a driver thread; it never touches companion
    /// state and only pushes PCM chunks into the bounded ingress queue.
    pub struct AudioCapture {
        format: AudioFormat,
        device: Device,
        stream_config: StreamConfig,
    }

    impl AudioCapture {
        pub fn new(format: AudioFormat) -> VoiceResult<Self> {
            info!("🎤 Initializing audio capture ({}Hz mono)", format.sample_rate);

            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

            info!(
                "📱 Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let stream_config = StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            Ok(Self {
                format,
                device,
                stream_config,
            })
        }

        /// Start capturing. Keep the returned stream alive for as long as capture should run.
        pub fn start_capture(self, ingress: IngressSender) -> VoiceResult<Stream> {
            info!("▶️ Starting audio capture stream");
            let frame_samples = self.format.frame_samples();
            let mut pending: Vec<f32> = Vec::with_capacity(frame_samples);

            let stream = self.device.build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    pending.extend_from_slice(data);
                    if pending.len() < frame_samples {
                        return;
                    }
                    let chunk = f32_to_pcm_bytes(&pending);
                    pending.clear();
                    match ingress.try_send(chunk) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => warn!("Ingress queue full, dropping captured audio"),
                        Err(TrySendError::Closed(_)) => {}
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )?;

            stream.play()?;
            info!("✅ Audio capture started");
            Ok(stream)
        }

        /// List available input devices
        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }
}

#[cfg(feature = "local-audio")]
pub use capture::{AudioCapture, CaptureStream};
