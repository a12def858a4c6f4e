//! # Companion Voice - audio side of the conversational companion
//!
//! Frame reassembly, voice activity classification, utterance segmentation and
//! the speech capabilities (wake, transcription, synthesis, output) that the
//! turn orchestrator in `companion-core` drives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  capture (cpal / WebSocket)                                      │
//! │        │ bounded ingress queue (Vec<u8> chunks)                  │
//! │        ▼                                                         │
//! │  ┌──────────────┐  idle   ┌──────────────┐                       │
//! │  │ FrameRouter  │────────▶│ WakeDetector │──▶ WakeDetected       │
//! │  │ (exact 30ms) │         └──────────────┘                       │
//! │  │              │ session ┌──────────────┐   ┌─────────────┐     │
//! │  │              │────────▶│  Segmenter   │──▶│ Transcriber │──▶ Utterance
//! │  └──────────────┘         │ (WebRTC VAD) │   │ (blocking)  │     │
//! │                           └──────────────┘   └─────────────┘     │
//! │                                                                  │
//! │  SpeechSynthesizer ──▶ OutputSink (WebSocket / rodio) ◀── stop   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod error;
pub mod output;
pub mod router;
pub mod segmenter;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wake;

#[cfg(feature = "local-audio")]
pub use audio::{AudioCapture, CaptureStream};
pub use audio::{ingress_channel, AudioFormat, Frame, IngressReceiver, IngressSender};
pub use error::{VoiceError, VoiceResult};
#[cfg(feature = "local-audio")]
pub use output::LocalPlayback;
pub use output::{ChannelSink, ControlEvent, NullSink, OutputEvent, OutputSink};
pub use router::{AudioFrameRouter, Route, RouterEvent};
pub use segmenter::{collapse_repeats, SegmenterConfig, SpeechSegmenter, Transcriber, Utterance};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use stt::{
    create_stt, ClipEnd, OpenAiStt, PlaceholderStt, SpeechClip, SttBackend, SttProvider,
    SttSettings, WHISPER_AVAILABLE,
};
pub use tts::{
    create_tts, sample_aligned, AudioChunkStream, OpenAiTts, SilentTts, SpeechSynthesizer, TtsProvider,
    TtsSettings,
};
pub use vad::{VadConfig, VoiceActivityDetector, WebRtcVad};
pub use wake::{NeverWake, WakeWordDetector};
