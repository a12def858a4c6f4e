//! Utterance segmentation.
//!
//! Frames are classified by the VAD capability and accumulated into a clip.
//! A clip closes when trailing silence passes the threshold or when the clip
//! reaches the maximum utterance length. Timing is measured in audio time
//! (frames × frame duration), so the boundaries do not depend on how quickly
//! frames are delivered.
//!
//! ```text
//!  Waiting ──speech──▶ Speech ──silence──▶ TrailingSilence ──(> threshold)──▶ clip
//!     ▲                  ▲                      │
//!     │                  └──────speech──────────┘
//!     └──────────────── reset after clip ◀────────────────────────────────────┘
//! ```

use crate::audio::{AudioFormat, Frame};
use crate::stt::{ClipEnd, SpeechClip, SttBackend};
use crate::vad::VoiceActivityDetector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Boundary policy for utterances
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Trailing silence that closes an utterance (default: 2000ms)
    pub silence_threshold_ms: u64,

    /// Force-close an utterance at this length (default: 15000ms)
    pub max_utterance_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 2000,
            max_utterance_ms: 15000,
        }
    }
}

/// A finalized span of user speech as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Speech,
    TrailingSilence,
}

/// Runs the transcription capability off the event loop.
#[derive(Clone)]
pub struct Transcriber {
    stt: Arc<dyn SttBackend>,
}

impl Transcriber {
    pub fn new(stt: Arc<dyn SttBackend>) -> Self {
        Self { stt }
    }

    /// Transcribe a clip on the blocking pool.
    ///
    /// Failures and empty results yield `None`; the caller treats them as silence.
    pub async fn transcribe(&self, clip: SpeechClip) -> Option<Utterance> {
        let stt = Arc::clone(&self.stt);
        let captured_at = clip.started_at;
        let frames = clip.frame_count;

        let raw = match tokio::task::spawn_blocking(move || stt.transcribe(&clip)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("STT failed for {} frames: {}", frames, e);
                return None;
            }
            Err(e) => {
                warn!("STT task did not complete: {}", e);
                return None;
            }
        };

        let text = collapse_repeats(&raw);
        if !text.chars().any(char::is_alphanumeric) {
            debug!("Dropping empty transcription {:?}", raw);
            return None;
        }

        info!("📝 Utterance: {:?}", text);
        Some(Utterance {
            text,
            is_final: true,
            captured_at,
        })
    }
}

/// Collapse immediately repeated words, comparing case- and punctuation-insensitively.
///
/// The first spelling of each run is kept: `"what, what, what is that"` → `"what, is that"`.
pub fn collapse_repeats(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut last: Option<String> = None;
    for word in text.split_whitespace() {
        let key = word
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        if !key.is_empty() && last.as_deref() == Some(key.as_str()) {
            continue;
        }
        last = Some(key);
        out.push(word);
    }
    out.join(" ")
}

/// Classifies frames and decides utterance boundaries.
pub struct SpeechSegmenter {
    vad: Box<dyn VoiceActivityDetector>,
    transcriber: Transcriber,
    format: AudioFormat,
    silence_limit: usize,
    max_frames: usize,
    phase: Phase,
    pcm: Vec<u8>,
    frame_count: usize,
    silent_frames: usize,
    started_at: Option<DateTime<Utc>>,
}

impl SpeechSegmenter {
    pub fn new(
        vad: Box<dyn VoiceActivityDetector>,
        stt: Arc<dyn SttBackend>,
        format: AudioFormat,
        config: SegmenterConfig,
    ) -> Self {
        let frame_ms = u64::from(format.frame_ms.max(1));
        // strictly greater than the threshold
        let silence_limit = (config.silence_threshold_ms / frame_ms + 1) as usize;
        let max_frames = format.frames_for(Duration::from_millis(config.max_utterance_ms));

        Self {
            vad,
            transcriber: Transcriber::new(stt),
            format,
            silence_limit,
            max_frames,
            phase: Phase::Waiting,
            pcm: Vec::new(),
            frame_count: 0,
            silent_frames: 0,
            started_at: None,
        }
    }

    /// Feed one frame. Returns the accumulated clip when a boundary is reached.
    pub fn push_frame(&mut self, frame: &Frame) -> Option<SpeechClip> {
        let is_speech = match self.vad.is_speech(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("VAD error, treating frame as silence: {}", e);
                false
            }
        };

        match (self.phase, is_speech) {
            (Phase::Waiting, false) => return None,
            (Phase::Waiting, true) => {
                debug!("🎤 Speech started");
                self.started_at = Some(Utc::now());
                self.phase = Phase::Speech;
                self.append(frame);
            }
            (_, true) => {
                self.phase = Phase::Speech;
                self.silent_frames = 0;
                self.append(frame);
            }
            (_, false) => {
                self.phase = Phase::TrailingSilence;
                self.silent_frames += 1;
                self.append(frame);
                if self.silent_frames >= self.silence_limit {
                    return Some(self.finish(ClipEnd::Silence));
                }
            }
        }

        if self.frame_count >= self.max_frames {
            warn!("⏱️ Max utterance length reached, finalizing");
            return Some(self.finish(ClipEnd::MaxDuration));
        }
        None
    }

    /// Feed one frame and, on a boundary, transcribe the clip in place.
    pub async fn process_frame(&mut self, frame: &Frame) -> Option<Utterance> {
        let clip = self.push_frame(frame)?;
        self.transcriber.transcribe(clip).await
    }

    /// Handle for transcribing clips concurrently with further segmentation.
    pub fn transcriber(&self) -> Transcriber {
        self.transcriber.clone()
    }

    /// Whether the user is mid-utterance.
    pub fn is_speaking(&self) -> bool {
        self.phase != Phase::Waiting
    }

    /// Discard any partial utterance.
    pub fn reset(&mut self) {
        self.clear();
        if let Err(e) = self.vad.reset() {
            warn!("VAD reset failed: {}", e);
        }
    }

    fn append(&mut self, frame: &Frame) {
        self.pcm.extend_from_slice(frame.as_bytes());
        self.frame_count += 1;
    }

    fn finish(&mut self, end: ClipEnd) -> SpeechClip {
        let frame_count = self.frame_count;
        let clip = SpeechClip {
            pcm: std::mem::take(&mut self.pcm),
            sample_rate: self.format.sample_rate,
            frame_count,
            started_at: self.started_at.unwrap_or_else(Utc::now),
            duration: self.format.frame_duration() * frame_count as u32,
            end,
        };
        debug!("Clip closed ({:?}, {} frames)", end, frame_count);
        self.clear();
        clip
    }

    fn clear(&mut self) {
        self.phase = Phase::Waiting;
        self.pcm.clear();
        self.frame_count = 0;
        self.silent_frames = 0;
        self.started_at = None;
    }
}
