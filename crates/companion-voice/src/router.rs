//! Frame reassembly and routing.
//!
//! Ingress chunks arrive in whatever sizes the capture device or transport
//! produces. The router slices them into exact frames and hands each frame to
//! the wake detector (idle) or the segmenter (in a session). It holds fewer than
//! one frame of leftover bytes between calls.

use crate::audio::{AudioFormat, Frame};
use crate::segmenter::SpeechSegmenter;
use crate::stt::SpeechClip;
use crate::wake::WakeWordDetector;
use tracing::{debug, warn};

/// Where frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Idle: look for the wake word
    Wake,
    /// In a session: segment speech (also while the companion is speaking)
    Segmenter,
}

/// Something the controller must act on.
#[derive(Debug)]
pub enum RouterEvent {
    WakeDetected,
    SpeechCaptured(SpeechClip),
}

/// Reassembles arbitrary byte chunks into fixed-size frames.
pub struct AudioFrameRouter {
    frame_bytes: usize,
    pending: Vec<u8>,
    frames_routed: u64,
}

impl AudioFrameRouter {
    pub fn new(format: AudioFormat) -> Self {
        let frame_bytes = format.frame_bytes().max(1);
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes),
            frames_routed: 0,
        }
    }

    /// Append a chunk and return every complete frame it produced, in order.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);
        let whole = self.pending.len() / self.frame_bytes * self.frame_bytes;
        if whole == 0 {
            return Vec::new();
        }

        let frames: Vec<Frame> = self.pending[..whole]
            .chunks_exact(self.frame_bytes)
            .map(|bytes| Frame::from_bytes(bytes.to_vec()))
            .collect();
        self.pending.drain(..whole);
        self.frames_routed += frames.len() as u64;
        frames
    }

    /// Ingest a chunk and dispatch its frames.
    ///
    /// Once the wake word fires, the remaining frames of the same chunk go to
    /// the segmenter so the start of the first utterance is not lost.
    pub fn route(
        &mut self,
        chunk: &[u8],
        mut route: Route,
        wake: &mut dyn WakeWordDetector,
        segmenter: &mut SpeechSegmenter,
    ) -> Vec<RouterEvent> {
        let mut events = Vec::new();
        for frame in self.ingest(chunk) {
            match route {
                Route::Wake => match wake.detect(&frame) {
                    Ok(true) => {
                        debug!("Wake word detected");
                        wake.reset();
                        events.push(RouterEvent::WakeDetected);
                        route = Route::Segmenter;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Wake detector error: {}", e),
                },
                Route::Segmenter => {
                    if let Some(clip) = segmenter.push_frame(&frame) {
                        events.push(RouterEvent::SpeechCaptured(clip));
                    }
                }
            }
        }
        events
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_routed(&self) -> u64 {
        self.frames_routed
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}
