//! Wake-word capability. Frames reach it only while the companion is idle.

use crate::audio::Frame;
use crate::error::VoiceResult;

/// Acoustic wake-word detector. Runs on the event loop; need not be `Send`.
pub trait WakeWordDetector {
    fn detect(&mut self, frame: &Frame) -> VoiceResult<bool>;

    fn reset(&mut self) {}
}

/// Never fires. Sessions are then started through the manual trigger only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverWake;

impl WakeWordDetector for NeverWake {
    fn detect(&mut self, _frame: &Frame) -> VoiceResult<bool> {
        Ok(false)
    }
}
