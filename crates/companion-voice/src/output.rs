//! Output sinks: where synthesized audio and playback control go.
//!
//! The controller shares one sink between response tasks behind an async
//! mutex; a task holds the lock only for a single send.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Playback control signals for the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    /// Discard any queued audio immediately (barge-in).
    #[serde(rename = "stop")]
    Interrupt,
}

impl ControlEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlEvent::Interrupt => "stop",
        }
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Audio(Vec<u8>),
    Control(ControlEvent),
}

#[async_trait]
pub trait OutputSink: Send {
    async fn send_audio_chunk(&mut self, chunk: Vec<u8>) -> VoiceResult<()>;

    async fn send_control_event(&mut self, event: ControlEvent) -> VoiceResult<()>;
}

/// Forwards events over an mpsc channel (WebSocket egress, tests).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutputEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutputEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn send_audio_chunk(&mut self, chunk: Vec<u8>) -> VoiceResult<()> {
        self.tx
            .send(OutputEvent::Audio(chunk))
            .await
            .map_err(|_| VoiceError::SinkClosed)
    }

    async fn send_control_event(&mut self, event: ControlEvent) -> VoiceResult<()> {
        self.tx
            .send(OutputEvent::Control(event))
            .await
            .map_err(|_| VoiceError::SinkClosed)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn send_audio_chunk(&mut self, _chunk: Vec<u8>) -> VoiceResult<()> {
        Ok(())
    }

    async fn send_control_event(&mut self, _event: ControlEvent) -> VoiceResult<()> {
        Ok(())
    }
}

#[cfg(feature = "local-audio")]
mod playback {
    use super::*;
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, Sink};
    use std::sync::mpsc as std_mpsc;
    use tracing::{info, warn};

    enum PlaybackCommand {
        Play(Vec<u8>),
        Stop,
    }

    /// Plays raw PCM on the default output device.
    ///
    /// The rodio stream is not `Send`, so it lives on its own thread and this
    /// handle only posts commands to it.
    pub struct LocalPlayback {
        tx: std_mpsc::Sender<PlaybackCommand>,
    }

    impl LocalPlayback {
        pub fn new(sample_rate: u32) -> VoiceResult<Self> {
            let (tx, rx) = std_mpsc::channel::<PlaybackCommand>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

            std::thread::Builder::new()
                .name("companion-playback".to_string())
                .spawn(move || {
                    let (_stream, handle) = match OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                            return;
                        }
                    };
                    let mut sink = match Sink::try_new(&handle) {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    info!("🔈 Local playback ready ({}Hz)", sample_rate);

                    while let Ok(cmd) = rx.recv() {
                        match cmd {
                            PlaybackCommand::Play(pcm) => {
                                let samples = crate::audio::pcm_bytes_to_i16(&pcm);
                                sink.append(SamplesBuffer::new(1, sample_rate, samples));
                            }
                            PlaybackCommand::Stop => {
                                sink.stop();
                                // a stopped sink does not resume; start a fresh one
                                match Sink::try_new(&handle) {
                                    Ok(s) => sink = s,
                                    Err(e) => {
                                        warn!("Playback sink recreate failed: {}", e);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                })?;

            ready_rx
                .recv()
                .map_err(|_| VoiceError::Playback("playback thread exited".to_string()))??;
            Ok(Self { tx })
        }
    }

    #[async_trait]
    impl OutputSink for LocalPlayback {
        async fn send_audio_chunk(&mut self, chunk: Vec<u8>) -> VoiceResult<()> {
            self.tx
                .send(PlaybackCommand::Play(chunk))
                .map_err(|_| VoiceError::SinkClosed)
        }

        async fn send_control_event(&mut self, event: ControlEvent) -> VoiceResult<()> {
            match event {
                ControlEvent::Interrupt => self
                    .tx
                    .send(PlaybackCommand::Stop)
                    .map_err(|_| VoiceError::SinkClosed),
            }
        }
    }
}

#[cfg(feature = "local-audio")]
pub use playback::LocalPlayback;
