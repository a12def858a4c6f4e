//! Integration tests for the capture → frames → utterance path.
//!
//! Hardware tests need a microphone and are ignored by default.

use companion_voice::{
    AudioFormat, AudioFrameRouter, ChannelSink, ControlEvent, Frame, NeverWake, OutputEvent,
    OutputSink, PlaceholderStt, Route, RouterEvent, SegmenterConfig, SilentTts, SpeechClip,
    SpeechSegmenter, SpeechSynthesizer, SttBackend, VoiceActivityDetector, VoiceResult,
    WakeWordDetector,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};

/// Treats any frame containing a non-zero byte as speech.
struct EnergyVad;

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &Frame) -> VoiceResult<bool> {
        Ok(frame.as_bytes().iter().any(|&b| b != 0))
    }
}

/// Fires on a frame filled with 0xAA.
struct PatternWake;

impl WakeWordDetector for PatternWake {
    fn detect(&mut self, frame: &Frame) -> VoiceResult<bool> {
        Ok(frame.as_bytes().iter().all(|&b| b == 0xAA))
    }
}

struct EchoLengthStt {
    seen: Mutex<Vec<usize>>,
}

impl SttBackend for EchoLengthStt {
    fn transcribe(&self, clip: &SpeechClip) -> VoiceResult<String> {
        self.seen.lock().unwrap().push(clip.frame_count);
        Ok(format!("clip of {} frames", clip.frame_count))
    }
}

fn config() -> SegmenterConfig {
    SegmenterConfig {
        silence_threshold_ms: 150,
        max_utterance_ms: 3000,
    }
}

fn frames(byte: u8, count: usize) -> Vec<u8> {
    vec![byte; 960 * count]
}

#[tokio::test]
async fn test_wake_then_utterance_across_odd_chunks() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let format = AudioFormat::default();
    let stt = Arc::new(EchoLengthStt {
        seen: Mutex::new(Vec::new()),
    });
    let mut segmenter =
        SpeechSegmenter::new(Box::new(EnergyVad), stt.clone(), format, config());
    let transcriber = segmenter.transcriber();
    let mut wake = PatternWake;
    let mut router = AudioFrameRouter::new(format);

    // silence, silence, wake pattern, then 4 speech frames and 6 silent ones
    let mut stream = Vec::new();
    stream.extend(frames(0, 2));
    stream.extend(frames(0xAA, 1));
    stream.extend(frames(3, 4));
    stream.extend(frames(0, 6));

    let mut route = Route::Wake;
    let mut woke = false;
    let mut clips = Vec::new();
    for chunk in stream.chunks(701) {
        for event in router.route(chunk, route, &mut wake, &mut segmenter) {
            match event {
                RouterEvent::WakeDetected => {
                    woke = true;
                    route = Route::Segmenter;
                }
                RouterEvent::SpeechCaptured(clip) => clips.push(clip),
            }
        }
    }

    assert!(woke);
    assert_eq!(clips.len(), 1);
    // 150ms threshold => 6 silent frames close the clip
    assert_eq!(clips[0].frame_count, 10);

    let utterance = transcriber
        .transcribe(clips.remove(0))
        .await
        .expect("utterance");
    assert_eq!(utterance.text, "clip of 10 frames");
    assert_eq!(*stt.seen.lock().unwrap(), vec![10]);
    assert_eq!(router.pending_bytes(), 0);
}

#[test]
fn test_never_wake_keeps_router_idle() {
    let format = AudioFormat::default();
    let mut segmenter = SpeechSegmenter::new(
        Box::new(EnergyVad),
        Arc::new(PlaceholderStt::new()),
        format,
        config(),
    );
    let mut router = AudioFrameRouter::new(format);
    let events = router.route(&frames(0xAA, 20), Route::Wake, &mut NeverWake, &mut segmenter);
    assert!(events.is_empty());
    assert_eq!(router.frames_routed(), 20);
    assert!(!segmenter.is_speaking());
}

#[test]
fn test_segmentation_and_output_without_runtime() {
    let mut segmenter = SpeechSegmenter::new(
        Box::new(EnergyVad),
        Arc::new(PlaceholderStt::with_response("good morning")),
        AudioFormat::default(),
        config(),
    );
    let speech = Frame::from_bytes(frames(9, 1));
    let silence = Frame::from_bytes(frames(0, 1));

    assert!(segmenter.push_frame(&speech).is_none());
    let mut clip = None;
    for _ in 0..6 {
        clip = clip.or(segmenter.push_frame(&silence));
    }
    assert_eq!(clip.map(|c| c.frame_count), Some(7));

    let (mut sink, mut rx) = ChannelSink::channel(2);
    tokio_test::block_on(async {
        let mut audio = SilentTts.synthesize("good morning").await.unwrap();
        assert!(audio.next().await.is_none());
        sink.send_control_event(ControlEvent::Interrupt).await.unwrap();
    });
    assert_eq!(rx.try_recv().ok(), Some(OutputEvent::Control(ControlEvent::Interrupt)));
}

#[cfg(feature = "local-audio")]
#[tokio::test]
#[ignore] // Requires audio hardware
async fn test_microphone_capture_fills_ingress() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (tx, mut rx) = companion_voice::ingress_channel(64);
    let capture = companion_voice::AudioCapture::new(AudioFormat::default())
        .expect("Failed to open input device");
    let _stream = capture.start_capture(tx).expect("Failed to start capture");

    let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("no audio within 2s");
    assert!(chunk.is_some());
}
