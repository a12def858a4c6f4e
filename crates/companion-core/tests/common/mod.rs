//! Scripted capabilities and a harness that runs a controller on virtual time.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use companion_core::{
    shared_sink, AgentConfig, Capabilities, Command, CompanionConfig, ConversationMemory,
    ConversationStore, ConversationTurn, CoreError, CoreResult, DeliberationConfig, ModelTierLadder,
    SessionController, SessionGist, SessionHandle, StartResult, TextGenerator, TokenStream,
    Transition, TurnEvent, TurnStateMachine,
};
use companion_voice::{
    ingress_channel, AudioChunkStream, ChannelSink, Frame, IngressSender, OutputEvent,
    SpeechClip, SpeechSynthesizer, SttBackend, VoiceActivityDetector, VoiceError, VoiceResult,
    WakeWordDetector,
};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const FRAME_BYTES: usize = 960;
pub const GREETING: &str = "Hi! Good to hear from you again.";
pub const FAREWELL: &str = "Goodbye for now, take care!";
pub const LEARNINGS: &str = "Enjoys bedtime stories.";

pub fn frames(byte: u8, count: usize) -> Vec<u8> {
    vec![byte; FRAME_BYTES * count]
}

/// Any non-zero byte is speech.
pub struct EnergyVad;

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &Frame) -> VoiceResult<bool> {
        Ok(frame.as_bytes().iter().any(|&b| b != 0))
    }
}

/// Fires on a frame filled with 0xAA.
pub struct PatternWake;

impl WakeWordDetector for PatternWake {
    fn detect(&mut self, frame: &Frame) -> VoiceResult<bool> {
        Ok(frame.as_bytes().iter().all(|&b| b == 0xAA))
    }
}

/// Returns queued transcripts in order; empty once the queue runs dry.
#[derive(Default)]
pub struct ScriptedStt {
    texts: Mutex<VecDeque<String>>,
}

impl ScriptedStt {
    pub fn push(&self, text: &str) {
        self.texts.lock().unwrap().push_back(text.to_string());
    }
}

impl SttBackend for ScriptedStt {
    fn transcribe(&self, _clip: &SpeechClip) -> VoiceResult<String> {
        Ok(self.texts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// What one streaming call produces.
pub enum Script {
    Tokens(Vec<&'static str>),
    /// Emit the tokens, then never finish.
    Hang(Vec<&'static str>),
    /// Emit the tokens, then fail.
    Break(Vec<&'static str>),
}

#[derive(Default)]
pub struct ScriptedGenerator {
    failing: Vec<String>,
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn failing(models: &[&str]) -> Self {
        Self {
            failing: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// `(model, prompt)` for every call, streaming or not.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, prompt: &str, model: &str) -> CoreResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string()));
        if self.failing.iter().any(|m| m == model) {
            return Err(CoreError::generation(model, "503 service unavailable"));
        }
        Ok(())
    }
}

fn token_stream(tokens: Vec<&'static str>) -> stream::Iter<std::vec::IntoIter<CoreResult<String>>> {
    let items: Vec<CoreResult<String>> = tokens.into_iter().map(|t| Ok(t.to_string())).collect();
    stream::iter(items)
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate_stream(&self, prompt: &str, model: &str) -> CoreResult<TokenStream> {
        self.record(prompt, model)?;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Tokens(vec!["Okay."]));
        Ok(match script {
            Script::Tokens(tokens) => token_stream(tokens).boxed(),
            Script::Hang(tokens) => token_stream(tokens).chain(stream::pending()).boxed(),
            Script::Break(tokens) => token_stream(tokens)
                .chain(stream::once(async {
                    Err(CoreError::generation("scripted", "connection reset"))
                }))
                .boxed(),
        })
    }

    async fn generate(&self, prompt: &str, model: &str) -> CoreResult<String> {
        self.record(prompt, model)?;
        let text = if prompt.contains("long-term notes") {
            LEARNINGS
        } else if prompt.contains("goodbye") {
            FAREWELL
        } else {
            GREETING
        };
        Ok(text.to_string())
    }
}

/// Emits each chunk's text as its "audio" so tests can see what was spoken.
#[derive(Default)]
pub struct RecordingTts {
    spoken: Mutex<Vec<String>>,
    fail_on: Option<&'static str>,
}

impl RecordingTts {
    pub fn failing_on(marker: &'static str) -> Self {
        Self {
            fail_on: Some(marker),
            ..Default::default()
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioChunkStream> {
        if self.fail_on.map(|m| text.contains(m)).unwrap_or(false) {
            return Err(VoiceError::Tts("voice unavailable".to_string()));
        }
        self.spoken.lock().unwrap().push(text.to_string());
        let audio: Vec<VoiceResult<Vec<u8>>> = vec![Ok(text.as_bytes().to_vec())];
        Ok(stream::iter(audio).boxed())
    }
}

/// Every call fails.
pub struct FailingStore;

fn down<T>() -> CoreResult<T> {
    Err(CoreError::Persistence("database is down".to_string()))
}

#[async_trait]
impl ConversationStore for FailingStore {
    async fn start_session(&self, _session: &SessionHandle) -> CoreResult<()> {
        down()
    }

    async fn end_session(&self, _session: &SessionHandle) -> CoreResult<()> {
        down()
    }

    async fn log_message(&self, _session_id: Uuid, _turn: &ConversationTurn) -> CoreResult<()> {
        down()
    }

    async fn agent_config(&self) -> CoreResult<AgentConfig> {
        down()
    }

    async fn update_learnings(&self, _learnings: &str) -> CoreResult<()> {
        down()
    }

    async fn recent_session_gists(&self, _limit: usize) -> CoreResult<Vec<SessionGist>> {
        down()
    }

    async fn last_session_ended_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        down()
    }

    async fn total_sessions(&self) -> CoreResult<u64> {
        down()
    }
}

pub fn test_config() -> CompanionConfig {
    let mut config = CompanionConfig::default();
    config.app_name = "Ava".to_string();
    config.debug = true;
    config.llm.models = vec!["primary".to_string(), "backup".to_string()];
    // 3 frames of 30ms, so 4 silent frames close an utterance
    config.segmenter.silence_threshold_ms = 90;
    config.session.silence_timeout_secs = 30;
    config.deliberation = DeliberationConfig::default();
    config
}

pub struct Setup {
    pub config: CompanionConfig,
    pub generator: Arc<ScriptedGenerator>,
    pub tts: Arc<RecordingTts>,
    pub store: Arc<dyn ConversationStore>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: test_config(),
            generator: Arc::new(ScriptedGenerator::default()),
            tts: Arc::new(RecordingTts::default()),
            store: Arc::new(companion_core::MemoryStore::new()),
        }
    }
}

pub struct Harness {
    pub ingress: IngressSender,
    pub commands: mpsc::Sender<Command>,
    pub output: mpsc::Receiver<OutputEvent>,
    pub transitions: broadcast::Receiver<Transition>,
    pub state: Arc<TurnStateMachine>,
    pub memory: Arc<tokio::sync::Mutex<ConversationMemory>>,
    pub ladder: Arc<ModelTierLadder>,
    pub generator: Arc<ScriptedGenerator>,
    pub tts: Arc<RecordingTts>,
    pub stt: Arc<ScriptedStt>,
    task: JoinHandle<()>,
}

impl Harness {
    /// Spawn a controller on the current `LocalSet`.
    pub fn start(setup: Setup) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let stt = Arc::new(ScriptedStt::default());
        let state = Arc::new(TurnStateMachine::new());
        let transitions = state.transitions();
        let (sink, output) = ChannelSink::channel(512);
        let capabilities = Capabilities {
            vad: Box::new(EnergyVad),
            wake: Box::new(PatternWake),
            stt: stt.clone(),
            generator: setup.generator.clone(),
            tts: setup.tts.clone(),
            store: setup.store,
        };
        let controller =
            SessionController::new(&setup.config, capabilities, shared_sink(sink), Arc::clone(&state));
        let memory = controller.memory();
        let ladder = controller.ladder();

        let (ingress, ingress_rx) = ingress_channel(64);
        let (commands, commands_rx) = mpsc::channel(8);
        let task = tokio::task::spawn_local(controller.run(ingress_rx, commands_rx));

        Self {
            ingress,
            commands,
            output,
            transitions,
            state,
            memory,
            ladder,
            generator: setup.generator,
            tts: setup.tts,
            stt,
            task,
        }
    }

    pub async fn start_session(&self) -> StartResult {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::StartSession(tx)).await.unwrap();
        rx.await.unwrap()
    }

    pub async fn send_audio(&self, bytes: Vec<u8>) {
        self.ingress.send(bytes).await.unwrap();
    }

    /// Speak an utterance the STT will transcribe as `text`.
    pub async fn say(&self, text: &str) {
        self.stt.push(text);
        let mut audio = frames(0x11, 3);
        audio.extend(frames(0, 4));
        self.send_audio(audio).await;
    }

    /// Wait for the next transition caused by `event`.
    pub async fn wait_for(&mut self, event: TurnEvent) -> Transition {
        loop {
            let t = self.transitions.recv().await.unwrap();
            if t.event == event {
                return t;
            }
        }
    }

    /// Start a session and wait for the greeting to finish.
    pub async fn greeted(&mut self) {
        assert_eq!(self.start_session().await, StartResult::Started);
        self.wait_for(TurnEvent::FinishSpeaking).await;
        settle().await;
    }

    /// Audio received so far, as text.
    pub fn drain_audio(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Audio(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                OutputEvent::Control(_) => None,
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Ok(e) = self.output.try_recv() {
            events.push(e);
        }
        events
    }

    pub async fn memory_len(&self) -> usize {
        self.memory.lock().await.len()
    }

    pub async fn shutdown(self) {
        self.commands.send(Command::Shutdown).await.unwrap();
        self.task.await.unwrap();
    }
}

/// Let every ready task run. On paused time this returns once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
