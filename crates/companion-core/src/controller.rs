//! The session controller: one event loop that owns the turn.
//!
//! ```text
//!  ingress ──▶ AudioFrameRouter ──▶ wake detector          (Idle)
//!                               └─▶ SpeechSegmenter ──▶ Transcriber (blocking pool)
//!                                                            │ Utterance
//!  commands ─────────────────────────────────────────────────┤
//!                                                            ▼
//!                                                    SessionController
//!                                                            │ at most one task
//!                                                            ▼
//!                                                    ResponsePipeline ──▶ OutputSink
//! ```
//!
//! The loop itself never awaits the network: responses run as spawned tasks,
//! transcription runs on the blocking pool, and persistence goes through the
//! [`Journal`]. Barge-in cancels the running task and waits for it to finish
//! before the new utterance is recorded or answered.
//!
//! The controller holds `!Send` detectors, so it runs on a current-thread
//! runtime (or inside a `LocalSet`).

use crate::config::{normalize_phrase, CompanionConfig, DeliberationConfig};
use crate::error::CoreResult;
use crate::journal::{Journal, JournalOp};
use crate::ladder::ModelTierLadder;
use crate::llm::{OpenRouterGenerator, TextGenerator};
use crate::memory::{ConversationMemory, ConversationTurn};
use crate::pipeline::{ResponseOutcome, ResponsePipeline, SharedSink};
use crate::prompt::{PromptBuilder, FALLBACK_FAREWELL, FALLBACK_GREETING};
use crate::session::{SessionContext, SessionHandle};
use crate::state::{TurnState, TurnStateMachine};
use crate::store::{AgentConfig, ConversationStore, MemoryStore, SledStore};
use chrono::Utc;
use companion_voice::{
    create_stt, create_tts, AudioFrameRouter, ControlEvent, IngressReceiver, NeverWake,
    RouterEvent, SpeechClip, SpeechSegmenter, SpeechSynthesizer, SttBackend, Transcriber, Utterance,
    VadConfig, VoiceActivityDetector, WakeWordDetector, WebRtcVad,
};
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests from outside the audio path.
#[derive(Debug)]
pub enum Command {
    /// Start a session as if the wake word had been heard.
    StartSession(oneshot::Sender<StartResult>),
    /// End any active session and stop the loop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartResult {
    Started,
    AlreadyActive,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    StopPhrase,
    SilenceTimeout,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Greeting,
    Reply,
    Farewell,
}

/// The single in-flight response task.
struct PendingResponse {
    kind: TaskKind,
    cancel: CancellationToken,
    handle: JoinHandle<ResponseOutcome>,
}

/// Everything the controller talks to. All of it can be replaced in tests.
pub struct Capabilities {
    pub vad: Box<dyn VoiceActivityDetector>,
    pub wake: Box<dyn WakeWordDetector>,
    pub stt: Arc<dyn SttBackend>,
    pub generator: Arc<dyn TextGenerator>,
    pub tts: Arc<dyn SpeechSynthesizer>,
    pub store: Arc<dyn ConversationStore>,
}

impl Capabilities {
    /// Build the production capabilities from configuration.
    ///
    /// Loading a local transcription model happens here, so call this off the
    /// serving runtime. A store that cannot be opened degrades to memory only.
    pub fn from_config(config: &CompanionConfig) -> CoreResult<Self> {
        let format = config.audio.format();
        let vad = WebRtcVad::new(format, VadConfig { mode: config.audio.vad_mode })?;
        let stt: Arc<dyn SttBackend> = Arc::from(create_stt(&config.stt)?);
        let tts: Arc<dyn SpeechSynthesizer> = Arc::from(create_tts(&config.tts)?);

        let api_key = config.llm.api_key.clone().unwrap_or_default();
        let generator = OpenRouterGenerator::new(
            config.llm.api_url.clone(),
            api_key,
            Duration::from_secs(config.llm.timeout_secs),
        )?
        .with_app_name(config.app_name.clone())
        .with_max_tokens(config.llm.max_tokens);

        let store: Arc<dyn ConversationStore> = match &config.store.path {
            Some(path) if !config.debug => match SledStore::open(path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(target: "companion::store", "Store unavailable, running memory-only: {}", e);
                    Arc::new(MemoryStore::new())
                }
            },
            _ => {
                info!(target: "companion::store", "Running with the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self {
            vad: Box::new(vad),
            wake: Box::new(NeverWake),
            stt,
            generator: Arc::new(generator),
            tts,
            store,
        })
    }
}

enum Event {
    Command(Command),
    CommandsClosed,
    ResponseDone(Result<ResponseOutcome, JoinError>),
    Transcribed(Option<Utterance>),
    Audio(Vec<u8>),
    IngressClosed,
    SilenceTimeout,
}

pub struct SessionController {
    state: Arc<TurnStateMachine>,
    router: AudioFrameRouter,
    wake: Box<dyn WakeWordDetector>,
    segmenter: SpeechSegmenter,
    transcriber: Transcriber,
    transcriptions: FuturesOrdered<LocalBoxFuture<'static, Option<Utterance>>>,
    pipeline: ResponsePipeline,
    ladder: Arc<ModelTierLadder>,
    memory: Arc<Mutex<ConversationMemory>>,
    store: Arc<dyn ConversationStore>,
    journal: Journal,
    journal_writer: JoinHandle<()>,
    prompts: PromptBuilder,
    stop_phrases: Vec<String>,
    deliberation: DeliberationConfig,
    silence_timeout: Duration,
    reflection_timeout: Duration,
    recent_sessions: usize,
    session: Option<SessionHandle>,
    context: SessionContext,
    pending: Option<PendingResponse>,
    reflection: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl SessionController {
    /// Must be called inside a Tokio runtime: the journal writer is spawned here.
    pub fn new(
        config: &CompanionConfig,
        capabilities: Capabilities,
        output: SharedSink,
        state: Arc<TurnStateMachine>,
    ) -> Self {
        let format = config.audio.format();
        let Capabilities {
            vad,
            wake,
            stt,
            generator,
            tts,
            store,
        } = capabilities;

        let segmenter = SpeechSegmenter::new(vad, stt, format, config.segmenter.clone());
        let transcriber = segmenter.transcriber();
        let ladder = Arc::new(ModelTierLadder::new(config.llm.models.clone()));
        let pipeline = ResponsePipeline::new(
            generator,
            tts,
            output,
            Arc::clone(&ladder),
            Arc::clone(&state),
            config.pipeline.clone(),
        );
        let (journal, journal_writer) = Journal::spawn(Arc::clone(&store));

        Self {
            state,
            router: AudioFrameRouter::new(format),
            wake,
            segmenter,
            transcriber,
            transcriptions: FuturesOrdered::new(),
            pipeline,
            ladder,
            memory: Arc::new(Mutex::new(ConversationMemory::new(config.session.memory_turns))),
            store,
            journal,
            journal_writer,
            prompts: PromptBuilder::new(
                config.app_name.clone(),
                config.pipeline.reasoning_start.clone(),
                config.pipeline.reasoning_end.clone(),
            ),
            stop_phrases: config.normalized_stop_phrases(),
            deliberation: config.deliberation.clone(),
            silence_timeout: config.session.silence_timeout(),
            reflection_timeout: config.session.reflection_timeout(),
            recent_sessions: config.session.recent_sessions,
            session: None,
            context: SessionContext::default(),
            pending: None,
            reflection: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> Arc<TurnStateMachine> {
        Arc::clone(&self.state)
    }

    pub fn memory(&self) -> Arc<Mutex<ConversationMemory>> {
        Arc::clone(&self.memory)
    }

    pub fn ladder(&self) -> Arc<ModelTierLadder> {
        Arc::clone(&self.ladder)
    }

    /// Drive the loop until shutdown or until the ingress queue closes.
    pub async fn run(mut self, mut ingress: IngressReceiver, mut commands: mpsc::Receiver<Command>) {
        info!(target: "companion::controller", "🎧 Session controller running");
        let mut commands_open = true;

        loop {
            let silence_armed = self.silence_armed();
            let deadline = self.last_activity + self.silence_timeout;

            let event = tokio::select! {
                biased;
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(c) => Event::Command(c),
                    None => Event::CommandsClosed,
                },
                done = wait_pending(&mut self.pending) => Event::ResponseDone(done),
                Some(utterance) = self.transcriptions.next(), if !self.transcriptions.is_empty() => {
                    Event::Transcribed(utterance)
                }
                chunk = ingress.recv() => match chunk {
                    Some(bytes) => Event::Audio(bytes),
                    None => Event::IngressClosed,
                },
                _ = tokio::time::sleep_until(deadline), if silence_armed => Event::SilenceTimeout,
            };

            match event {
                Event::Command(Command::StartSession(reply)) => {
                    let result = self.start_session().await;
                    // the caller may have stopped waiting
                    let _ = reply.send(result);
                }
                Event::Command(Command::Shutdown) => break,
                Event::CommandsClosed => commands_open = false,
                Event::ResponseDone(done) => self.on_response_done(done).await,
                Event::Transcribed(Some(utterance)) => self.on_utterance(utterance).await,
                Event::Transcribed(None) => self.touch(),
                Event::Audio(bytes) => self.on_audio(&bytes).await,
                Event::IngressClosed => {
                    info!(target: "companion::controller", "Ingress closed");
                    break;
                }
                Event::SilenceTimeout => {
                    info!(
                        target: "companion::controller",
                        "⏱️ No speech for {:?}, ending session",
                        self.silence_timeout
                    );
                    self.end_session(EndReason::SilenceTimeout).await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_audio(&mut self, bytes: &[u8]) {
        let route = self.state.state().route();
        let events = self
            .router
            .route(bytes, route, self.wake.as_mut(), &mut self.segmenter);
        if self.segmenter.is_speaking() {
            self.touch();
        }

        for event in events {
            match event {
                RouterEvent::WakeDetected => {
                    info!(target: "companion::controller", "👂 Wake word detected");
                    self.start_session().await;
                }
                RouterEvent::SpeechCaptured(clip) => self.queue_transcription(clip),
            }
        }
    }

    fn queue_transcription(&mut self, clip: SpeechClip) {
        debug!(
            target: "companion::controller",
            "Transcribing {} frames ({:?})",
            clip.frame_count,
            clip.end
        );
        let transcriber = self.transcriber.clone();
        self.transcriptions
            .push_back(Box::pin(async move { transcriber.transcribe(clip).await }));
    }

    /// Open a session: load context, greet, listen.
    async fn start_session(&mut self) -> StartResult {
        if self.state.state().in_session() {
            debug!(target: "companion::controller", "Session already active");
            return StartResult::AlreadyActive;
        }
        if let Err(e) = self.state.wake_detected() {
            warn!(target: "companion::controller", "{}", e);
            return StartResult::AlreadyActive;
        }

        self.context = self.load_context().await;
        let session = SessionHandle::start();
        info!(target: "companion::controller", session = %session.id, "🌅 Session started");
        self.journal.record(JournalOp::StartSession(session.clone()));
        self.session = Some(session);
        self.touch();

        let prompt = self.prompts.greeting(&self.context, Utc::now());
        self.spawn_spoken(TaskKind::Greeting, prompt, FALLBACK_GREETING);
        StartResult::Started
    }

    async fn load_context(&self) -> SessionContext {
        let agent = match self.store.agent_config().await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(target: "companion::store", "Persistence failure loading agent config: {}", e);
                AgentConfig::default()
            }
        };
        let mut context = SessionContext::from_agent(agent);
        match self.store.recent_session_gists(self.recent_sessions).await {
            Ok(gists) => context.recent_sessions = gists,
            Err(e) => warn!(target: "companion::store", "Persistence failure loading history: {}", e),
        }
        match self.store.last_session_ended_at().await {
            Ok(at) => context.last_session_ended_at = at,
            Err(e) => warn!(target: "companion::store", "Persistence failure loading history: {}", e),
        }
        match self.store.total_sessions().await {
            Ok(n) => context.total_sessions = n,
            Err(e) => warn!(target: "companion::store", "Persistence failure loading history: {}", e),
        }
        context
    }

    async fn on_utterance(&mut self, utterance: Utterance) {
        if !self.state.state().in_session() {
            debug!(target: "companion::controller", "Dropping utterance outside a session: {:?}", utterance.text);
            return;
        }
        self.touch();
        let text = utterance.text.trim().to_string();

        // cancel strictly before the new turn is recorded
        if self.pending.is_some() {
            info!(target: "companion::controller", "✋ Barge-in: {:?}", text);
            self.interrupt().await;
        }

        if self.is_stop_phrase(&text) {
            info!(target: "companion::controller", "👋 Stop phrase {:?}", text);
            let history = self.memory.lock().await.snapshot();
            self.remember(ConversationTurn::user(text.clone())).await;
            let prompt = self.prompts.farewell(&self.context, &history, &text);
            self.spawn_spoken(TaskKind::Farewell, prompt, FALLBACK_FAREWELL);
            return;
        }

        let history = self.memory.lock().await.snapshot();
        let prompt = self.prompts.response(&self.context, &history, &text);
        self.remember(ConversationTurn::user(text.clone())).await;

        if self.state.state() == TurnState::Awake {
            if let Err(e) = self.state.start_thinking() {
                warn!(target: "companion::controller", "{}", e);
            }
        }

        let delay = self.deliberation_delay(text.chars().count());
        debug!(target: "companion::controller", "Deliberating for {:?}", delay);
        let pipeline = self.pipeline.clone();
        self.spawn(TaskKind::Reply, move |cancel| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ResponseOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            pipeline.respond(&prompt, &cancel).await
        });
    }

    fn is_stop_phrase(&self, text: &str) -> bool {
        let normalized = normalize_phrase(text);
        self.stop_phrases.iter().any(|p| *p == normalized)
    }

    fn deliberation_delay(&self, chars: usize) -> Duration {
        let (lo, hi) = self.deliberation.jitter_range();
        let jitter = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        self.deliberation.delay_for(chars, jitter)
    }

    fn spawn_spoken(&mut self, kind: TaskKind, prompt: String, fallback: &'static str) {
        let pipeline = self.pipeline.clone();
        self.spawn(kind, move |cancel| async move {
            pipeline.speak_generated(&prompt, fallback, &cancel).await
        });
    }

    fn spawn<F, Fut>(&mut self, kind: TaskKind, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ResponseOutcome> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        debug!(target: "companion::controller", "Started {:?} task", kind);
        self.pending = Some(PendingResponse { kind, cancel, handle });
    }

    /// Cancel the in-flight task and wait for it to stop.
    ///
    /// The sink lock is held while cancelling, so no audio from the old task
    /// can land after the interrupt signal.
    async fn interrupt(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        {
            let mut sink = self.pipeline.output().lock().await;
            pending.cancel.cancel();
            if let Err(e) = sink.send_control_event(ControlEvent::Interrupt).await {
                warn!(target: "companion::controller", "Could not signal interrupt: {}", e);
            }
        }

        match pending.handle.await {
            // finished before the cancel landed; it was heard, keep it
            Ok(outcome) => {
                if let Some(text) = outcome.text() {
                    debug!(
                        target: "companion::controller",
                        "{:?} finished before the interrupt ({} chars)",
                        pending.kind,
                        text.chars().count()
                    );
                }
                self.record_outcome(pending.kind, outcome).await
            }
            Err(e) => warn!(target: "companion::controller", "{:?} task failed: {}", pending.kind, e),
        }

        if self.state.state() == TurnState::Speaking {
            if let Err(e) = self.state.finish_speaking() {
                warn!(target: "companion::controller", "{}", e);
            }
        }
    }

    async fn on_response_done(&mut self, done: Result<ResponseOutcome, JoinError>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match done {
            Ok(outcome) => self.record_outcome(pending.kind, outcome).await,
            Err(e) => {
                warn!(target: "companion::controller", "{:?} task failed: {}", pending.kind, e);
                self.recover_state();
            }
        }
        self.touch();

        if pending.kind == TaskKind::Farewell {
            self.end_session(EndReason::StopPhrase).await;
        }
    }

    async fn record_outcome(&mut self, kind: TaskKind, outcome: ResponseOutcome) {
        match outcome {
            ResponseOutcome::Spoken { text, tier } => {
                debug!(target: "companion::controller", "{:?} spoken (tier {:?})", kind, tier);
                self.remember(ConversationTurn::assistant(text)).await;
            }
            ResponseOutcome::Cancelled => {
                debug!(target: "companion::controller", "{:?} cancelled, nothing recorded", kind)
            }
        }
    }

    /// Bring the state back to listening after a task died without finishing.
    fn recover_state(&self) {
        let mut result = Ok(TurnState::Awake);
        if self.state.state() == TurnState::Thinking {
            result = self.state.start_speaking();
        }
        if result.is_ok() && self.state.state() == TurnState::Speaking {
            result = self.state.finish_speaking();
        }
        if let Err(e) = result {
            warn!(target: "companion::controller", "{}", e);
        }
    }

    async fn remember(&mut self, turn: ConversationTurn) {
        if let Some(session) = &self.session {
            self.journal.record(JournalOp::Message(session.id, turn.clone()));
        }
        self.memory.lock().await.push(turn);
    }

    /// Close the session: persist, reflect, forget, go idle.
    async fn end_session(&mut self, reason: EndReason) {
        self.interrupt().await;

        let turns = {
            let mut memory = self.memory.lock().await;
            let turns = memory.snapshot();
            memory.clear();
            turns
        };

        if let Some(mut session) = self.session.take() {
            session.close();
            info!(
                target: "companion::controller",
                session = %session.id,
                turns = turns.len(),
                frames = self.router.frames_routed(),
                "🌙 Session ended ({:?})",
                reason
            );
            self.journal.record(JournalOp::EndSession(session));
            if !turns.is_empty() {
                self.spawn_reflection(&turns);
            }
        }

        self.ladder.reset();
        self.segmenter.reset();
        self.wake.reset();
        self.transcriptions = FuturesOrdered::new();

        if self.state.state().in_session() {
            if let Err(e) = self.state.session_end() {
                warn!(target: "companion::controller", "{}", e);
            }
        }
    }

    fn spawn_reflection(&mut self, turns: &[ConversationTurn]) {
        let prompt = self.prompts.reflection(&self.context, turns);
        let pipeline = self.pipeline.clone();
        let journal = self.journal.clone();
        let timeout = self.reflection_timeout;

        let previous = self.reflection.replace(tokio::spawn(async move {
            match tokio::time::timeout(timeout, pipeline.generate_text(&prompt)).await {
                Ok(Some(learnings)) => {
                    info!(target: "companion::controller", "🧠 Updated learnings");
                    journal.record(JournalOp::Learnings(learnings));
                }
                Ok(None) => warn!(target: "companion::controller", "Reflection produced nothing"),
                Err(_) => warn!(target: "companion::controller", "Reflection timed out after {:?}", timeout),
            }
        }));
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!(target: "companion::controller", "Previous reflection still running");
            }
        }
    }

    async fn shutdown(mut self) {
        if self.session.is_some() || self.state.state().in_session() {
            self.end_session(EndReason::Shutdown).await;
        }
        if let Some(reflection) = self.reflection.take() {
            if let Err(e) = reflection.await {
                warn!(target: "companion::controller", "Reflection task failed: {}", e);
            }
        }

        let Self {
            journal,
            journal_writer,
            ..
        } = self;
        drop(journal);
        if let Err(e) = journal_writer.await {
            warn!(target: "companion::store", "Journal writer failed: {}", e);
        }
        info!(target: "companion::controller", "Session controller stopped");
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Quiet time only counts while listening with nothing in flight.
    fn silence_armed(&self) -> bool {
        self.state.state() == TurnState::Awake
            && self.pending.is_none()
            && self.transcriptions.is_empty()
            && !self.segmenter.is_speaking()
    }
}

async fn wait_pending(pending: &mut Option<PendingResponse>) -> Result<ResponseOutcome, JoinError> {
    match pending {
        Some(p) => (&mut p.handle).await,
        None => std::future::pending().await,
    }
}
