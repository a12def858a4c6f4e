//! The response pipeline: generation through the tier ladder, reasoning
//! stripping, sentence chunking, synthesis and delivery to the output sink.
//!
//! Every await inside a run races the cancellation token, and each audio chunk
//! is written only while holding the sink lock with the token re-checked, so
//! once a barge-in has cancelled the token and taken the lock no further audio
//! from this run can reach the sink.

mod reasoning;
mod sentences;

pub use reasoning::{strip_reasoning, ReasoningFilter};
pub use sentences::SentenceChunker;

use crate::error::CoreError;
use crate::ladder::ModelTierLadder;
use crate::llm::TextGenerator;
use crate::state::{TurnState, TurnStateMachine};
use companion_voice::{OutputSink, SpeechSynthesizer};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The output sink shared by successive response tasks.
pub type SharedSink = Arc<Mutex<Box<dyn OutputSink>>>;

pub fn shared_sink(sink: impl OutputSink + 'static) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// A chunk is spoken only once it is longer than this (trimmed chars)
    pub min_sentence_chars: usize,
    pub reasoning_start: String,
    pub reasoning_end: String,
    /// Spoken when every tier fails
    pub apology: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 30,
            reasoning_start: "<emotion_thought>".to_string(),
            reasoning_end: "</emotion_thought>".to_string(),
            apology: "I'm sorry, I'm having trouble thinking right now.".to_string(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Text was spoken. `tier` is `None` when a fixed fallback was used.
    Spoken { text: String, tier: Option<usize> },
    /// Cancelled before completion; nothing should be recorded.
    Cancelled,
}

impl ResponseOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            ResponseOutcome::Spoken { text, .. } => Some(text),
            ResponseOutcome::Cancelled => None,
        }
    }
}

struct Cancelled;

/// Race `fut` against the token.
async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

enum TierResult {
    Done(String),
    /// Broke after speech began; what was said stands.
    ///
    /// Unlike a failure before the first flush, this does not fall through to
    /// the next tier: the listener already heard part of this answer, and a
    /// fresh one from another model would repeat or contradict it. The tier is
    /// not pinned either.
    Partial(String),
    /// Failed before anything was spoken: try the next tier.
    Failed(CoreError),
}

#[derive(Clone)]
pub struct ResponsePipeline {
    generator: Arc<dyn TextGenerator>,
    tts: Arc<dyn SpeechSynthesizer>,
    output: SharedSink,
    ladder: Arc<ModelTierLadder>,
    state: Arc<TurnStateMachine>,
    config: PipelineConfig,
}

impl ResponsePipeline {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        tts: Arc<dyn SpeechSynthesizer>,
        output: SharedSink,
        ladder: Arc<ModelTierLadder>,
        state: Arc<TurnStateMachine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            tts,
            output,
            ladder,
            state,
            config,
        }
    }

    pub fn output(&self) -> &SharedSink {
        &self.output
    }

    pub fn ladder(&self) -> &Arc<ModelTierLadder> {
        &self.ladder
    }

    /// Stream a response to `prompt` and speak it sentence by sentence.
    pub async fn respond(&self, prompt: &str, cancel: &CancellationToken) -> ResponseOutcome {
        match self.respond_inner(prompt, cancel).await {
            Ok(outcome) => {
                self.finish_speaking();
                outcome
            }
            Err(Cancelled) => {
                debug!(target: "companion::pipeline", "Response cancelled");
                ResponseOutcome::Cancelled
            }
        }
    }

    /// Single-shot generation (greeting, farewell), spoken as a whole.
    pub async fn speak_generated(
        &self,
        prompt: &str,
        fallback: &str,
        cancel: &CancellationToken,
    ) -> ResponseOutcome {
        match self.speak_generated_inner(prompt, fallback, cancel).await {
            Ok(outcome) => {
                self.finish_speaking();
                outcome
            }
            Err(Cancelled) => ResponseOutcome::Cancelled,
        }
    }

    /// Single-shot generation without speaking (session reflection).
    ///
    /// Walks every tier from the top and leaves the ladder untouched, so it can
    /// run after the ladder has been reset for the next session.
    pub async fn generate_text(&self, prompt: &str) -> Option<String> {
        let tiers: Vec<(usize, String)> = (0..self.ladder.len())
            .filter_map(|i| self.ladder.model(i).map(|m| (i, m.to_string())))
            .collect();
        for (tier, model) in tiers {
            match self.generator.generate(prompt, &model).await {
                Ok(text) => {
                    let text = self.strip(&text);
                    if !text.is_empty() {
                        return Some(text);
                    }
                    warn!(target: "companion::pipeline", "Tier {} ({}) returned nothing", tier, model);
                }
                Err(e) => warn!(target: "companion::pipeline", "Tier {} failed: {}", tier, e),
            }
        }
        None
    }

    async fn respond_inner(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ResponseOutcome, Cancelled> {
        let tiers: Vec<(usize, String)> = self
            .ladder
            .remaining()
            .map(|(i, m)| (i, m.to_string()))
            .collect();

        for (tier, model) in tiers {
            match self.stream_tier(prompt, &model, cancel).await? {
                TierResult::Done(text) => {
                    self.ladder.pin(tier);
                    return Ok(ResponseOutcome::Spoken {
                        text,
                        tier: Some(tier),
                    });
                }
                // not pinned: the tier did not complete
                TierResult::Partial(text) => {
                    return Ok(ResponseOutcome::Spoken {
                        text,
                        tier: Some(tier),
                    });
                }
                TierResult::Failed(e) => {
                    warn!(target: "companion::pipeline", "Tier {} ({}) failed: {}", tier, model, e);
                }
            }
        }

        warn!(target: "companion::pipeline", "All model tiers failed, apologising");
        let apology = self.config.apology.clone();
        self.speak_chunk(&apology, cancel).await?;
        Ok(ResponseOutcome::Spoken {
            text: apology,
            tier: None,
        })
    }

    async fn stream_tier(
        &self,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<TierResult, Cancelled> {
        let mut tokens = match or_cancel(cancel, self.generator.generate_stream(prompt, model)).await? {
            Ok(s) => s,
            Err(e) => return Ok(TierResult::Failed(e)),
        };

        let mut filter = ReasoningFilter::new(&self.config.reasoning_start, &self.config.reasoning_end);
        let mut chunker = SentenceChunker::new(self.config.min_sentence_chars);
        let mut visible = String::new();
        let mut spoken_any = false;

        loop {
            let next = or_cancel(cancel, tokens.next()).await?;
            match next {
                None => break,
                Some(Ok(token)) => {
                    let text = filter.push(&token);
                    visible.push_str(&text);
                    if let Some(chunk) = chunker.push(&text) {
                        self.speak_chunk(&chunk, cancel).await?;
                        spoken_any = true;
                    }
                }
                Some(Err(e)) if !spoken_any => return Ok(TierResult::Failed(e)),
                Some(Err(e)) => {
                    // already audible: finish what we have rather than restart mid-answer
                    warn!(target: "companion::pipeline", "Stream from {} broke after speech began: {}", model, e);
                    let tail = filter.finish();
                    visible.push_str(&tail);
                    self.flush(&mut chunker, &tail, cancel).await?;
                    return Ok(TierResult::Partial(visible.trim().to_string()));
                }
            }
        }

        let tail = filter.finish();
        visible.push_str(&tail);
        let visible = visible.trim().to_string();
        if visible.is_empty() {
            return Ok(TierResult::Failed(CoreError::generation(model, "no speakable output")));
        }

        self.flush(&mut chunker, &tail, cancel).await?;
        Ok(TierResult::Done(visible))
    }

    async fn speak_generated_inner(
        &self,
        prompt: &str,
        fallback: &str,
        cancel: &CancellationToken,
    ) -> Result<ResponseOutcome, Cancelled> {
        let tiers: Vec<(usize, String)> = self
            .ladder
            .remaining()
            .map(|(i, m)| (i, m.to_string()))
            .collect();

        let mut chosen = None;
        for (tier, model) in tiers {
            match or_cancel(cancel, self.generator.generate(prompt, &model)).await? {
                Ok(text) => {
                    let text = self.strip(&text);
                    if !text.is_empty() {
                        self.ladder.pin(tier);
                        chosen = Some((text, Some(tier)));
                        break;
                    }
                    warn!(target: "companion::pipeline", "Tier {} ({}) returned nothing", tier, model);
                }
                Err(e) => warn!(target: "companion::pipeline", "Tier {} failed: {}", tier, e),
            }
        }

        let (text, tier) = chosen.unwrap_or_else(|| (fallback.to_string(), None));
        let mut chunker = SentenceChunker::new(self.config.min_sentence_chars);
        self.flush(&mut chunker, &text, cancel).await?;
        Ok(ResponseOutcome::Spoken { text, tier })
    }

    /// Push the last text through the chunker and speak everything left.
    async fn flush(
        &self,
        chunker: &mut SentenceChunker,
        tail: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        if let Some(chunk) = chunker.push(tail) {
            self.speak_chunk(&chunk, cancel).await?;
        }
        if let Some(rest) = chunker.finish() {
            self.speak_chunk(&rest, cancel).await?;
        }
        Ok(())
    }

    fn strip(&self, text: &str) -> String {
        strip_reasoning(text, &self.config.reasoning_start, &self.config.reasoning_end)
            .trim()
            .to_string()
    }

    /// Synthesize one chunk and deliver its audio. Synthesis failures skip the chunk.
    async fn speak_chunk(&self, text: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if self.state.state() != TurnState::Speaking {
            // first audible chunk of this run
            if let Err(e) = self.state.start_speaking() {
                debug!(target: "companion::pipeline", "{}", e);
            }
        }
        info!(target: "companion::pipeline", "🗣️ {}", text);

        let mut audio = match or_cancel(cancel, self.tts.synthesize(text)).await? {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "companion::pipeline", "Synthesis failed, skipping chunk: {}", e);
                return Ok(());
            }
        };

        while let Some(chunk) = or_cancel(cancel, audio.next()).await? {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    warn!(target: "companion::pipeline", "Synthesis stream failed: {}", e);
                    break;
                }
            };
            let mut sink = self.output.lock().await;
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Err(e) = sink.send_audio_chunk(bytes).await {
                warn!(target: "companion::pipeline", "Output sink rejected audio: {}", e);
            }
        }
        Ok(())
    }

    fn finish_speaking(&self) {
        if self.state.state() == TurnState::Speaking {
            if let Err(e) = self.state.finish_speaking() {
                debug!(target: "companion::pipeline", "{}", e);
            }
        }
    }
}
